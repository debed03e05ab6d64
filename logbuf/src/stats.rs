use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use logbuf_state::ResultCode;

/// Counters of the results a buffer handed out, by code.
#[derive(Default)]
pub(crate) struct Stats {
    counts: [AtomicU64; ResultCode::COUNT],
}

/// A copy of the counters at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    counts: [u64; ResultCode::COUNT],
}

impl Stats {
    pub(crate) fn record(&self, code: ResultCode) {
        self.counts[code as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counts: self.counts.each_ref().map(|c| c.load(Ordering::Relaxed)),
        }
    }
}

impl StatsSnapshot {
    pub fn get(&self, code: ResultCode) -> u64 {
        self.counts[code as usize]
    }

    /// Codes with a non-zero count.
    pub fn iter(&self) -> impl Iterator<Item = (ResultCode, u64)> + '_ {
        ResultCode::ALL
            .into_iter()
            .map(|code| (code, self.get(code)))
            .filter(|&(_, count)| count > 0)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (code, count) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }

            write!(f, "{code}={count}")?;
            first = false;
        }

        Ok(())
    }
}

#[test]
fn counts_by_code() {
    let stats = Stats::default();
    stats.record(ResultCode::Success);
    stats.record(ResultCode::Success);
    stats.record(ResultCode::NotEnoughSpace);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.get(ResultCode::Success), 2);
    assert_eq!(snapshot.get(ResultCode::Empty), 0);
    assert_eq!(snapshot.to_string(), "success=2 not_enough_space=1");
}
