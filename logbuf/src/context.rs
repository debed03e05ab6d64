//! Process-level collaborators of a log buffer.
//!
//! A [`Context`] is constructed once, before the first buffer is opened, and passed by reference
//! to [`LogBuffer::open`](crate::LogBuffer::open). Buffers copy what they need out of it; the
//! context may be dropped while they are still in use. There is no global state.
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug)]
pub struct Context {
    clock: fn() -> u64,
    mapping_dir: PathBuf,
}

/// Milliseconds since the unix epoch, by the system clock.
pub fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_millis() as u64)
}

impl Context {
    /// A context placing file-backed arenas below `mapping_dir`.
    pub fn new(mapping_dir: impl Into<PathBuf>) -> Self {
        Context {
            clock: system_clock,
            mapping_dir: mapping_dir.into(),
        }
    }

    /// Replace the wall clock, e.g. with a fixed one in tests.
    pub fn with_clock(self, clock: fn() -> u64) -> Self {
        Context { clock, ..self }
    }

    pub fn clock(&self) -> fn() -> u64 {
        self.clock
    }

    pub fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    pub fn mapping_dir(&self) -> &Path {
        &self.mapping_dir
    }

    /// The file a buffer named `name` is mapped from.
    pub fn mapping_path(&self, name: &str) -> PathBuf {
        self.mapping_dir.join(format!("{name}.mmap"))
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(std::env::temp_dir().join("logbuf"))
    }
}

#[test]
fn injected_clock() {
    let ctx = Context::new("/var/lib/app").with_clock(|| 42);

    assert_eq!(ctx.now_ms(), 42);
    assert_eq!(ctx.mapping_path("main"), Path::new("/var/lib/app/main.mmap"));
    assert!(system_clock() > 1_600_000_000_000);
}
