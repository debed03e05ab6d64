use std::path::PathBuf;
use std::time::Duration;

use crate::OpenError;

/// What a producer does when no block has room for its entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPolicy {
    /// Fail the allocation with `NotEnoughSpace`.
    DiscardWhenFull,
    /// Wait until the consumer frees space.
    BlockWhenFull,
    /// Link another block, as long as the arena has free ones.
    AutoExpandWhenFull,
}

/// How much the buffer may lose and where it keeps its bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReliabilityLevel {
    /// Never block a producer, entries may be discarded.
    Low,
    /// Never discard silently. Anonymous memory.
    Normal,
    /// As `Normal`, and backed by a shared file mapping that survives a crash of the process.
    High,
}

#[derive(Clone, Debug)]
pub struct LogBufferConfig {
    /// Name of the log. Names the mapping file and is part of the arena fingerprint.
    pub name: String,
    /// Category names of the log, part of the arena fingerprint.
    pub categories: Vec<String>,
    pub max_blocks_count: u16,
    /// Bytes shared by all blocks.
    pub total_size: u64,
    /// Blocks linked at open under `AutoExpandWhenFull`. Other policies link all blocks.
    pub initial_blocks: u16,
    pub policy: MemoryPolicy,
    pub reliability: ReliabilityLevel,
    /// Upper bound of a wait under `BlockWhenFull`, after which `WaitAndRetry` is returned.
    pub block_timeout: Option<Duration>,
    /// File to map instead of the one in the mapping directory of the context.
    pub backing_path: Option<PathBuf>,
    /// Fail the open instead of reinitializing an existing arena that can not be recovered.
    pub reject_mismatch: bool,
    /// Bytes of the oversize arena, for entries larger than a block. Zero disables it.
    pub oversize_size: u64,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        LogBufferConfig {
            name: "default".into(),
            categories: Vec::new(),
            max_blocks_count: 16,
            total_size: 1 << 20,
            initial_blocks: 1,
            policy: MemoryPolicy::AutoExpandWhenFull,
            reliability: ReliabilityLevel::Normal,
            block_timeout: None,
            backing_path: None,
            reject_mismatch: false,
            oversize_size: 1 << 20,
        }
    }
}

impl LogBufferConfig {
    pub fn validate(&self) -> Result<(), OpenError> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
            && !self.name.starts_with('.');

        if !valid_name {
            return Err(OpenError::Config(format!(
                "log name {:?} is not usable as a file name",
                self.name
            )));
        }

        if self.initial_blocks > self.max_blocks_count {
            return Err(OpenError::Config(format!(
                "{} initial blocks exceed the maximum of {}",
                self.initial_blocks, self.max_blocks_count
            )));
        }

        if self.categories.len() > u32::MAX as usize {
            return Err(OpenError::Config("too many categories".into()));
        }

        Ok(())
    }

    /// The policy after the reliability level had its say.
    ///
    /// Low reliability never blocks, higher ones never discard.
    pub fn effective_policy(&self) -> MemoryPolicy {
        match (self.policy, self.reliability) {
            (MemoryPolicy::BlockWhenFull, ReliabilityLevel::Low) => MemoryPolicy::DiscardWhenFull,
            (MemoryPolicy::DiscardWhenFull, ReliabilityLevel::Normal | ReliabilityLevel::High) => {
                MemoryPolicy::BlockWhenFull
            }
            (policy, _) => policy,
        }
    }

    /// The policy of an auto-expanding buffer that ran out of blocks.
    pub fn expansion_fallback(&self) -> MemoryPolicy {
        match self.reliability {
            ReliabilityLevel::Low => MemoryPolicy::DiscardWhenFull,
            ReliabilityLevel::Normal | ReliabilityLevel::High => MemoryPolicy::BlockWhenFull,
        }
    }
}

#[test]
fn reliability_overrides_policy() {
    let mut cfg = LogBufferConfig {
        policy: MemoryPolicy::BlockWhenFull,
        reliability: ReliabilityLevel::Low,
        ..LogBufferConfig::default()
    };
    assert_eq!(cfg.effective_policy(), MemoryPolicy::DiscardWhenFull);
    assert_eq!(cfg.expansion_fallback(), MemoryPolicy::DiscardWhenFull);

    cfg.policy = MemoryPolicy::DiscardWhenFull;
    cfg.reliability = ReliabilityLevel::High;
    assert_eq!(cfg.effective_policy(), MemoryPolicy::BlockWhenFull);

    cfg.policy = MemoryPolicy::AutoExpandWhenFull;
    assert_eq!(cfg.effective_policy(), MemoryPolicy::AutoExpandWhenFull);
    assert_eq!(cfg.expansion_fallback(), MemoryPolicy::BlockWhenFull);
}

#[test]
fn names_must_be_file_names() {
    let mut cfg = LogBufferConfig::default();
    assert!(cfg.validate().is_ok());

    for bad in ["", "../up", ".hidden", "a/b"] {
        cfg.name = bad.into();
        assert!(cfg.validate().is_err(), "{bad:?}");
    }

    cfg.name = "app.main-1".into();
    cfg.initial_blocks = cfg.max_blocks_count + 1;
    assert!(cfg.validate().is_err());
}
