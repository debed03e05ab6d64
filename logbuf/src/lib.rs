//! A crash-resilient buffer for log entries.
//!
//! Many producer threads reserve space, write an entry and commit it; a single consumer drains the
//! committed entries. The buffer is an arena of blocks (see `logbuf-state`) in one memory mapping:
//! anonymous memory for the lower reliability levels, a shared file mapping for
//! [`ReliabilityLevel::High`]. The latter survives a crash of the process and is recovered by the
//! next [`LogBuffer::open`] of the same log.
//!
//! ```text
//! [ preamble ][ block list header ][ block 0 ][ block 1 ] ...
//! ```
//!
//! Entries too large for any block go to a separate single-block arena, the oversize arena, with
//! a mapping of its own.
//!
//! Entries of one block are read in the order they were committed. There is no order across
//! blocks besides the timestamps in the entry headers, see [`ReadOrder::Timestamp`].

mod backing;
mod buffer;
mod config;
mod context;
mod error;
mod oversize;
mod reader;
mod recovery;
mod stats;

pub use buffer::{BlockInfo, BlockMeta, EntryMeta, LogBuffer, WriteHandle};
pub use config::{LogBufferConfig, MemoryPolicy, ReliabilityLevel};
pub use context::{system_clock, Context};
pub use error::OpenError;
pub use oversize::{oversize_path, OVERSIZE_BLOCK};
pub use reader::{ReadHandle, ReadOrder, Reader};
pub use recovery::{fingerprint, Preamble, Recovery, ResetReason, PREAMBLE_SIZE};
pub use stats::StatsSnapshot;

pub use logbuf_state::{LogEntry, LogEntryHeader, RawHandle, ResultCode, StringEncoding};
