//! The arena underneath a log buffer.
//!
//! A contiguous region is split into a block list header and `max_blocks_count` equally sized
//! blocks. Each block is a node of a lock-free singly linked list and carries one
//! single-producer/single-consumer byte ring. Nothing in the region is an absolute address: nodes
//! are named by their 16-bit slot index and the blocks are found at a relative offset from the list
//! header. The region can thus be mapped at a different base address by the next process and still
//! be walked.
//!
//! ```text
//! [list header: head | rel_offset | max_blocks_count | per_block_size ]  (one cache line)
//! [block 0: link | ring cursors | misc data (one cache line) | ring payload ...]
//! [block 1: ...]
//! ...
//! ```
//!
//! ## Volatile and persisted state
//!
//! Only the bytes in the region are assumed to survive a crash of the process. The cursors every
//! ring works on during operation are kept in process memory and rebuilt from the snapshot in the
//! node header when an existing region is recovered. A recovered ring validates every chunk between
//! its persisted read and write cursor before it is trusted.
//!
//! Note that surviving a crash of the _process_ is a property of a shared file mapping, the page
//! cache still holds the data. Surviving a crash of the _system_ requires the owner of the mapping
//! to flush it; this crate never performs any I/O.
#![no_std]
extern crate alloc;

mod code;
mod entry;
mod layout;
mod list;
mod node;
mod ring;
mod span;

pub use code::{RawHandle, ResultCode};
pub use entry::{EntryLayout, LogEntry, LogEntryHeader, StringEncoding};
pub use layout::{ArenaLayout, LayoutError, CHUNK_BLOCK_SIZE, LIST_HEADER_SIZE, NODE_HEADER_SIZE};
pub use list::{BlockList, Chain, RecoverError, RecoveredBlocks};
pub use node::{IndexedPtr, Node, MISC_DATA_SIZE};
pub use ring::{ReadChunk, Ring, RingRecoverError, RingState, WriteChunk, CHUNK_HEADER_SIZE};
pub use span::Span;

/// The unit every structure in the arena is aligned and padded to.
pub const CACHE_LINE_SIZE: usize = 64;

#[cfg(test)]
pub(crate) mod testing {
    use crate::{Span, CACHE_LINE_SIZE};
    use alloc::vec;

    #[derive(Clone, Copy)]
    #[repr(C, align(64))]
    struct Line([u8; CACHE_LINE_SIZE]);

    /// A zeroed, leaked region usable as the backing of an arena in tests.
    pub fn region(len: usize) -> Span {
        let lines = vec![Line([0; CACHE_LINE_SIZE]); len.div_ceil(CACHE_LINE_SIZE)];
        let lines = alloc::boxed::Box::leak(lines.into_boxed_slice());
        unsafe { Span::new(lines.as_mut_ptr() as *mut u8, len) }.unwrap()
    }
}
