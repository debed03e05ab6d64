//! A bounded, lock-free singly linked list of blocks.
//!
//! The arena holds the header and the nodes. Both the chain of linked blocks and the free list
//! thread through the `next` word of the node headers; the chain head is persisted in the list
//! header, the free head lives in process memory. A node only ever moves from the free list onto
//! the chain. Whatever the `next` word of an unlinked node says after a crash is not reachable from
//! the persisted head and is rebuilt on recovery.
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::layout::{ArenaLayout, LayoutError, LIST_HEADER_SIZE};
use crate::node::{IndexedPtr, Node};
use crate::ring::{Ring, RingRecoverError, RingState};
use crate::span::Span;

#[repr(C)]
struct ListHeader {
    head: AtomicU32,
    _pad0: AtomicU32,
    offset: AtomicU16,
    _pad1: [AtomicU16; 3],
    max_blocks_count: AtomicU16,
    _pad2: [AtomicU16; 3],
    per_block_size: AtomicU64,
    _reserved: [AtomicU64; 4],
}

const _: () = {
    assert!(offset_of!(ListHeader, head) == 0);
    assert!(offset_of!(ListHeader, offset) == 8);
    assert!(offset_of!(ListHeader, max_blocks_count) == 16);
    assert!(offset_of!(ListHeader, per_block_size) == 24);
    assert!(size_of::<ListHeader>() == LIST_HEADER_SIZE);
};

/// The list of blocks of one arena, with the volatile state of their rings.
pub struct BlockList {
    span: Span,
    layout: ArenaLayout,
    states: Box<[RingState]>,
    free: AtomicU32,
    /// Address range of the blocks, recomputed from the span on every open.
    range: (usize, usize),
}

/// Why the persisted list was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoverError {
    /// The configuration does not describe a valid layout for the region.
    Layout(LayoutError),
    BlockCountMismatch { persisted: u16 },
    OffsetMismatch { persisted: u16 },
    BlockSizeMismatch { persisted: u64 },
    /// A link points outside of the arena.
    IndexOutOfRange { index: u16 },
    /// The chain did not end within `max_blocks_count` nodes; it is cyclic.
    ChainTooLong { steps: usize },
}

/// Outcome of rebuilding the rings of all linked blocks.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveredBlocks {
    /// Linked blocks, in chain order.
    pub linked: Vec<u16>,
    /// Blocks whose ring was inconsistent and has been emptied.
    pub resets: Vec<(u16, RingRecoverError)>,
}

/// Iterator over the linked blocks, from the head.
pub struct Chain<'a> {
    list: &'a BlockList,
    next: u16,
    remaining: usize,
}

impl BlockList {
    /// Lay out a fresh list over `span`, discarding all content.
    pub fn create_new(
        span: Span,
        max_blocks_count: u16,
        total_size: u64,
    ) -> Result<Self, LayoutError> {
        let layout = ArenaLayout::compute(max_blocks_count, total_size)?;
        layout.validate(span.len())?;

        let mut list = BlockList::with_layout(span, layout);
        list.reset(max_blocks_count, total_size)?;
        Ok(list)
    }

    /// Pick up the list persisted in `span`.
    ///
    /// The rings of the linked blocks are not touched yet, see [`BlockList::recovery_blocks`].
    pub fn recover_existing(
        span: Span,
        max_blocks_count: u16,
        total_size: u64,
    ) -> Result<Self, RecoverError> {
        let layout =
            ArenaLayout::compute(max_blocks_count, total_size).map_err(RecoverError::Layout)?;
        layout.validate(span.len()).map_err(RecoverError::Layout)?;

        let mut list = BlockList::with_layout(span, layout);
        list.try_recover_from_memory_map(max_blocks_count, total_size)?;
        Ok(list)
    }

    fn with_layout(span: Span, layout: ArenaLayout) -> Self {
        let start = span.as_ptr() as usize + usize::from(layout.blocks_offset());
        let end = span.as_ptr() as usize + layout.list_span_len();

        BlockList {
            span,
            layout,
            states: (0..layout.max_blocks_count())
                .map(|_| RingState::default())
                .collect(),
            free: AtomicU32::new(IndexedPtr::EMPTY.pack()),
            range: (start, end),
        }
    }

    /// Initialize header and all nodes. Every block ends up on the free list.
    ///
    /// Deterministic: resetting twice with the same arguments yields the same bytes.
    pub fn reset(&mut self, max_blocks_count: u16, total_size: u64) -> Result<(), LayoutError> {
        let layout = ArenaLayout::compute(max_blocks_count, total_size)?;
        layout.validate(self.span.len())?;

        if layout != self.layout {
            *self = BlockList::with_layout(self.span, layout);
        }

        let header = self.header();
        header.head.store(IndexedPtr::EMPTY.pack(), Ordering::Relaxed);
        header.offset.store(layout.blocks_offset(), Ordering::Relaxed);
        header.max_blocks_count.store(max_blocks_count, Ordering::Relaxed);
        header
            .per_block_size
            .store(layout.per_block_size() as u64, Ordering::Release);

        for index in 0..max_blocks_count {
            self.node(index).clear();
        }

        self.rebuild_free(&[]);
        Ok(())
    }

    /// Check the persisted header against the configuration and walk the chain.
    ///
    /// Returns the number of linked blocks. The walk is bounded at `max_blocks_count + 1` steps.
    pub fn try_recover_from_memory_map(
        &mut self,
        max_blocks_count: u16,
        total_size: u64,
    ) -> Result<usize, RecoverError> {
        let layout =
            ArenaLayout::compute(max_blocks_count, total_size).map_err(RecoverError::Layout)?;
        layout.validate(self.span.len()).map_err(RecoverError::Layout)?;

        if layout != self.layout {
            *self = BlockList::with_layout(self.span, layout);
        }

        let header = self.header();

        let persisted = header.max_blocks_count.load(Ordering::Acquire);
        if persisted != max_blocks_count {
            return Err(RecoverError::BlockCountMismatch { persisted });
        }

        let persisted = header.offset.load(Ordering::Acquire);
        if persisted != layout.blocks_offset() {
            return Err(RecoverError::OffsetMismatch { persisted });
        }

        let persisted = header.per_block_size.load(Ordering::Acquire);
        if persisted != layout.per_block_size() as u64 {
            return Err(RecoverError::BlockSizeMismatch { persisted });
        }

        let linked = self.walk()?;
        self.rebuild_free(&linked);
        Ok(linked.len())
    }

    /// Rebuild the volatile ring state of every linked block from its persisted snapshot.
    ///
    /// Payload and misc data are kept. A ring that fails validation is emptied on its own.
    pub fn recovery_blocks(&self) -> RecoveredBlocks {
        let mut recovered = RecoveredBlocks::default();

        for node in self.iter() {
            let head = &node.head().ring;
            let data = self.span.sub(
                node.offset() + crate::layout::NODE_HEADER_SIZE,
                self.layout.ring_len(),
            );

            let (_, err) = Ring::recover_existing(self.ring_state(node.index()), head, data);
            if let Some(err) = err {
                recovered.resets.push((node.index(), err));
            }

            recovered.linked.push(node.index());
        }

        recovered
    }

    /// Take a block off the free list.
    pub fn take_free(&self) -> Option<u16> {
        Self::pop_from(&self.free, self)
    }

    /// Initialize the ring of a block taken off the free list and push it onto the chain.
    pub fn link(&self, index: u16) -> Option<Node<'_>> {
        let node = self.node_checked(index)?;
        let data = self.span.sub(
            node.offset() + crate::layout::NODE_HEADER_SIZE,
            self.layout.ring_len(),
        );

        Ring::create_new(self.ring_state(index), &node.head().ring, data);
        self.push(index);
        Some(node)
    }

    /// Push a node onto the chain. The node must not be reachable from either list.
    pub fn push(&self, index: u16) {
        let head = &self.header().head;
        let node = self.node(index);
        let mut current = IndexedPtr::unpack(head.load(Ordering::Acquire));

        loop {
            node.set_next(IndexedPtr {
                index: current.index,
                mark: 0,
            });

            match head.compare_exchange_weak(
                current.pack(),
                current.bump(index).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = IndexedPtr::unpack(actual),
            }
        }
    }

    /// Unlink the head of the chain.
    ///
    /// The payload of the block may still be referenced by a reader, the block is not put back
    /// on the free list.
    pub fn pop(&self) -> Option<u16> {
        Self::pop_from(&self.header().head, self)
    }

    fn pop_from(head: &AtomicU32, list: &BlockList) -> Option<u16> {
        let mut current = IndexedPtr::unpack(head.load(Ordering::Acquire));

        loop {
            if current.is_empty() {
                return None;
            }

            let next = list.node_checked(current.index)?.next_ptr();
            match head.compare_exchange_weak(
                current.pack(),
                current.bump(next.index).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current.index),
                Err(actual) => current = IndexedPtr::unpack(actual),
            }
        }
    }

    pub fn first(&self) -> Option<Node<'_>> {
        let head = IndexedPtr::unpack(self.header().head.load(Ordering::Acquire));
        self.node_checked(head.index)
    }

    pub fn next(&self, node: Node<'_>) -> Option<Node<'_>> {
        self.node_checked(node.next_ptr().index)
    }

    /// The node in slot `index`, whether linked or not.
    pub fn node_checked(&self, index: u16) -> Option<Node<'_>> {
        if index >= self.layout.max_blocks_count() {
            return None;
        }

        Some(Node::new(self, index))
    }

    /// Index of the block containing `addr`.
    pub fn index_of(&self, addr: *const u8) -> Option<u16> {
        if !self.contains(addr) {
            return None;
        }

        let offset = addr as usize - self.range.0;
        Some((offset / self.layout.per_block_size()) as u16)
    }

    /// Whether `addr` lies within the blocks of this list.
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        self.range.0 <= addr && addr < self.range.1
    }

    /// Whether the block is on the chain.
    pub fn is_linked(&self, index: u16) -> bool {
        self.iter().any(|node| node.index() == index)
    }

    pub fn iter(&self) -> Chain<'_> {
        let head = IndexedPtr::unpack(self.header().head.load(Ordering::Acquire));
        Chain {
            list: self,
            next: head.index,
            remaining: usize::from(self.layout.max_blocks_count()),
        }
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Number of blocks on the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut next = IndexedPtr::unpack(self.free.load(Ordering::Acquire)).index;

        while let Some(node) = self.node_checked(next) {
            count += 1;
            if count > usize::from(self.layout.max_blocks_count()) {
                break;
            }
            next = node.next_ptr().index;
        }

        count
    }

    pub(crate) fn ring_state(&self, index: u16) -> &RingState {
        &self.states[usize::from(index)]
    }

    fn node(&self, index: u16) -> Node<'_> {
        Node::new(self, index)
    }

    fn header(&self) -> &ListHeader {
        // Safety: the span is cache-line aligned and holds the layout, `ListHeader` consists of
        // atomics only.
        unsafe { self.span.get::<ListHeader>(0) }
    }

    fn walk(&self) -> Result<Vec<u16>, RecoverError> {
        let max = self.layout.max_blocks_count();
        let mut linked = Vec::new();
        let mut index = IndexedPtr::unpack(self.header().head.load(Ordering::Acquire)).index;

        while index != IndexedPtr::EMPTY_INDEX {
            if index >= max {
                return Err(RecoverError::IndexOutOfRange { index });
            }

            linked.push(index);
            if linked.len() > usize::from(max) {
                return Err(RecoverError::ChainTooLong {
                    steps: linked.len(),
                });
            }

            index = self.node(index).next_ptr().index;
        }

        Ok(linked)
    }

    /// Thread every block not in `linked` onto the free list, lowest index first.
    fn rebuild_free(&self, linked: &[u16]) {
        let max = self.layout.max_blocks_count();
        let mut is_linked = alloc::vec![false; usize::from(max)];
        for &index in linked {
            is_linked[usize::from(index)] = true;
        }

        let mut head = IndexedPtr::EMPTY;
        for index in (0..max).rev() {
            if is_linked[usize::from(index)] {
                continue;
            }

            self.node(index).set_next(IndexedPtr {
                index: head.index,
                mark: 0,
            });
            head = IndexedPtr { index, mark: 0 };
        }

        self.free.store(head.pack(), Ordering::Release);
    }
}

impl<'a> Iterator for Chain<'a> {
    type Item = Node<'a>;

    fn next(&mut self) -> Option<Node<'a>> {
        if self.remaining == 0 {
            return None;
        }

        let node = self.list.node_checked(self.next)?;
        self.remaining -= 1;
        self.next = node.next_ptr().index;
        Some(node)
    }
}

impl fmt::Display for RecoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverError::Layout(err) => write!(f, "invalid layout: {err}"),
            RecoverError::BlockCountMismatch { persisted } => {
                write!(f, "persisted with {persisted} blocks")
            }
            RecoverError::OffsetMismatch { persisted } => {
                write!(f, "persisted with blocks at offset {persisted}")
            }
            RecoverError::BlockSizeMismatch { persisted } => {
                write!(f, "persisted with blocks of {persisted} bytes")
            }
            RecoverError::IndexOutOfRange { index } => write!(f, "link to block {index} out of range"),
            RecoverError::ChainTooLong { steps } => write!(f, "chain not terminated after {steps} blocks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::region;
    use crate::ResultCode;

    const TOTAL: u64 = 4096;

    fn arena() -> Span {
        let layout = ArenaLayout::compute(4, TOTAL).unwrap();
        region(layout.list_span_len())
    }

    fn bytes(span: Span) -> &'static [u8] {
        unsafe { core::slice::from_raw_parts(span.as_ptr(), span.len()) }
    }

    fn link_free(list: &BlockList) -> u16 {
        let index = list.take_free().unwrap();
        list.link(index).unwrap();
        index
    }

    #[test]
    fn reset_is_deterministic() {
        let span = arena();
        let mut list = BlockList::create_new(span, 4, TOTAL).unwrap();
        let first = bytes(span).to_vec();

        list.reset(4, TOTAL).unwrap();
        assert_eq!(bytes(span), &first[..]);

        let other = arena();
        BlockList::create_new(other, 4, TOTAL).unwrap();
        assert_eq!(bytes(other), &first[..]);

        assert_eq!(list.layout().per_block_size(), 1024);
        assert_eq!(list.free_count(), 4);
        assert!(list.first().is_none());
    }

    #[test]
    fn scenario_four_blocks() {
        let span = arena();
        let list = BlockList::create_new(span, 4, TOTAL).unwrap();

        let index = link_free(&list);
        let ring = list.first().unwrap().ring();

        let chunk = ring.alloc(900).unwrap();
        assert!(list.contains(chunk.as_raw().data_addr));
        assert_eq!(list.index_of(chunk.as_raw().data_addr), Some(index));
        chunk.commit();

        assert_eq!(ring.alloc(900).err(), Some(ResultCode::NotEnoughSpace));
    }

    #[test]
    fn recovers_links_and_misc_data() {
        let span = arena();
        let list = BlockList::create_new(span, 4, TOTAL).unwrap();

        for stamp in 0u64..4 {
            let index = link_free(&list);
            assert!(list.node_checked(index).unwrap().set_misc(&stamp));
        }

        let before: Vec<_> = list.iter().map(|node| node.index()).collect();
        assert_eq!(list.take_free(), None);
        drop(list);

        let list = BlockList::recover_existing(span, 4, TOTAL).unwrap();
        let recovered = list.recovery_blocks();
        assert_eq!(recovered.linked, before);
        assert!(recovered.resets.is_empty());

        let stamps: Vec<u64> = list.iter().map(|node| node.misc().unwrap()).collect();
        assert_eq!(stamps, [3, 2, 1, 0]);
        assert_eq!(list.free_count(), 0);
    }

    #[test]
    fn recovery_rebuilds_free_list() {
        let span = arena();
        let list = BlockList::create_new(span, 4, TOTAL).unwrap();
        link_free(&list);
        link_free(&list);
        drop(list);

        let mut list = BlockList::recover_existing(span, 4, TOTAL).unwrap();
        assert_eq!(list.try_recover_from_memory_map(4, TOTAL), Ok(2));
        assert_eq!(list.free_count(), 2);

        let index = list.take_free().unwrap();
        assert!(!list.is_linked(index));
        list.link(index).unwrap();
        assert!(list.is_linked(index));
        assert_eq!(list.iter().count(), 3);
    }

    #[test]
    fn rejects_head_out_of_range() {
        let span = arena();
        let list = BlockList::create_new(span, 4, TOTAL).unwrap();
        list.header()
            .head
            .store(IndexedPtr { index: 9, mark: 1 }.pack(), Ordering::Relaxed);
        drop(list);

        let err = BlockList::recover_existing(span, 4, TOTAL).err();
        assert_eq!(err, Some(RecoverError::IndexOutOfRange { index: 9 }));
    }

    #[test]
    fn rejects_cycle() {
        let span = arena();
        let list = BlockList::create_new(span, 4, TOTAL).unwrap();
        let a = link_free(&list);
        let b = link_free(&list);
        // b -> a -> b
        list.node(a).set_next(IndexedPtr { index: b, mark: 0 });
        drop(list);

        let err = BlockList::recover_existing(span, 4, TOTAL).err();
        assert_eq!(err, Some(RecoverError::ChainTooLong { steps: 5 }));
    }

    #[test]
    fn rejects_other_geometry() {
        let span = arena();
        BlockList::create_new(span, 4, TOTAL).unwrap();

        let err = BlockList::recover_existing(span, 2, TOTAL).err();
        assert_eq!(err, Some(RecoverError::BlockCountMismatch { persisted: 4 }));

        let err = BlockList::recover_existing(span, 4, TOTAL - 256).err();
        assert_eq!(err, Some(RecoverError::BlockSizeMismatch { persisted: 1024 }));
    }

    #[test]
    fn pop_unlinks_head() {
        let span = arena();
        let list = BlockList::create_new(span, 4, TOTAL).unwrap();
        let a = link_free(&list);
        let b = link_free(&list);

        assert_eq!(list.pop(), Some(b));
        assert_eq!(list.first().map(|node| node.index()), Some(a));
        assert_eq!(list.pop(), Some(a));
        assert_eq!(list.pop(), None);
    }
}
