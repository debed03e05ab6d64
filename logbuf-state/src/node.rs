//! The header line of each block.
//!
//! ```text
//! 0      4      8            24                     64
//! [ next | pad  | ring head  | misc data (5 x u64)  ][ ring payload ... ]
//! ```
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytemuck::Pod;

use crate::layout::NODE_HEADER_SIZE;
use crate::list::BlockList;
use crate::ring::{Ring, RingHead};

/// Bytes of per-block metadata the owner of the arena may store and read back after recovery.
pub const MISC_DATA_SIZE: usize = 40;

/// A 16-bit slot index and a 16-bit generation mark, packed into one atomic word.
///
/// The mark increments on every successful exchange of a list head. A head that was popped and
/// pushed again in between thus no longer compares equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexedPtr {
    pub index: u16,
    pub mark: u16,
}

impl IndexedPtr {
    pub const EMPTY_INDEX: u16 = u16::MAX;

    pub const EMPTY: IndexedPtr = IndexedPtr {
        index: Self::EMPTY_INDEX,
        mark: 0,
    };

    pub fn pack(self) -> u32 {
        u32::from(self.index) | u32::from(self.mark) << 16
    }

    pub fn unpack(word: u32) -> Self {
        IndexedPtr {
            index: word as u16,
            mark: (word >> 16) as u16,
        }
    }

    pub fn is_empty(self) -> bool {
        self.index == Self::EMPTY_INDEX
    }

    /// The successor head pointing at `index`.
    pub fn bump(self, index: u16) -> Self {
        IndexedPtr {
            index,
            mark: self.mark.wrapping_add(1),
        }
    }
}

#[repr(C)]
pub(crate) struct NodeHead {
    pub(crate) next: AtomicU32,
    _pad: AtomicU32,
    pub(crate) ring: RingHead,
    pub(crate) misc: [AtomicU64; MISC_DATA_SIZE / 8],
}

const _: () = {
    assert!(offset_of!(NodeHead, next) == 0);
    assert!(offset_of!(NodeHead, ring) == 8);
    assert!(offset_of!(NodeHead, misc) == 24);
    assert!(size_of::<RingHead>() == 16);
    assert!(size_of::<NodeHead>() == NODE_HEADER_SIZE);
};

/// One block of the arena.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    list: &'a BlockList,
    index: u16,
}

impl<'a> Node<'a> {
    pub(crate) fn new(list: &'a BlockList, index: u16) -> Self {
        debug_assert!(index < list.layout().max_blocks_count());
        Node { list, index }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// Offset of the block relative to the list header.
    pub fn offset(&self) -> usize {
        self.list.layout().node_offset(self.index)
    }

    /// Address of the block, for flushing the range of a mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.list.span().ptr_at(self.offset())
    }

    pub fn ring(&self) -> Ring<'a> {
        // The layout was validated against the span, every block is in bounds.
        let data = self
            .list
            .span()
            .sub(self.offset() + NODE_HEADER_SIZE, self.list.layout().ring_len());

        Ring::attach(self.list.ring_state(self.index), &self.head().ring, data)
    }

    pub fn misc_data(&self) -> [u8; MISC_DATA_SIZE] {
        let words = self.head().misc.each_ref().map(|w| w.load(Ordering::Acquire));
        let mut bytes = [0; MISC_DATA_SIZE];
        bytes.copy_from_slice(bytemuck::bytes_of(&words));
        bytes
    }

    pub fn set_misc_data(&self, data: &[u8; MISC_DATA_SIZE]) {
        let words: [u64; MISC_DATA_SIZE / 8] = bytemuck::pod_read_unaligned(data);
        for (target, word) in self.head().misc.iter().zip(words) {
            target.store(word, Ordering::Release);
        }
    }

    pub fn reset_misc_data(&self) {
        self.set_misc_data(&[0; MISC_DATA_SIZE]);
    }

    /// Read the misc data as a plain value, if it fits.
    pub fn misc<T: Pod>(&self) -> Option<T> {
        let bytes = self.misc_data();
        bytes
            .get(..size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }

    /// Store a plain value in the misc data. Returns `false` if it does not fit.
    pub fn set_misc<T: Pod>(&self, value: &T) -> bool {
        let mut bytes = [0; MISC_DATA_SIZE];
        let Some(target) = bytes.get_mut(..size_of::<T>()) else {
            return false;
        };

        target.copy_from_slice(bytemuck::bytes_of(value));
        self.set_misc_data(&bytes);
        true
    }

    pub(crate) fn next_ptr(&self) -> IndexedPtr {
        IndexedPtr::unpack(self.head().next.load(Ordering::Acquire))
    }

    pub(crate) fn set_next(&self, next: IndexedPtr) {
        self.head().next.store(next.pack(), Ordering::Release);
    }

    pub(crate) fn head(&self) -> &'a NodeHead {
        // Safety: nodes are cache-line aligned, in bounds by the layout, and `NodeHead` consists
        // only of atomics, valid for any bit pattern.
        unsafe { self.list.span().get::<NodeHead>(self.offset()) }
    }

    /// Unlinked, with an empty ring snapshot and no misc data.
    pub(crate) fn clear(&self) {
        self.set_next(IndexedPtr::EMPTY);
        self.head().ring.clear();
        self.reset_misc_data();
    }
}

impl core::fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("index", &self.index)
            .field("next", &self.next_ptr())
            .finish()
    }
}

#[test]
fn pointer_packing() {
    let ptr = IndexedPtr { index: 7, mark: 0xffff };
    assert_eq!(IndexedPtr::unpack(ptr.pack()), ptr);

    let bumped = ptr.bump(3);
    assert_eq!(bumped, IndexedPtr { index: 3, mark: 0 });
    assert!(IndexedPtr::unpack(IndexedPtr::EMPTY.pack()).is_empty());
}

#[test]
fn misc_data_spans_all_words() {
    use crate::layout::ArenaLayout;
    use crate::list::BlockList;

    let layout = ArenaLayout::compute(2, 2048).unwrap();
    let list = BlockList::create_new(crate::testing::region(layout.list_span_len()), 2, 2048)
        .unwrap();
    let node = list.node_checked(1).unwrap();

    let mut data = [0; MISC_DATA_SIZE];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = i as u8 + 1;
    }

    node.set_misc_data(&data);
    assert_eq!(node.misc_data(), data);
    assert_eq!(list.node_checked(0).unwrap().misc_data(), [0; MISC_DATA_SIZE]);

    assert!(node.set_misc(&[7u64; 5]));
    assert_eq!(node.misc::<[u64; 5]>(), Some([7; 5]));
    assert!(!node.set_misc(&[0u64; 6]));

    node.reset_misc_data();
    assert_eq!(node.misc_data(), [0; MISC_DATA_SIZE]);
}
