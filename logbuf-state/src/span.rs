//! An explicit memory region, the single place where arena offsets turn into addresses.
use core::ptr::NonNull;

use crate::CACHE_LINE_SIZE;

/// A cache-line aligned region of memory the arena is laid out in.
///
/// This is a base pointer and a length. It does not own the memory. The lifetimes of everything
/// resolved through a span are tied to the borrow of the span itself, the truth (that they live as
/// long as the mapping) is not representable. Whoever creates the span keeps the memory alive and
/// drops every structure built on it before releasing the memory.
#[derive(Clone, Copy, Debug)]
pub struct Span {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the span is only a description of a region. All accesses through it go through atomics
// or through byte ranges handed out exclusively by the ring protocol.
unsafe impl Send for Span {}
unsafe impl Sync for Span {}

impl Span {
    /// Describe the region `[base, base + len)`.
    ///
    /// Returns `None` if `base` is null or not aligned to [`CACHE_LINE_SIZE`].
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes of `len` bytes, and initialized, for as long
    /// as the span or anything resolved from it is used. Pages of a fresh mapping read as zero and
    /// count as initialized. Other accessors of the memory must follow the arena protocol, that is
    /// only use atomics for the header words and only touch payload bytes they own.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        let base = NonNull::new(base)?;

        if base.as_ptr() as usize % CACHE_LINE_SIZE != 0 {
            return None;
        }

        Some(Span { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// The sub-region `[offset, offset + len)`, if it is in bounds and stays cache-line aligned.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Span> {
        let end = offset.checked_add(len)?;

        if end > self.len || offset % CACHE_LINE_SIZE != 0 {
            return None;
        }

        // Safety: in-bounds by the check above.
        let base = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        Some(Span { base, len })
    }

    /// A sub-region the caller already knows to be in bounds and aligned.
    pub(crate) fn sub(&self, offset: usize, len: usize) -> Span {
        debug_assert!(offset + len <= self.len);
        debug_assert!(offset % CACHE_LINE_SIZE == 0);
        Span {
            base: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) },
            len,
        }
    }

    /// Offset of an address within this span.
    pub fn offset_of(&self, addr: *const u8) -> Option<usize> {
        let start = self.base.as_ptr() as usize;
        let addr = addr as usize;

        if addr < start || addr >= start + self.len {
            return None;
        }

        Some(addr - start)
    }

    /// Resolve a `T` placed at `offset`.
    ///
    /// # Safety
    ///
    /// `T` must be valid for every bit pattern (the memory may come from a file) and must only be
    /// modified through atomics. The offset must be in bounds and aligned for `T`.
    pub(crate) unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        debug_assert!(offset % core::mem::align_of::<T>() == 0);
        &*(self.base.as_ptr().add(offset) as *const T)
    }

    /// A raw pointer `offset` bytes into the span.
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        // Safety: in-bounds or one-past-the-end.
        unsafe { self.base.as_ptr().add(offset) }
    }
}

#[test]
fn slices_stay_aligned() {
    let span = crate::testing::region(4 * CACHE_LINE_SIZE);

    assert!(span.slice(CACHE_LINE_SIZE, 2 * CACHE_LINE_SIZE).is_some());
    assert!(span.slice(8, CACHE_LINE_SIZE).is_none());
    assert!(span.slice(3 * CACHE_LINE_SIZE, 2 * CACHE_LINE_SIZE).is_none());

    let inner = span.slice(2 * CACHE_LINE_SIZE, CACHE_LINE_SIZE).unwrap();
    assert_eq!(span.offset_of(inner.as_ptr()), Some(2 * CACHE_LINE_SIZE));
    assert_eq!(inner.offset_of(span.as_ptr()), None);
}
