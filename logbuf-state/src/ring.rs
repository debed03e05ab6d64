//! A single-producer/single-consumer byte ring over the payload of one block.
//!
//! The ring is a sequence of 64-byte chunks. Every entry occupies a contiguous run of chunks and
//! starts with a chunk header:
//!
//! ```text
//! [ block_num: u32 | data_size: u32 | payload (data_size bytes) ... padded to block_num chunks ]
//! ```
//!
//! An entry never straddles the physical end of the ring. When it would, the chunks up to the end
//! are filled by a padding entry with `data_size == u32::MAX`, which the consumer skips.
//!
//! Cursors count chunks modulo twice the chunk count. Equal cursors are an empty ring, cursors a
//! full chunk count apart a full ring. The cursors that operations work on live in a process-local
//! [`RingState`]; every publish also stores them into the [`RingHead`] within the block so that a
//! later process can pick up where this one left off.
//!
//! One producer at a time is enforced with a reservation flag: an allocation claims it, the commit
//! or abandon of the resulting [`WriteChunk`] releases it. The consumer side uses a second flag the
//! same way.
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::code::{RawHandle, ResultCode};
use crate::layout::CHUNK_BLOCK_SIZE;
use crate::span::Span;

pub const CHUNK_HEADER_SIZE: usize = core::mem::size_of::<ChunkHeader>();
const PADDING: u32 = u32::MAX;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ChunkHeader {
    block_num: u32,
    data_size: u32,
}

/// The persisted cursor snapshot, within the node header.
#[repr(C)]
pub(crate) struct RingHead {
    read_cursor: AtomicU32,
    write_cursor: AtomicU32,
    block_count: AtomicU32,
    _reserved: AtomicU32,
}

#[derive(Default)]
#[repr(C, align(64))]
struct CachePadded<T>(T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

#[derive(Default)]
struct ProducerSide {
    write: AtomicU32,
    reserved: AtomicBool,
}

#[derive(Default)]
struct ConsumerSide {
    read: AtomicU32,
    reading: AtomicBool,
}

/// The volatile state of one ring, never placed in the arena.
#[derive(Default)]
pub struct RingState {
    producer: CachePadded<ProducerSide>,
    consumer: CachePadded<ConsumerSide>,
}

/// The ring of one block: its volatile state, its persisted snapshot and its payload bytes.
#[derive(Clone, Copy)]
pub struct Ring<'a> {
    state: &'a RingState,
    head: &'a RingHead,
    data: Span,
    capacity: u32,
}

/// Why a persisted ring could not be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingRecoverError {
    /// The snapshot was written for a ring of a different size.
    CapacityMismatch { persisted: u32 },
    /// A cursor is out of range, or the cursors are further apart than the capacity.
    CursorOutOfRange,
    /// A chunk header between the cursors is inconsistent.
    CorruptChunk { cursor: u32 },
    /// The chunk chain does not end exactly at the write cursor.
    ChainMismatch,
}

/// A reserved, not yet published region of a ring.
///
/// The region belongs to the holder alone. [`WriteChunk::commit`] publishes it, dropping the chunk
/// abandons it. Both release the ring for the next producer.
pub struct WriteChunk<'a> {
    ring: Ring<'a>,
    start: u32,
    blocks: u32,
    size: u32,
    wrapped: bool,
    low_space: bool,
}

/// The oldest committed entry of a ring, held by the single consumer.
///
/// [`ReadChunk::consume`] frees the region, dropping the chunk leaves it in place for the next
/// read.
pub struct ReadChunk<'a> {
    ring: Ring<'a>,
    start: u32,
    blocks: u32,
    size: u32,
}

impl RingHead {
    pub(crate) fn clear(&self) {
        self.read_cursor.store(0, Ordering::Relaxed);
        self.write_cursor.store(0, Ordering::Relaxed);
        self.block_count.store(0, Ordering::Relaxed);
        self._reserved.store(0, Ordering::Release);
    }
}

impl<'a> Ring<'a> {
    /// View a ring without touching any state.
    ///
    /// The state must have been set up by [`Ring::create_new`] or [`Ring::recover_existing`] over
    /// the same head and data.
    pub(crate) fn attach(state: &'a RingState, head: &'a RingHead, data: Span) -> Self {
        let capacity = (data.len() / CHUNK_BLOCK_SIZE) as u32;
        Ring {
            state,
            head,
            data,
            capacity,
        }
    }

    /// Initialize an empty ring, discarding whatever the data and snapshot contained.
    pub(crate) fn create_new(state: &'a RingState, head: &'a RingHead, data: Span) -> Self {
        let ring = Ring::attach(state, head, data);
        ring.set_cursors(0, 0);
        ring.head.block_count.store(ring.capacity, Ordering::Release);
        ring
    }

    /// Pick up the ring from its persisted snapshot.
    ///
    /// Every chunk between the read and the write cursor is validated. If anything does not add
    /// up, the ring is initialized empty instead and the reason is returned alongside.
    pub(crate) fn recover_existing(
        state: &'a RingState,
        head: &'a RingHead,
        data: Span,
    ) -> (Self, Option<RingRecoverError>) {
        let ring = Ring::attach(state, head, data);

        match ring.validate_snapshot() {
            Ok((read, write)) => {
                ring.set_cursors(read, write);
                (ring, None)
            }
            Err(err) => (Ring::create_new(state, head, data), Some(err)),
        }
    }

    /// Reserve `size` contiguous bytes.
    ///
    /// Fails with `AllocSizeInvalid` for zero bytes or more than the ring could ever hold, with
    /// `AllocFailedByRaceCondition` while another producer holds the ring, and with
    /// `NotEnoughSpace` if the consumer has not freed enough of it yet. If the entry would have
    /// straddled the end of the ring and only the padding up to the end fit, the padding is
    /// published by itself and `DataNotContiguous` is returned.
    pub fn alloc(&self, size: usize) -> Result<WriteChunk<'a>, ResultCode> {
        if size == 0 || size > self.max_alloc_size() {
            return Err(ResultCode::AllocSizeInvalid);
        }

        let state = &self.state.producer;
        if state
            .reserved
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ResultCode::AllocFailedByRaceCondition);
        }

        let blocks = (size + CHUNK_HEADER_SIZE).div_ceil(CHUNK_BLOCK_SIZE) as u32;
        let write = state.write.load(Ordering::Relaxed);
        let read = self.state.consumer.read.load(Ordering::Acquire);

        let free = self.capacity - self.distance(read, write);
        let tail = self.capacity - self.physical(write);

        let (start, wrapped) = if blocks <= tail {
            (write, false)
        } else if tail + blocks <= free {
            self.write_padding(write, tail);
            (self.advance(write, tail), true)
        } else if tail <= free {
            self.write_padding(write, tail);
            self.publish(self.advance(write, tail));
            state.reserved.store(false, Ordering::Release);
            return Err(ResultCode::DataNotContiguous);
        } else {
            state.reserved.store(false, Ordering::Release);
            return Err(ResultCode::NotEnoughSpace);
        };

        let used = if wrapped { tail + blocks } else { blocks };
        if used > free {
            state.reserved.store(false, Ordering::Release);
            return Err(ResultCode::NotEnoughSpace);
        }

        Ok(WriteChunk {
            ring: *self,
            start,
            blocks,
            size: size as u32,
            wrapped,
            low_space: free - used <= self.capacity / 2,
        })
    }

    /// Claim the oldest committed entry.
    ///
    /// Fails with `Empty` if there is none, and with `WaitAndRetry` if the consumer side of the
    /// ring is held already.
    pub fn read_begin(&self) -> Result<ReadChunk<'a>, ResultCode> {
        let consumer = &self.state.consumer;
        if consumer
            .reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ResultCode::WaitAndRetry);
        }

        loop {
            let read = consumer.read.load(Ordering::Relaxed);
            let write = self.state.producer.write.load(Ordering::Acquire);

            if read == write {
                consumer.reading.store(false, Ordering::Release);
                return Err(ResultCode::Empty);
            }

            let header = self.chunk_header(read);
            if header.data_size == PADDING {
                self.release(self.advance(read, header.block_num));
                continue;
            }

            return Ok(ReadChunk {
                ring: *self,
                start: read,
                blocks: header.block_num,
                size: header.data_size,
            });
        }
    }

    /// Visit the payload of every committed entry, oldest first, without consuming any.
    ///
    /// Returns the number of entries visited.
    pub fn data_traverse(&self, mut visit: impl FnMut(&[u8])) -> Result<usize, ResultCode> {
        let consumer = &self.state.consumer;
        if consumer
            .reading
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ResultCode::WaitAndRetry);
        }

        let mut cursor = consumer.read.load(Ordering::Relaxed);
        let write = self.state.producer.write.load(Ordering::Acquire);
        let mut count = 0;

        while cursor != write {
            let header = self.chunk_header(cursor);
            if header.data_size != PADDING {
                // Safety: committed and not consumed, the consumer side is held.
                visit(unsafe { self.payload(cursor, header.data_size) });
                count += 1;
            }

            cursor = self.advance(cursor, header.block_num);
        }

        consumer.reading.store(false, Ordering::Release);
        Ok(count)
    }

    pub fn is_empty(&self) -> bool {
        self.state.consumer.read.load(Ordering::Acquire)
            == self.state.producer.write.load(Ordering::Acquire)
    }

    /// Total number of chunks.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity as usize * CHUNK_BLOCK_SIZE
    }

    /// Chunks committed and not yet consumed.
    pub fn used_blocks(&self) -> u32 {
        let read = self.state.consumer.read.load(Ordering::Acquire);
        let write = self.state.producer.write.load(Ordering::Acquire);
        self.distance(read, write)
    }

    pub fn max_alloc_size(&self) -> usize {
        self.capacity_bytes().saturating_sub(CHUNK_HEADER_SIZE)
    }

    fn validate_snapshot(&self) -> Result<(u32, u32), RingRecoverError> {
        let persisted = self.head.block_count.load(Ordering::Acquire);
        if persisted != self.capacity {
            return Err(RingRecoverError::CapacityMismatch { persisted });
        }

        let read = self.head.read_cursor.load(Ordering::Acquire);
        let write = self.head.write_cursor.load(Ordering::Acquire);
        let modulus = 2 * self.capacity;

        if read >= modulus || write >= modulus || self.distance(read, write) > self.capacity {
            return Err(RingRecoverError::CursorOutOfRange);
        }

        let mut cursor = read;
        let mut remaining = self.distance(read, write);

        while remaining > 0 {
            let header = self.chunk_header(cursor);
            let blocks = header.block_num;

            let fits = blocks > 0
                && blocks <= remaining
                && blocks <= self.capacity - self.physical(cursor);
            let sized = header.data_size == PADDING
                || (header.data_size > 0
                    && header.data_size as usize + CHUNK_HEADER_SIZE
                        <= blocks as usize * CHUNK_BLOCK_SIZE);

            if !fits || !sized {
                return Err(RingRecoverError::CorruptChunk { cursor });
            }

            cursor = self.advance(cursor, blocks);
            remaining -= blocks;
        }

        if cursor != write {
            return Err(RingRecoverError::ChainMismatch);
        }

        Ok((read, write))
    }

    fn set_cursors(&self, read: u32, write: u32) {
        self.state.consumer.read.store(read, Ordering::Relaxed);
        self.state.producer.write.store(write, Ordering::Relaxed);
        self.head.read_cursor.store(read, Ordering::Relaxed);
        self.head.write_cursor.store(write, Ordering::Release);
    }

    fn publish(&self, write: u32) {
        self.state.producer.write.store(write, Ordering::Release);
        self.head.write_cursor.store(write, Ordering::Release);
    }

    fn release(&self, read: u32) {
        self.state.consumer.read.store(read, Ordering::Release);
        self.head.read_cursor.store(read, Ordering::Release);
    }

    fn write_padding(&self, cursor: u32, blocks: u32) {
        self.write_chunk_header(
            cursor,
            ChunkHeader {
                block_num: blocks,
                data_size: PADDING,
            },
        );
    }

    fn chunk_header(&self, cursor: u32) -> ChunkHeader {
        let at = self.physical(cursor) as usize * CHUNK_BLOCK_SIZE;
        // Safety: in bounds, chunk aligned; only read between the cursors, where the producer
        // wrote the header before publishing.
        unsafe { (self.data.ptr_at(at) as *const ChunkHeader).read() }
    }

    fn write_chunk_header(&self, cursor: u32, header: ChunkHeader) {
        let at = self.physical(cursor) as usize * CHUNK_BLOCK_SIZE;
        // Safety: in bounds, chunk aligned; only written by the holder of the reservation on free
        // chunks.
        unsafe { (self.data.ptr_at(at) as *mut ChunkHeader).write(header) }
    }

    /// # Safety
    ///
    /// The caller must own the chunk at `cursor` and `size` must fit into its run of chunks.
    unsafe fn payload(&self, cursor: u32, size: u32) -> &'a [u8] {
        let at = self.physical(cursor) as usize * CHUNK_BLOCK_SIZE + CHUNK_HEADER_SIZE;
        core::slice::from_raw_parts(self.data.ptr_at(at), size as usize)
    }

    fn physical(&self, cursor: u32) -> u32 {
        if cursor >= self.capacity {
            cursor - self.capacity
        } else {
            cursor
        }
    }

    fn advance(&self, cursor: u32, blocks: u32) -> u32 {
        (cursor + blocks) % (2 * self.capacity)
    }

    fn distance(&self, read: u32, write: u32) -> u32 {
        (write + 2 * self.capacity - read) % (2 * self.capacity)
    }
}

impl<'a> WriteChunk<'a> {
    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether a padding entry had to be placed in front of this one.
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// At most half of the ring remains free after this allocation.
    pub fn low_space(&self) -> bool {
        self.low_space
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let at = self.ring.physical(self.start) as usize * CHUNK_BLOCK_SIZE + CHUNK_HEADER_SIZE;
        // Safety: the reservation makes this the only handle to these free chunks.
        unsafe { core::slice::from_raw_parts_mut(self.ring.data.ptr_at(at), self.size as usize) }
    }

    pub fn as_raw(&self) -> RawHandle {
        let at = self.ring.physical(self.start) as usize * CHUNK_BLOCK_SIZE + CHUNK_HEADER_SIZE;
        RawHandle {
            data_addr: self.ring.data.ptr_at(at),
            result: ResultCode::Success,
        }
    }

    /// Offset and length of the bytes this entry touches within the ring data.
    ///
    /// A wrapped entry also wrote the padding at the end, the range is the whole ring then.
    pub fn touched_range(&self) -> (usize, usize) {
        if self.wrapped {
            return (0, self.ring.capacity_bytes());
        }

        (
            self.ring.physical(self.start) as usize * CHUNK_BLOCK_SIZE,
            self.blocks as usize * CHUNK_BLOCK_SIZE,
        )
    }

    /// Publish the entry to the consumer.
    pub fn commit(self) {
        let ring = self.ring;
        ring.write_chunk_header(
            self.start,
            ChunkHeader {
                block_num: self.blocks,
                data_size: self.size,
            },
        );
        ring.publish(ring.advance(self.start, self.blocks));
        // Releases the reservation.
        drop(self);
    }
}

impl Drop for WriteChunk<'_> {
    fn drop(&mut self) {
        self.ring
            .state
            .producer
            .reserved
            .store(false, Ordering::Release);
    }
}

impl From<&WriteChunk<'_>> for RawHandle {
    fn from(chunk: &WriteChunk<'_>) -> Self {
        chunk.as_raw()
    }
}

impl<'a> ReadChunk<'a> {
    pub fn data(&self) -> &'a [u8] {
        // Safety: committed, and the consumer side is held by this chunk.
        unsafe { self.ring.payload(self.start, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_raw(&self) -> RawHandle {
        RawHandle {
            data_addr: self.data().as_ptr() as *mut u8,
            result: ResultCode::Success,
        }
    }

    /// Free the entry for the producer.
    pub fn consume(self) {
        self.ring
            .release(self.ring.advance(self.start, self.blocks));
    }
}

impl From<&ReadChunk<'_>> for RawHandle {
    fn from(chunk: &ReadChunk<'_>) -> Self {
        chunk.as_raw()
    }
}

impl Drop for ReadChunk<'_> {
    fn drop(&mut self) {
        self.ring
            .state
            .consumer
            .reading
            .store(false, Ordering::Release);
    }
}

impl fmt::Display for RingRecoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingRecoverError::CapacityMismatch { persisted } => {
                write!(f, "ring was persisted with {persisted} chunks")
            }
            RingRecoverError::CursorOutOfRange => f.write_str("ring cursors out of range"),
            RingRecoverError::CorruptChunk { cursor } => {
                write!(f, "corrupt chunk header at cursor {cursor}")
            }
            RingRecoverError::ChainMismatch => f.write_str("chunk chain misses the write cursor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::region;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn fresh_state() -> &'static RingState {
        Box::leak(Box::<RingState>::default())
    }

    fn ring(chunks: usize) -> (Ring<'static>, &'static RingHead, Span) {
        let span: &'static Span = Box::leak(Box::new(region((chunks + 1) * CHUNK_BLOCK_SIZE)));
        let head: &'static RingHead = unsafe { span.get(0) };
        let data = span.slice(CHUNK_BLOCK_SIZE, chunks * CHUNK_BLOCK_SIZE).unwrap();
        (Ring::create_new(fresh_state(), head, data), head, data)
    }

    fn write(ring: &Ring, bytes: &[u8]) -> Result<(), ResultCode> {
        let mut chunk = ring.alloc(bytes.len())?;
        chunk.data_mut().copy_from_slice(bytes);
        chunk.commit();
        Ok(())
    }

    #[test]
    fn fifo_within_a_ring() {
        let (ring, ..) = ring(8);

        write(&ring, b"first").unwrap();
        write(&ring, b"second").unwrap();

        let chunk = ring.read_begin().unwrap();
        assert_eq!(chunk.data(), b"first");
        chunk.consume();

        let chunk = ring.read_begin().unwrap();
        assert_eq!(chunk.data(), b"second");
        chunk.consume();

        assert_eq!(ring.read_begin().err(), Some(ResultCode::Empty));
        assert!(ring.is_empty());
    }

    #[test]
    fn sizes_out_of_bounds() {
        let (ring, ..) = ring(4);

        assert_eq!(ring.alloc(0).err(), Some(ResultCode::AllocSizeInvalid));
        assert_eq!(ring.alloc(4 * 64 - 7).err(), Some(ResultCode::AllocSizeInvalid));
        assert!(ring.alloc(4 * 64 - 8).is_ok());
    }

    #[test]
    fn one_producer_at_a_time() {
        let (ring, ..) = ring(4);

        let chunk = ring.alloc(10).unwrap();
        assert_eq!(ring.alloc(10).err(), Some(ResultCode::AllocFailedByRaceCondition));
        drop(chunk);

        // Abandoned, nothing was published.
        assert!(ring.is_empty());
        assert!(ring.alloc(10).is_ok());
    }

    #[test]
    fn raw_handles_of_results() {
        let (ring, ..) = ring(4);

        let granted = ring.alloc(10);
        let raw = RawHandle::from_result(&granted);
        assert_eq!(raw.result, ResultCode::Success);
        assert!(!raw.data_addr.is_null());

        let refused = ring.alloc(10);
        let raw = RawHandle::from_result(&refused);
        assert_eq!(raw, RawHandle::failed(ResultCode::AllocFailedByRaceCondition));

        granted.unwrap().commit();
        let read = ring.read_begin();
        assert_eq!(RawHandle::from_result(&read).result, ResultCode::Success);
    }

    #[test]
    fn full_until_consumed() {
        let (ring, ..) = ring(4);

        assert!(!ring.alloc(1).unwrap().low_space());

        write(&ring, &[1; 100]).unwrap();
        let chunk = ring.alloc(1).unwrap();
        assert!(chunk.low_space());
        chunk.commit();

        write(&ring, &[2; 1]).unwrap();
        assert_eq!(ring.alloc(1).err(), Some(ResultCode::NotEnoughSpace));
        assert_eq!(ring.used_blocks(), 4);

        ring.read_begin().unwrap().consume();
        write(&ring, &[3; 100]).unwrap();
    }

    #[test]
    fn wraps_with_padding() {
        let (ring, ..) = ring(4);

        write(&ring, &[1; 100]).unwrap();
        write(&ring, &[2; 50]).unwrap();
        ring.read_begin().unwrap().consume();
        ring.read_begin().unwrap().consume();

        // Cursor at chunk 3: a two-chunk entry has to wrap.
        let mut chunk = ring.alloc(100).unwrap();
        assert!(chunk.wrapped());
        chunk.data_mut().fill(3);
        chunk.commit();

        let chunk = ring.read_begin().unwrap();
        assert_eq!(chunk.data(), &[3; 100][..]);
        chunk.consume();
        assert!(ring.is_empty());
    }

    #[test]
    fn padding_published_alone() {
        let (ring, ..) = ring(4);

        write(&ring, &[1; 100]).unwrap();
        write(&ring, &[2; 50]).unwrap();

        // Chunk 3 is free but two chunks are needed, and chunks 0 to 2 are still held.
        assert_eq!(ring.alloc(100).err(), Some(ResultCode::DataNotContiguous));
        assert_eq!(ring.used_blocks(), 4);

        let chunk = ring.read_begin().unwrap();
        assert_eq!(chunk.data(), &[1; 100][..]);
        chunk.consume();
        let chunk = ring.read_begin().unwrap();
        assert_eq!(chunk.data(), &[2; 50][..]);
        chunk.consume();

        write(&ring, &[3; 100]).unwrap();
        let chunk = ring.read_begin().unwrap();
        assert_eq!(chunk.data(), &[3; 100][..]);
    }

    #[test]
    fn single_consumer() {
        let (ring, ..) = ring(4);
        write(&ring, b"x").unwrap();

        let held = ring.read_begin().unwrap();
        assert_eq!(ring.read_begin().err(), Some(ResultCode::WaitAndRetry));
        assert_eq!(ring.data_traverse(|_| {}).err(), Some(ResultCode::WaitAndRetry));
        drop(held);

        // Not consumed by the drop.
        let mut seen = 0;
        assert_eq!(ring.data_traverse(|data| seen += data.len()), Ok(1));
        assert_eq!(seen, 1);
        assert!(!ring.is_empty());
    }

    #[test]
    fn recovers_snapshot() {
        let (ring, head, data) = ring(8);

        write(&ring, b"consumed").unwrap();
        write(&ring, b"kept").unwrap();
        write(&ring, b"also kept").unwrap();
        ring.read_begin().unwrap().consume();

        let (ring, err) = Ring::recover_existing(fresh_state(), head, data);
        assert_eq!(err, None);

        let mut entries = Vec::new();
        ring.data_traverse(|data| entries.push(data.to_vec())).unwrap();
        assert_eq!(entries, [&b"kept"[..], &b"also kept"[..]]);
    }

    #[test]
    fn corrupt_chunk_resets() {
        let (ring, head, data) = ring(8);

        write(&ring, b"entry").unwrap();
        // Scribble over the chunk header.
        unsafe { data.as_ptr().cast::<u32>().write(0) };

        let (ring, err) = Ring::recover_existing(fresh_state(), head, data);
        assert_eq!(err, Some(RingRecoverError::CorruptChunk { cursor: 0 }));
        assert!(ring.is_empty());
        assert_eq!(ring.read_begin().err(), Some(ResultCode::Empty));
    }

    #[test]
    fn rejects_foreign_capacity() {
        let (_, head, data) = ring(8);

        let smaller = data.slice(0, 4 * CHUNK_BLOCK_SIZE).unwrap();
        let (_, err) = Ring::recover_existing(fresh_state(), head, smaller);
        assert_eq!(err, Some(RingRecoverError::CapacityMismatch { persisted: 8 }));
    }
}
