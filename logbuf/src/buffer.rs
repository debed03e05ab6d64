use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::cell::Cell;
use std::fs::File;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use logbuf_state::{
    ArenaLayout, BlockList, EntryLayout, LogEntryHeader, RawHandle, ResultCode, Ring,
    StringEncoding, WriteChunk,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::backing::Backing;
use crate::oversize::{Oversize, OVERSIZE_BLOCK};
use crate::reader::Reader;
use crate::recovery::{self, Recovery, PREAMBLE_SIZE};
use crate::stats::{Stats, StatsSnapshot};
use crate::{Context, LogBufferConfig, MemoryPolicy, OpenError, ReliabilityLevel};

/// Slice of a blocked producer's wait before it looks again.
const WAIT_SLICE: Duration = Duration::from_millis(10);
/// Passes over all blocks a producer retries when it only lost races.
const RACE_RETRIES: u32 = 64;

thread_local! {
    /// The block this thread allocated from last. Spreads producers over the blocks.
    static HINT: Cell<u16> = const { Cell::new(0) };
}

/// A log buffer: many producers, one consumer, over an arena of blocks.
///
/// Opening runs recovery once; a value of this type only exists after it completed. Producers
/// allocate with [`LogBuffer::alloc`] or [`LogBuffer::write_entry`] from any thread. The consumer
/// claims the single [`Reader`].
pub struct LogBuffer {
    list: BlockList,
    /// Process-local mirror of which blocks are on the chain, for scanning without a walk.
    linked: Box<[AtomicBool]>,
    config: LogBufferConfig,
    policy: MemoryPolicy,
    clock: fn() -> u64,
    open: AtomicBool,
    reader: AtomicBool,
    progress: Progress,
    expanding: Mutex<()>,
    capacity_reached: AtomicBool,
    link_seq: AtomicU64,
    stats: Stats,
    degraded: AtomicBool,
    recovery: Recovery,
    oversize: Option<Oversize>,
    /// Dropped last, the list points into it.
    backing: Backing,
}

/// Wakes producers waiting for the consumer.
#[derive(Default)]
struct Progress {
    epoch: AtomicU64,
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Stored in the misc data of every block when it is linked.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BlockMeta {
    /// Order in which blocks were linked, over the lifetime of the arena.
    pub link_seq: u64,
    pub linked_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub index: u16,
    pub meta: BlockMeta,
    /// Bytes committed and not yet consumed, counted in whole chunks.
    pub used_bytes: usize,
}

/// Describes an entry for [`LogBuffer::write_entry`].
#[derive(Clone, Copy, Debug)]
pub struct EntryMeta {
    pub level: u8,
    pub category_idx: u32,
    pub encoding: StringEncoding,
    /// Defaults to the clock of the context.
    pub timestamp_ms: Option<u64>,
}

/// A reserved region of the buffer.
///
/// Commit with [`WriteHandle::commit`] or [`LogBuffer::commit`]. Dropping the handle abandons the
/// region.
pub struct WriteHandle<'a> {
    chunk: WriteChunk<'a>,
    block: u16,
    buffer: &'a LogBuffer,
}

enum Attempt<'a> {
    Granted(WriteChunk<'a>, u16),
    /// Every block was out of space.
    Full,
    /// Some block was held by another producer.
    Raced,
}

impl LogBuffer {
    /// Open the buffer named in `config`, recovering a persisted arena if there is one.
    pub fn open(ctx: &Context, config: LogBufferConfig) -> Result<Self, OpenError> {
        config.validate()?;
        let layout = ArenaLayout::compute(config.max_blocks_count, config.total_size)?;
        let len = recovery::mapping_len(&layout);

        let backing = match config.reliability {
            ReliabilityLevel::High => {
                let path = match &config.backing_path {
                    Some(path) => path.clone(),
                    None => ctx.mapping_path(&config.name),
                };

                Backing::file(&path, len)?
            }
            ReliabilityLevel::Low | ReliabilityLevel::Normal => Backing::anonymous(len)?,
        };

        Self::with_backing(ctx, config, layout, backing)
    }

    /// Open a high reliability buffer over an already opened file, such as a memfd.
    pub fn open_with_file(
        ctx: &Context,
        config: LogBufferConfig,
        file: File,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        let layout = ArenaLayout::compute(config.max_blocks_count, config.total_size)?;
        let backing = Backing::from_file(file, recovery::mapping_len(&layout))?;

        let config = LogBufferConfig {
            reliability: ReliabilityLevel::High,
            ..config
        };

        Self::with_backing(ctx, config, layout, backing)
    }

    fn with_backing(
        ctx: &Context,
        config: LogBufferConfig,
        layout: ArenaLayout,
        backing: Backing,
    ) -> Result<Self, OpenError> {
        let policy = config.effective_policy();
        if policy != config.policy {
            warn!(
                name = %config.name,
                configured = ?config.policy,
                effective = ?policy,
                reliability = ?config.reliability,
                "memory policy overridden by the reliability level"
            );
        }

        let (list, recovery) = recovery::open_arena(&backing, &config, &layout)?;
        let oversize = Oversize::open(&config, backing.path())?;

        let max = layout.max_blocks_count();
        let linked: Box<[AtomicBool]> = (0..max).map(|_| AtomicBool::new(false)).collect();
        let mut next_seq = 0;

        for node in list.iter() {
            linked[usize::from(node.index())].store(true, Ordering::Relaxed);
            let meta: BlockMeta = node.misc().unwrap_or_default();
            next_seq = next_seq.max(meta.link_seq + 1);
        }

        let buffer = LogBuffer {
            list,
            linked,
            policy,
            clock: ctx.clock(),
            open: AtomicBool::new(true),
            reader: AtomicBool::new(false),
            progress: Progress::default(),
            expanding: Mutex::new(()),
            capacity_reached: AtomicBool::new(false),
            link_seq: AtomicU64::new(next_seq),
            stats: Stats::default(),
            degraded: AtomicBool::new(false),
            recovery,
            oversize,
            backing,
            config,
        };

        let wanted = match buffer.policy {
            MemoryPolicy::AutoExpandWhenFull => buffer.config.initial_blocks.max(1),
            MemoryPolicy::DiscardWhenFull | MemoryPolicy::BlockWhenFull => max,
        };

        while buffer.linked_count() < usize::from(wanted) {
            if buffer.link_block().is_none() {
                break;
            }
        }

        if buffer.backing.is_persistent() {
            buffer.backing.flush()?;
        }

        info!(
            name = %buffer.config.name,
            blocks = buffer.linked_count(),
            max_blocks = max,
            per_block = layout.per_block_size(),
            path = ?buffer.backing.path(),
            "log buffer open"
        );

        Ok(buffer)
    }

    /// Reserve `size` contiguous bytes in some block.
    ///
    /// What happens when no block has room depends on the effective [`MemoryPolicy`]. Sizes no
    /// block can hold are served by the oversize arena, if the log has one.
    pub fn alloc(&self, size: usize) -> Result<WriteHandle<'_>, ResultCode> {
        if !self.open.load(Ordering::Acquire) {
            return Err(self.fatal(ResultCode::BufferNotInited));
        }

        if size == 0 {
            return Err(self.fatal(ResultCode::AllocSizeInvalid));
        }

        if size > self.list.layout().max_alloc_size() {
            return self.alloc_oversize(size);
        }

        let deadline = self.config.block_timeout.map(|t| Instant::now() + t);
        let mut policy = self.policy;
        let mut races = 0;

        loop {
            let seen = self.progress.epoch.load(Ordering::SeqCst);

            match self.try_alloc(size) {
                Attempt::Granted(chunk, block) => {
                    self.stats.record(ResultCode::Success);
                    return Ok(WriteHandle {
                        chunk,
                        block,
                        buffer: self,
                    });
                }
                Attempt::Raced if races < RACE_RETRIES => {
                    races += 1;
                    core::hint::spin_loop();
                }
                Attempt::Raced => {
                    races = 0;
                    match policy {
                        MemoryPolicy::DiscardWhenFull => {
                            self.stats.record(ResultCode::AllocFailedByRaceCondition);
                            return Err(ResultCode::AllocFailedByRaceCondition);
                        }
                        MemoryPolicy::BlockWhenFull => self.wait_for_progress(seen, deadline)?,
                        // Never waits behind a reservation while blocks are free.
                        MemoryPolicy::AutoExpandWhenFull => {
                            if !self.expand() {
                                policy = self.config.expansion_fallback();
                            }
                        }
                    }
                }
                Attempt::Full => match policy {
                    MemoryPolicy::DiscardWhenFull => {
                        self.stats.record(ResultCode::NotEnoughSpace);
                        return Err(ResultCode::NotEnoughSpace);
                    }
                    MemoryPolicy::BlockWhenFull => self.wait_for_progress(seen, deadline)?,
                    MemoryPolicy::AutoExpandWhenFull => {
                        if !self.expand() {
                            policy = self.config.expansion_fallback();
                        }
                    }
                },
            }
        }
    }

    /// Allocate, lay out and commit a complete entry.
    pub fn write_entry(&self, meta: &EntryMeta, args: &[u8], ext: &[u8]) -> Result<(), ResultCode> {
        let Some(layout) = EntryLayout::new(args.len(), ext.len()) else {
            return Err(self.fatal(ResultCode::AllocSizeInvalid));
        };

        let header = LogEntryHeader {
            timestamp_epoch: meta.timestamp_ms.unwrap_or_else(self.clock),
            format_str_type: meta.encoding as u8,
            level: meta.level,
            category_idx: meta.category_idx,
            ..LogEntryHeader::default()
        };

        let mut handle = self.alloc(layout.total as usize)?;
        layout.write(handle.data_mut(), &header, args, ext);
        handle.commit()
    }

    /// Publish an entry. See [`WriteHandle::commit`].
    pub fn commit(&self, handle: WriteHandle<'_>) -> Result<(), ResultCode> {
        debug_assert!(core::ptr::eq(self, handle.buffer));
        handle.commit()
    }

    /// Claim the consumer side. `None` while another reader exists.
    pub fn reader(&self) -> Option<Reader<'_>> {
        self.reader
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Reader::new(self))
    }

    /// Stop accepting writes and wake all blocked producers.
    ///
    /// Entries committed so far remain readable. Also done on drop.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Err(err) = self.flush_all() {
            warn!(name = %self.config.name, %err, "final flush of the backing file failed");
        }

        self.progress.wake_all();
        debug!(name = %self.config.name, stats = %self.stats.snapshot(), "log buffer closed");
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write back the whole arena and wait for the write-back.
    pub fn sync(&self) -> Result<(), ResultCode> {
        self.flush_all().map_err(|err| {
            warn!(name = %self.config.name, %err, "flushing the backing file failed");
            self.stats.record(ResultCode::MmapSync);
            ResultCode::MmapSync
        })
    }

    /// Whether a flush of the backing file failed. Entries are still committed, but no longer
    /// written back per commit.
    pub fn durability_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn recovery(&self) -> &Recovery {
        &self.recovery
    }

    pub fn config(&self) -> &LogBufferConfig {
        &self.config
    }

    /// The policy in effect, after the reliability level overrode the configured one.
    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    /// The linked blocks, in chain order.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        self.list
            .iter()
            .map(|node| {
                let ring = node.ring();
                BlockInfo {
                    index: node.index(),
                    meta: node.misc().unwrap_or_default(),
                    used_bytes: ring.used_blocks() as usize * logbuf_state::CHUNK_BLOCK_SIZE,
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn backing(&self) -> &Backing {
        &self.backing
    }

    /// The ring of a linked block or, for [`OVERSIZE_BLOCK`], of the oversize arena.
    pub(crate) fn ring(&self, block: u16) -> Option<Ring<'_>> {
        if block == OVERSIZE_BLOCK {
            return self.oversize.as_ref()?.ring();
        }

        self.list.node_checked(block).map(|node| node.ring())
    }

    /// Linked blocks round-robin from `start`, the oversize arena between the last and the first.
    pub(crate) fn readable_from(&self, start: u16) -> impl Iterator<Item = u16> + '_ {
        let slots = self.linked.len();
        let start = match start {
            OVERSIZE_BLOCK => slots,
            start => usize::from(start).min(slots),
        };

        (start..=slots).chain(0..start).filter_map(move |slot| match self.linked.get(slot) {
            Some(linked) => linked.load(Ordering::Acquire).then_some(slot as u16),
            None => self.oversize.as_ref().map(|_| OVERSIZE_BLOCK),
        })
    }

    /// Indices of linked blocks, starting at `start` and wrapping around.
    pub(crate) fn linked_from(&self, start: u16) -> impl Iterator<Item = u16> + '_ {
        let max = self.linked.len();
        let start = usize::from(start) % max.max(1);

        (start..max)
            .chain(0..start)
            .filter(move |&index| self.linked[index].load(Ordering::Acquire))
            .map(|index| index as u16)
    }

    pub(crate) fn linked_count(&self) -> usize {
        self.linked
            .iter()
            .filter(|linked| linked.load(Ordering::Acquire))
            .count()
    }

    pub(crate) fn record(&self, code: ResultCode) {
        self.stats.record(code);
    }

    pub(crate) fn release_reader(&self) {
        self.reader.store(false, Ordering::Release);
    }

    /// Called by the consumer whenever it freed space.
    pub(crate) fn notify_progress(&self) {
        self.progress.advance();
    }

    fn try_alloc(&self, size: usize) -> Attempt<'_> {
        let hint = HINT.with(Cell::get);
        let mut raced = false;

        for index in self.linked_from(hint) {
            let Some(node) = self.list.node_checked(index) else {
                continue;
            };

            match node.ring().alloc(size) {
                Ok(chunk) => {
                    HINT.with(|h| h.set(index));
                    if chunk.wrapped() {
                        self.stats.record(ResultCode::DataNotContiguous);
                    }

                    return Attempt::Granted(chunk, index);
                }
                Err(ResultCode::AllocFailedByRaceCondition) => raced = true,
                Err(code) => {
                    if code == ResultCode::DataNotContiguous {
                        self.stats.record(code);
                    }
                }
            }
        }

        if raced {
            Attempt::Raced
        } else {
            Attempt::Full
        }
    }

    /// One entry at a time in the oversize arena. It never expands.
    fn alloc_oversize(&self, size: usize) -> Result<WriteHandle<'_>, ResultCode> {
        let ring = self
            .oversize
            .as_ref()
            .filter(|oversize| size <= oversize.max_alloc_size())
            .and_then(Oversize::ring);

        let Some(ring) = ring else {
            return Err(self.fatal(ResultCode::AllocSizeInvalid));
        };

        let deadline = self.config.block_timeout.map(|t| Instant::now() + t);
        let policy = match self.policy {
            MemoryPolicy::AutoExpandWhenFull => self.config.expansion_fallback(),
            policy => policy,
        };
        let mut races = 0;

        loop {
            let seen = self.progress.epoch.load(Ordering::SeqCst);

            let code = match ring.alloc(size) {
                Ok(chunk) => {
                    if chunk.wrapped() {
                        self.stats.record(ResultCode::DataNotContiguous);
                    }

                    self.stats.record(ResultCode::Success);
                    return Ok(WriteHandle {
                        chunk,
                        block: OVERSIZE_BLOCK,
                        buffer: self,
                    });
                }
                Err(ResultCode::AllocFailedByRaceCondition) if races < RACE_RETRIES => {
                    races += 1;
                    core::hint::spin_loop();
                    continue;
                }
                Err(ResultCode::DataNotContiguous) => {
                    self.stats.record(ResultCode::DataNotContiguous);
                    ResultCode::NotEnoughSpace
                }
                Err(code) => code,
            };

            races = 0;
            if policy == MemoryPolicy::BlockWhenFull {
                self.wait_for_progress(seen, deadline)?;
            } else {
                self.stats.record(code);
                return Err(code);
            }
        }
    }

    /// Link one more block. Returns `false` once the arena has none left.
    fn expand(&self) -> bool {
        // Another producer is expanding, retrying will see its block.
        let Some(_guard) = self.expanding.try_lock() else {
            std::thread::yield_now();
            return true;
        };

        match self.link_block() {
            Some(index) => {
                info!(name = %self.config.name, block = index, "expanded log buffer");
                true
            }
            None => {
                if !self.capacity_reached.swap(true, Ordering::Relaxed) {
                    warn!(
                        name = %self.config.name,
                        fallback = ?self.config.expansion_fallback(),
                        "log buffer reached its maximum number of blocks"
                    );
                }

                false
            }
        }
    }

    fn link_block(&self) -> Option<u16> {
        let index = self.list.take_free()?;
        let node = self.list.node_checked(index)?;

        node.set_misc(&BlockMeta {
            link_seq: self.link_seq.fetch_add(1, Ordering::Relaxed),
            linked_at_ms: (self.clock)(),
        });

        self.list.link(index)?;
        self.linked[usize::from(index)].store(true, Ordering::Release);
        Some(index)
    }

    fn wait_for_progress(&self, seen: u64, deadline: Option<Instant>) -> Result<(), ResultCode> {
        self.progress.wait(seen, WAIT_SLICE, || self.is_open());

        if !self.is_open() {
            self.stats.record(ResultCode::BufferNotInited);
            return Err(ResultCode::BufferNotInited);
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.stats.record(ResultCode::WaitAndRetry);
            return Err(ResultCode::WaitAndRetry);
        }

        Ok(())
    }

    /// Misuse by the caller. Loud in debug builds.
    fn fatal(&self, code: ResultCode) -> ResultCode {
        self.stats.record(code);
        debug_assert!(!code.is_fatal(), "log buffer misuse: {code}");
        code
    }

    fn flush_all(&self) -> std::io::Result<()> {
        self.backing.flush()?;
        match &self.oversize {
            Some(oversize) => oversize.flush(),
            None => Ok(()),
        }
    }

    fn flush_block(&self, block: u16, touched: (usize, usize)) -> Result<(), ResultCode> {
        if self.degraded.load(Ordering::Relaxed) {
            return Ok(());
        }

        let flushed = if block == OVERSIZE_BLOCK {
            match &self.oversize {
                Some(oversize) => oversize.flush_range(touched),
                None => Ok(()),
            }
        } else if self.backing.is_persistent() {
            let layout = self.list.layout();
            let offset = PREAMBLE_SIZE + layout.node_offset(block);
            let len = logbuf_state::NODE_HEADER_SIZE + touched.0 + touched.1;
            self.backing.flush_async_range(offset, len)
        } else {
            Ok(())
        };

        flushed.map_err(|err| {
            if !self.degraded.swap(true, Ordering::AcqRel) {
                warn!(name = %self.config.name, %err, "write-back failed, continuing without durability");
            }

            self.stats.record(ResultCode::MmapSync);
            ResultCode::MmapSync
        })
    }
}

impl Drop for LogBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

impl Progress {
    fn advance(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    fn wake_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Wait for one slice unless the epoch moved past `seen` already.
    fn wait(&self, seen: u64, slice: Duration, open: impl Fn() -> bool) {
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let mut guard = self.lock.lock();
        if self.epoch.load(Ordering::SeqCst) == seen && open() {
            self.cond.wait_for(&mut guard, slice);
        }
        drop(guard);

        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'a> WriteHandle<'a> {
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.chunk.data_mut()
    }

    pub fn len(&self) -> usize {
        self.chunk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// The block now has at most half of its space left.
    pub fn low_space(&self) -> bool {
        self.chunk.low_space()
    }

    /// The block the region is in, [`OVERSIZE_BLOCK`] for the oversize arena.
    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn as_raw(&self) -> RawHandle {
        self.chunk.as_raw()
    }

    /// Publish the entry to the consumer.
    ///
    /// The entry is committed even if `MmapSync` is returned; only its write-back failed.
    pub fn commit(self) -> Result<(), ResultCode> {
        let WriteHandle {
            chunk,
            block,
            buffer,
        } = self;

        let touched = chunk.touched_range();
        chunk.commit();
        // Producers waiting on a race see the reservation released.
        buffer.notify_progress();
        buffer.flush_block(block, touched)
    }
}

impl From<&WriteHandle<'_>> for RawHandle {
    fn from(handle: &WriteHandle<'_>) -> Self {
        handle.as_raw()
    }
}
