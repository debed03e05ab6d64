use logbuf_state::{LogEntry, LogEntryHeader, RawHandle, ReadChunk, ResultCode};

use crate::LogBuffer;

/// Which block the next entry is taken from.
///
/// Entries of one block are always read in the order they were committed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadOrder {
    /// Round-robin over the blocks.
    #[default]
    PerBlock,
    /// The block whose oldest entry carries the smallest timestamp.
    Timestamp,
}

/// The single consumer of a [`LogBuffer`].
pub struct Reader<'a> {
    buffer: &'a LogBuffer,
    order: ReadOrder,
    next_block: u16,
}

/// The oldest entry of some block, until consumed or dropped.
pub struct ReadHandle<'r> {
    chunk: ReadChunk<'r>,
    block: u16,
    buffer: &'r LogBuffer,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buffer: &'a LogBuffer) -> Self {
        Reader {
            buffer,
            order: ReadOrder::default(),
            next_block: 0,
        }
    }

    pub fn with_order(self, order: ReadOrder) -> Self {
        Reader { order, ..self }
    }

    pub fn order(&self) -> ReadOrder {
        self.order
    }

    /// Claim the next entry. `Empty` if no block has one.
    ///
    /// Reading continues to work after the buffer was closed.
    pub fn read_begin(&mut self) -> Result<ReadHandle<'_>, ResultCode> {
        let found = match self.order {
            ReadOrder::PerBlock => self.next_per_block(),
            ReadOrder::Timestamp => self.next_by_timestamp(),
        };

        match found {
            Some((chunk, block)) => Ok(ReadHandle {
                chunk,
                block,
                buffer: self.buffer,
            }),
            None => {
                self.buffer.record(ResultCode::Empty);
                Err(ResultCode::Empty)
            }
        }
    }

    /// Visit every committed entry without consuming any, block by block.
    ///
    /// Returns the number of entries visited.
    pub fn traverse(&mut self, mut visit: impl FnMut(u16, &[u8])) -> Result<usize, ResultCode> {
        let mut count = 0;

        for block in self.buffer.readable_from(0) {
            let Some(ring) = self.buffer.ring(block) else {
                continue;
            };

            count += ring.data_traverse(|data| visit(block, data))?;
        }

        Ok(count)
    }

    /// Consume everything, handing each entry to `visit`. Returns the number of entries.
    pub fn drain(&mut self, mut visit: impl FnMut(u16, &[u8])) -> usize {
        let mut count = 0;

        while let Ok(handle) = self.read_begin() {
            visit(handle.block(), handle.data());
            handle.consume();
            count += 1;
        }

        count
    }

    fn next_per_block(&mut self) -> Option<(ReadChunk<'a>, u16)> {
        let buffer = self.buffer;

        for block in buffer.readable_from(self.next_block) {
            let Some(ring) = buffer.ring(block) else {
                continue;
            };

            if let Ok(chunk) = ring.read_begin() {
                self.next_block = block.wrapping_add(1);
                return Some((chunk, block));
            }
        }

        None
    }

    fn next_by_timestamp(&self) -> Option<(ReadChunk<'a>, u16)> {
        let buffer = self.buffer;
        let mut oldest: Option<(u64, ReadChunk<'a>, u16)> = None;

        for block in buffer.readable_from(0) {
            let Some(ring) = buffer.ring(block) else {
                continue;
            };

            let Ok(chunk) = ring.read_begin() else {
                continue;
            };

            let timestamp = timestamp_of(chunk.data());
            let older = oldest
                .as_ref()
                .map_or(true, |(best, ..)| timestamp < *best);

            // Dropping a candidate leaves its entry in place.
            if older {
                oldest = Some((timestamp, chunk, block));
            }
        }

        oldest.map(|(_, chunk, block)| (chunk, block))
    }
}

impl Drop for Reader<'_> {
    fn drop(&mut self) {
        self.buffer.release_reader();
    }
}

fn timestamp_of(data: &[u8]) -> u64 {
    match data.get(..LogEntryHeader::SIZE) {
        Some(raw) => bytemuck::pod_read_unaligned::<LogEntryHeader>(raw).timestamp_epoch,
        None => 0,
    }
}

impl<'r> ReadHandle<'r> {
    pub fn data(&self) -> &[u8] {
        self.chunk.data()
    }

    /// The entry, if the data is laid out as one.
    pub fn entry(&self) -> Option<LogEntry<'_>> {
        LogEntry::parse(self.chunk.data())
    }

    /// The block the entry was read from, [`crate::OVERSIZE_BLOCK`] for the oversize arena.
    pub fn block(&self) -> u16 {
        self.block
    }

    pub fn as_raw(&self) -> RawHandle {
        self.chunk.as_raw()
    }

    /// Free the entry and wake producers waiting for space.
    pub fn consume(self) {
        let ReadHandle { chunk, buffer, .. } = self;
        chunk.consume();
        buffer.notify_progress();
    }
}

impl From<&ReadHandle<'_>> for RawHandle {
    fn from(handle: &ReadHandle<'_>) -> Self {
        handle.as_raw()
    }
}
