use core::fmt;

use crate::CACHE_LINE_SIZE;

/// Size of the block list header at the start of the arena.
pub const LIST_HEADER_SIZE: usize = CACHE_LINE_SIZE;
/// Size of the header of each block, in front of its ring payload.
pub const NODE_HEADER_SIZE: usize = CACHE_LINE_SIZE;
/// Granularity of ring allocations.
pub const CHUNK_BLOCK_SIZE: usize = CACHE_LINE_SIZE;

/// The geometry of an arena, derived once from the configuration.
///
/// ```text
/// 0                       blocks_offset
/// [ list header          ][ block 0 ][ block 1 ] ... [ block max_blocks_count - 1 ]
///                          ^ per_block_size bytes each
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaLayout {
    blocks_offset: u16,
    max_blocks_count: u16,
    per_block_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutError {
    /// Zero blocks, or so many that a block index collides with the empty marker.
    InvalidBlockCount,
    /// A block could not hold its header and a single chunk.
    BlockTooSmall,
    /// A block holds more chunks than a ring cursor can count.
    BlockTooLarge,
    /// The region is smaller than the layout requires.
    UnfittingSpan,
    /// The layout can not be represented by this architecture / pointer size.
    BadArchitectureLayout,
}

impl ArenaLayout {
    /// Split `total_size` bytes into `max_blocks_count` blocks.
    ///
    /// The per-block size is rounded down to a cache-line multiple. The list header comes on top
    /// of `total_size`, see [`ArenaLayout::list_span_len`].
    pub fn compute(max_blocks_count: u16, total_size: u64) -> Result<Self, LayoutError> {
        if max_blocks_count == 0 || max_blocks_count == u16::MAX {
            return Err(LayoutError::InvalidBlockCount);
        }

        let per_block = total_size / u64::from(max_blocks_count);
        let per_block = per_block - per_block % CACHE_LINE_SIZE as u64;
        let per_block_size =
            usize::try_from(per_block).map_err(|_| LayoutError::BadArchitectureLayout)?;

        if per_block_size < NODE_HEADER_SIZE + CHUNK_BLOCK_SIZE {
            return Err(LayoutError::BlockTooSmall);
        }

        // Cursors run modulo twice the chunk count, their distance is taken over four times it.
        let chunks = (per_block_size - NODE_HEADER_SIZE) / CHUNK_BLOCK_SIZE;
        if chunks > (u32::MAX / 4) as usize {
            return Err(LayoutError::BlockTooLarge);
        }

        let layout = ArenaLayout {
            blocks_offset: LIST_HEADER_SIZE as u16,
            max_blocks_count,
            per_block_size,
        };

        layout
            .blocks_size()
            .and_then(|size| size.checked_add(LIST_HEADER_SIZE))
            .ok_or(LayoutError::BadArchitectureLayout)?;

        Ok(layout)
    }

    /// Check that a region of `len` bytes can hold this layout.
    pub fn validate(&self, len: usize) -> Result<(), LayoutError> {
        if len < self.list_span_len() {
            return Err(LayoutError::UnfittingSpan);
        }

        Ok(())
    }

    pub fn max_blocks_count(&self) -> u16 {
        self.max_blocks_count
    }

    pub fn per_block_size(&self) -> usize {
        self.per_block_size
    }

    /// Offset of the first block relative to the list header.
    pub fn blocks_offset(&self) -> u16 {
        self.blocks_offset
    }

    /// Bytes of the list header and all blocks.
    pub fn list_span_len(&self) -> usize {
        usize::from(self.blocks_offset) + self.per_block_size * usize::from(self.max_blocks_count)
    }

    /// Offset of a block's node header, relative to the list header.
    pub fn node_offset(&self, index: u16) -> usize {
        usize::from(self.blocks_offset) + usize::from(index) * self.per_block_size
    }

    /// Bytes available to the ring of each block.
    pub fn ring_len(&self) -> usize {
        self.per_block_size - NODE_HEADER_SIZE
    }

    /// Number of chunks the ring of each block is made of.
    pub fn chunk_blocks(&self) -> u32 {
        (self.ring_len() / CHUNK_BLOCK_SIZE) as u32
    }

    /// The largest payload a single allocation can ever be granted.
    pub fn max_alloc_size(&self) -> usize {
        self.chunk_blocks() as usize * CHUNK_BLOCK_SIZE - crate::ring::CHUNK_HEADER_SIZE
    }

    /// The `total_size` to configure for blocks of at least `per_block_size` bytes.
    pub fn blocks_size_for(max_blocks_count: u16, per_block_size: usize) -> Option<u64> {
        let rounded = per_block_size.checked_add(CACHE_LINE_SIZE - 1)? & !(CACHE_LINE_SIZE - 1);
        u64::try_from(rounded)
            .ok()?
            .checked_mul(u64::from(max_blocks_count))
    }

    fn blocks_size(&self) -> Option<usize> {
        self.per_block_size
            .checked_mul(usize::from(self.max_blocks_count))
    }
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LayoutError::InvalidBlockCount => "block count must be within 1..65535",
            LayoutError::BlockTooSmall => "blocks can not hold a node header and one chunk",
            LayoutError::BlockTooLarge => "blocks have more chunks than a cursor can count",
            LayoutError::UnfittingSpan => "region is too small for the layout",
            LayoutError::BadArchitectureLayout => "layout does not fit the address space",
        };

        f.write_str(msg)
    }
}

#[test]
fn four_blocks_of_one_kilobyte() {
    let layout = ArenaLayout::compute(4, 4096).unwrap();

    assert_eq!(layout.per_block_size(), 1024);
    assert_eq!(layout.list_span_len(), 64 + 4096);
    assert_eq!(layout.node_offset(0), 64);
    assert_eq!(layout.node_offset(3), 64 + 3 * 1024);
    assert_eq!(layout.chunk_blocks(), 15);
    assert!(layout.max_alloc_size() >= 900);
}

#[test]
fn rejects_degenerate_geometry() {
    assert_eq!(ArenaLayout::compute(0, 4096), Err(LayoutError::InvalidBlockCount));
    assert_eq!(ArenaLayout::compute(u16::MAX, 1 << 30), Err(LayoutError::InvalidBlockCount));
    assert_eq!(ArenaLayout::compute(4, 4 * 127), Err(LayoutError::BlockTooSmall));

    let layout = ArenaLayout::compute(3, 1000).unwrap();
    assert_eq!(layout.per_block_size() % CACHE_LINE_SIZE, 0);
    assert!(layout.per_block_size() > NODE_HEADER_SIZE);
    assert_eq!(layout.validate(layout.list_span_len() - 1), Err(LayoutError::UnfittingSpan));
    assert_eq!(ArenaLayout::blocks_size_for(4, 1000), Some(4 * 1024));
}

#[test]
#[cfg(target_pointer_width = "64")]
fn cursor_range_bounds_block_size() {
    let largest = (NODE_HEADER_SIZE + (u32::MAX / 4) as usize * CHUNK_BLOCK_SIZE) as u64;

    let layout = ArenaLayout::compute(1, largest).unwrap();
    assert_eq!(layout.chunk_blocks(), u32::MAX / 4);
    assert_eq!(
        ArenaLayout::compute(1, largest + CHUNK_BLOCK_SIZE as u64),
        Err(LayoutError::BlockTooLarge)
    );
}
