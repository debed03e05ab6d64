//! Room for entries larger than any block.
//!
//! The oversize arena is an arena of a single block, laid out and recovered like the main one. It
//! lives in a mapping of its own: a file next to the arena file at high reliability, anonymous
//! memory otherwise. Its entries are handed out under [`OVERSIZE_BLOCK`].
use std::io;
use std::path::{Path, PathBuf};

use logbuf_state::{ArenaLayout, BlockList, IndexedPtr, Ring, NODE_HEADER_SIZE};
use tracing::debug;

use crate::backing::Backing;
use crate::recovery::{self, PREAMBLE_SIZE};
use crate::{LogBufferConfig, OpenError};

/// The block index entries of the oversize arena are reported under. Never a block of the arena.
pub const OVERSIZE_BLOCK: u16 = IndexedPtr::EMPTY_INDEX;

/// The file holding the oversize entries of the arena file at `arena`.
pub fn oversize_path(arena: &Path) -> PathBuf {
    arena.with_extension("oversize")
}

pub(crate) struct Oversize {
    list: BlockList,
    /// Dropped after the list.
    backing: Backing,
}

impl Oversize {
    /// Map and recover the oversize arena of a log, `None` if it has none configured.
    ///
    /// `arena` is the file of the main arena, without one the oversize arena is anonymous.
    pub(crate) fn open(
        config: &LogBufferConfig,
        arena: Option<&Path>,
    ) -> Result<Option<Self>, OpenError> {
        if config.oversize_size == 0 {
            return Ok(None);
        }

        let config = LogBufferConfig {
            max_blocks_count: 1,
            total_size: config.oversize_size,
            initial_blocks: 1,
            ..config.clone()
        };

        let layout = ArenaLayout::compute(1, config.total_size)?;
        let len = recovery::mapping_len(&layout);

        let backing = match arena {
            Some(path) => Backing::file(&oversize_path(path), len)?,
            None => Backing::anonymous(len)?,
        };

        let (list, recovery) = recovery::open_arena(&backing, &config, &layout)?;
        if list.first().is_none() {
            if let Some(index) = list.take_free() {
                list.link(index);
            }
        }

        if backing.is_persistent() {
            backing.flush()?;
        }

        debug!(
            name = %config.name,
            ?recovery,
            max_alloc = layout.max_alloc_size(),
            path = ?backing.path(),
            "oversize arena open"
        );

        Ok(Some(Oversize { list, backing }))
    }

    pub(crate) fn ring(&self) -> Option<Ring<'_>> {
        self.list.first().map(|node| node.ring())
    }

    pub(crate) fn max_alloc_size(&self) -> usize {
        self.list.layout().max_alloc_size()
    }

    /// Schedule the write-back of the ring header and the bytes a commit touched.
    pub(crate) fn flush_range(&self, touched: (usize, usize)) -> io::Result<()> {
        let Some(node) = self.list.first().filter(|_| self.backing.is_persistent()) else {
            return Ok(());
        };

        let offset = PREAMBLE_SIZE + self.list.layout().node_offset(node.index());
        let len = NODE_HEADER_SIZE + touched.0 + touched.1;
        self.backing.flush_async_range(offset, len)
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        self.backing.flush()
    }
}
