//! Bringing an arena to a usable state at open.
//!
//! The arena is preceded by a preamble of one cache line:
//!
//! ```text
//! 0       8             16           24               32        36                 40    44
//! [ magic | fingerprint | total_size | per_block_size | version | max_blocks_count | crc | reserved ]
//! ```
//!
//! The fingerprint hashes the log name and its category names, the CRC covers everything before
//! it. An arena is only recovered if all of these match the configuration; otherwise it is
//! reinitialized and its content is lost.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use logbuf_state::{ArenaLayout, BlockList, RecoverError, RingRecoverError, Span};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backing::Backing;
use crate::{LogBufferConfig, OpenError};

pub const PREAMBLE_SIZE: usize = core::mem::size_of::<Preamble>();

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Preamble {
    magic: u64,
    fingerprint: u64,
    total_size: u64,
    per_block_size: u64,
    version: u32,
    max_blocks_count: u32,
    crc: u32,
    reserved: [u32; 5],
}

const _: () = {
    assert!(core::mem::size_of::<Preamble>() == logbuf_state::CACHE_LINE_SIZE);
    assert!(core::mem::offset_of!(Preamble, crc) == Preamble::CRC_COVERED);
};

/// What the open found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// There was nothing to recover.
    Fresh,
    /// The arena was picked up, `blocks` linked blocks with their entries.
    Recovered {
        blocks: usize,
        /// Blocks whose ring was inconsistent and emptied.
        resets: Vec<(u16, RingRecoverError)>,
    },
    /// An arena was found but not trusted; it was reinitialized.
    Reset(ResetReason),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResetReason {
    #[error("not a log buffer arena")]
    BadMagic,
    #[error("layout version {found} is not supported")]
    VersionMismatch { found: u32 },
    #[error("preamble checksum mismatch")]
    BadChecksum,
    #[error("arena belongs to a different log")]
    FingerprintMismatch,
    #[error("arena was laid out for a different geometry")]
    GeometryMismatch,
    #[error("block list rejected: {0}")]
    Chain(RecoverError),
}

impl Preamble {
    pub const MAGIC: u64 = u64::from_le_bytes(*b"logbuf\0\0");
    pub const VERSION: u32 = 1;
    const CRC_COVERED: usize = 40;

    pub(crate) fn new(config: &LogBufferConfig, layout: &ArenaLayout) -> Self {
        let mut preamble = Preamble {
            magic: Self::MAGIC,
            fingerprint: fingerprint(&config.name, &config.categories),
            total_size: config.total_size,
            per_block_size: layout.per_block_size() as u64,
            version: Self::VERSION,
            max_blocks_count: layout.max_blocks_count().into(),
            crc: 0,
            reserved: [0; 5],
        };

        preamble.crc = preamble.checksum();
        preamble
    }

    /// Read the preamble of an arena file, without mapping or locking it.
    pub fn read_from(path: &Path) -> std::io::Result<Self> {
        let mut bytes = [0u8; PREAMBLE_SIZE];
        File::open(path)?.read_exact(&mut bytes)?;
        Ok(bytemuck::cast(bytes))
    }

    fn load(span: &Span) -> Self {
        // Safety: the backing is at least a preamble long, we hold the lock of the mapping.
        let bytes = unsafe { core::slice::from_raw_parts(span.as_ptr(), PREAMBLE_SIZE) };
        bytemuck::pod_read_unaligned(bytes)
    }

    fn store(&self, span: &Span) {
        let bytes = bytemuck::bytes_of(self);
        // Safety: as in `load`, and nothing else references these bytes.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), span.as_ptr(), PREAMBLE_SIZE) };
    }

    fn checksum(&self) -> u32 {
        crc32fast::hash(&bytemuck::bytes_of(self)[..Self::CRC_COVERED])
    }

    /// Whether this looks like an intact preamble at all, regardless of what log it belongs to.
    pub fn validate(&self) -> Result<(), ResetReason> {
        if self.magic != Self::MAGIC {
            return Err(ResetReason::BadMagic);
        }

        if self.crc != self.checksum() {
            return Err(ResetReason::BadChecksum);
        }

        if self.version != Self::VERSION {
            return Err(ResetReason::VersionMismatch {
                found: self.version,
            });
        }

        Ok(())
    }

    fn matches(&self, expected: &Preamble) -> Result<(), ResetReason> {
        self.validate()?;

        if self.fingerprint != expected.fingerprint {
            return Err(ResetReason::FingerprintMismatch);
        }

        let geometry = |p: &Preamble| (p.total_size, p.per_block_size, p.max_blocks_count);
        if geometry(self) != geometry(expected) {
            return Err(ResetReason::GeometryMismatch);
        }

        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn per_block_size(&self) -> u64 {
        self.per_block_size
    }

    pub fn max_blocks_count(&self) -> u16 {
        self.max_blocks_count as u16
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Hash of the identity of a log: its name and its categories, in order.
///
/// The number of categories is kept in the upper half.
pub fn fingerprint(name: &str, categories: &[String]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(name.as_bytes());

    for category in categories {
        hasher.update(&[0]);
        hasher.update(category.as_bytes());
    }

    (categories.len() as u64) << 32 | u64::from(hasher.finalize())
}

/// Total bytes to map for an arena of the given layout.
pub(crate) fn mapping_len(layout: &ArenaLayout) -> usize {
    PREAMBLE_SIZE + layout.list_span_len()
}

/// Run the recovery protocol over a freshly mapped backing.
pub(crate) fn open_arena(
    backing: &Backing,
    config: &LogBufferConfig,
    layout: &ArenaLayout,
) -> Result<(BlockList, Recovery), OpenError> {
    let span = backing.span();
    let arena = span
        .slice(PREAMBLE_SIZE, layout.list_span_len())
        .ok_or(OpenError::Layout(logbuf_state::LayoutError::UnfittingSpan))?;
    let expected = Preamble::new(config, layout);

    if !backing.existed() {
        debug!(name = %config.name, "initializing a fresh arena");
        let list = initialize(&span, arena, config, &expected)?;
        return Ok((list, Recovery::Fresh));
    }

    let found = Preamble::load(&span);
    let recovered = found.matches(&expected).and_then(|()| {
        BlockList::recover_existing(arena, config.max_blocks_count, config.total_size)
            .map_err(ResetReason::Chain)
    });

    match recovered {
        Ok(list) => {
            let blocks = list.recovery_blocks();

            for (index, err) in &blocks.resets {
                warn!(name = %config.name, block = index, %err, "emptied an inconsistent block");
            }

            info!(
                name = %config.name,
                blocks = blocks.linked.len(),
                resets = blocks.resets.len(),
                "recovered arena"
            );

            let recovery = Recovery::Recovered {
                blocks: blocks.linked.len(),
                resets: blocks.resets,
            };

            Ok((list, recovery))
        }
        Err(reason) if config.reject_mismatch => Err(OpenError::Rejected(reason)),
        Err(reason) => {
            warn!(name = %config.name, %reason, "arena not recoverable, reinitializing");
            let list = initialize(&span, arena, config, &expected)?;
            Ok((list, Recovery::Reset(reason)))
        }
    }
}

fn initialize(
    span: &Span,
    arena: Span,
    config: &LogBufferConfig,
    preamble: &Preamble,
) -> Result<BlockList, OpenError> {
    // The preamble goes last. A crash in between leaves an arena that is rejected next time.
    Preamble::zeroed().store(span);
    let list = BlockList::create_new(arena, config.max_blocks_count, config.total_size)?;
    preamble.store(span);
    Ok(list)
}
