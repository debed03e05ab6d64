//! The fixed header in front of every log entry, and the layout of the entry behind it.
use bytemuck::{Pod, Zeroable};

/// Header stored inline at the start of every entry.
///
/// The argument payload and the extension-info block follow the header; both offsets are relative
/// to the start of the entry. Native byte order, fields at fixed offsets:
///
/// ```text
/// 0                 8                 12                16        18                19      20             24
/// [ timestamp_epoch | log_args_offset | ext_info_offset | padding | format_str_type | level | category_idx ]
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LogEntryHeader {
    /// Milliseconds since the unix epoch. The only ordering between entries of different blocks.
    pub timestamp_epoch: u64,
    pub log_args_offset: u32,
    pub ext_info_offset: u32,
    pub padding: u16,
    /// A [`StringEncoding`] tag of the format string.
    pub format_str_type: u8,
    pub level: u8,
    pub category_idx: u32,
}

const _: () = {
    use core::mem::{offset_of, size_of};

    assert!(offset_of!(LogEntryHeader, log_args_offset) == 8);
    assert!(offset_of!(LogEntryHeader, ext_info_offset) == 12);
    assert!(offset_of!(LogEntryHeader, padding) == 16);
    assert!(offset_of!(LogEntryHeader, format_str_type) == 18);
    assert!(offset_of!(LogEntryHeader, level) == 19);
    assert!(offset_of!(LogEntryHeader, category_idx) == 20);

    let fields = size_of::<u64>()
        + size_of::<u32>()
        + size_of::<u32>()
        + size_of::<u16>()
        + size_of::<u8>()
        + size_of::<u8>()
        + size_of::<u32>();

    assert!(size_of::<LogEntryHeader>() == fields);
    assert!(size_of::<LogEntryHeader>() == 24);
    assert!(size_of::<LogEntryHeader>() % 8 == 0);
};

/// Encoding of the format string referenced by an entry.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringEncoding {
    Utf8 = 17,
    Utf16 = 18,
}

impl StringEncoding {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            17 => Some(StringEncoding::Utf8),
            18 => Some(StringEncoding::Utf16),
            _ => None,
        }
    }
}

impl LogEntryHeader {
    pub const SIZE: usize = core::mem::size_of::<LogEntryHeader>();

    pub fn encoding(&self) -> Option<StringEncoding> {
        StringEncoding::from_tag(self.format_str_type)
    }
}

/// Where the parts of an entry go, for given payload sizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryLayout {
    pub args_offset: u32,
    pub ext_offset: u32,
    pub total: u32,
}

impl EntryLayout {
    /// Arguments directly behind the header, extension info behind the arguments at the next
    /// 8-byte boundary.
    pub fn new(args_len: usize, ext_len: usize) -> Option<Self> {
        let args_offset = LogEntryHeader::SIZE;
        let args_end = args_offset.checked_add(args_len)?;
        let ext_offset = args_end.checked_add(7)? & !7;
        let total = ext_offset.checked_add(ext_len)?;

        Some(EntryLayout {
            args_offset: u32::try_from(args_offset).ok()?,
            ext_offset: u32::try_from(ext_offset).ok()?,
            total: u32::try_from(total).ok()?,
        })
    }

    /// Write header and both payloads into `buf`, which must be at least `total` bytes.
    ///
    /// The offsets of `header` are overwritten with the ones of this layout.
    pub fn write(&self, buf: &mut [u8], header: &LogEntryHeader, args: &[u8], ext: &[u8]) {
        let header = LogEntryHeader {
            log_args_offset: self.args_offset,
            ext_info_offset: self.ext_offset,
            ..*header
        };

        let args_at = self.args_offset as usize;
        let ext_at = self.ext_offset as usize;

        buf[..LogEntryHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        buf[args_at..args_at + args.len()].copy_from_slice(args);
        buf[args_at + args.len()..ext_at].fill(0);
        buf[ext_at..ext_at + ext.len()].copy_from_slice(ext);
    }
}

/// A parsed view of an entry read back from a ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogEntry<'a> {
    pub header: LogEntryHeader,
    /// The argument payload, including trailing alignment bytes before the extension info.
    pub args: &'a [u8],
    pub ext: &'a [u8],
}

impl<'a> LogEntry<'a> {
    /// Parse an entry, checking that both offsets lie within `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let raw = bytes.get(..LogEntryHeader::SIZE)?;
        let header: LogEntryHeader = bytemuck::pod_read_unaligned(raw);

        let args_at = header.log_args_offset as usize;
        let ext_at = header.ext_info_offset as usize;

        if args_at < LogEntryHeader::SIZE || args_at > ext_at || ext_at > bytes.len() {
            return None;
        }

        Some(LogEntry {
            header,
            args: &bytes[args_at..ext_at],
            ext: &bytes[ext_at..],
        })
    }
}
