#![cfg(target_family = "unix")]
use std::path::{Path, PathBuf};

use logbuf::{
    Context, EntryMeta, LogBuffer, LogBufferConfig, MemoryPolicy, OpenError, ReadOrder, Recovery,
    ReliabilityLevel, ResetReason, StringEncoding,
};

fn config(path: &Path) -> LogBufferConfig {
    LogBufferConfig {
        name: "app".into(),
        categories: vec!["net".into(), "disk".into()],
        max_blocks_count: 4,
        total_size: 4096,
        initial_blocks: 1,
        policy: MemoryPolicy::AutoExpandWhenFull,
        reliability: ReliabilityLevel::High,
        backing_path: Some(path.to_owned()),
        ..LogBufferConfig::default()
    }
}

fn context(dir: &Path) -> Context {
    Context::new(dir).with_clock(|| 42)
}

fn entry(timestamp: u64, category_idx: u32) -> EntryMeta {
    EntryMeta {
        level: 4,
        category_idx,
        encoding: StringEncoding::Utf8,
        timestamp_ms: Some(timestamp),
    }
}

/// Write three block-filling entries and a small one, then copy the mapping while still open.
fn write_and_crash(dir: &Path) -> PathBuf {
    let live = dir.join("live.mmap");
    let image = dir.join("crash.mmap");

    let buffer = LogBuffer::open(&context(dir), config(&live)).unwrap();
    assert_eq!(buffer.recovery(), &Recovery::Fresh);

    for timestamp in 1..=3 {
        let args = [timestamp as u8; 800];
        buffer.write_entry(&entry(timestamp, 1), &args, &[]).unwrap();
    }

    buffer.write_entry(&entry(4, 0), b"tail", b"ext").unwrap();
    assert_eq!(buffer.blocks().len(), 3);

    // The shared mapping is the page cache of the file, a copy sees every committed entry.
    std::fs::copy(&live, &image).unwrap();
    drop(buffer);
    image
}

#[test]
fn recovers_a_crash_image() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_and_crash(dir.path());

    let buffer = LogBuffer::open(&context(dir.path()), config(&image)).unwrap();
    assert_eq!(
        buffer.recovery(),
        &Recovery::Recovered {
            blocks: 3,
            resets: vec![]
        }
    );

    let blocks = buffer.blocks();
    let seqs: Vec<_> = blocks.iter().map(|block| block.meta.link_seq).collect();
    // The chain starts at the block linked last.
    assert_eq!(seqs, [2, 1, 0]);
    assert!(blocks.iter().all(|block| block.meta.linked_at_ms == 42));

    let mut reader = buffer.reader().unwrap().with_order(ReadOrder::Timestamp);
    let mut seen = vec![];
    while let Ok(handle) = reader.read_begin() {
        let entry = handle.entry().unwrap();
        seen.push((entry.header.timestamp_epoch, entry.header.category_idx));
        if entry.header.timestamp_epoch == 4 {
            assert_eq!(&entry.args[..4], b"tail");
            assert_eq!(entry.ext, b"ext");
        } else {
            assert!(entry.args.iter().all(|&b| u64::from(b) == entry.header.timestamp_epoch));
        }
        handle.consume();
    }

    assert_eq!(seen, [(1, 1), (2, 1), (3, 1), (4, 0)]);
}

#[test]
fn recovered_buffer_keeps_linking() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_and_crash(dir.path());

    let buffer = LogBuffer::open(&context(dir.path()), config(&image)).unwrap();
    buffer.write_entry(&entry(5, 0), &[5; 800], &[]).unwrap();

    let mut seqs: Vec<_> = buffer.blocks().iter().map(|block| block.meta.link_seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, [0, 1, 2, 3]);
}

#[test]
fn corrupted_preamble_resets() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_and_crash(dir.path());

    let mut bytes = std::fs::read(&image).unwrap();
    bytes[17] ^= 0x10;
    std::fs::write(&image, &bytes).unwrap();

    let buffer = LogBuffer::open(&context(dir.path()), config(&image)).unwrap();
    assert_eq!(buffer.recovery(), &Recovery::Reset(ResetReason::BadChecksum));
    assert_eq!(buffer.blocks().len(), 1);

    let mut reader = buffer.reader().unwrap();
    assert_eq!(reader.drain(|_, _| {}), 0);
}

#[test]
fn other_log_is_rejected_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_and_crash(dir.path());

    let strict = LogBufferConfig {
        name: "other".into(),
        reject_mismatch: true,
        ..config(&image)
    };

    let err = LogBuffer::open(&context(dir.path()), strict).err();
    assert!(matches!(
        err,
        Some(OpenError::Rejected(ResetReason::FingerprintMismatch))
    ));

    // Rejecting leaves the arena alone, the right log still recovers it.
    let buffer = LogBuffer::open(&context(dir.path()), config(&image)).unwrap();
    assert!(matches!(buffer.recovery(), Recovery::Recovered { blocks: 3, .. }));
}

#[test]
fn second_open_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.mmap");

    let buffer = LogBuffer::open(&context(dir.path()), config(&path)).unwrap();
    let err = LogBuffer::open(&context(dir.path()), config(&path)).err();
    assert!(matches!(err, Some(OpenError::Locked(_))));

    drop(buffer);
    assert!(LogBuffer::open(&context(dir.path()), config(&path)).is_ok());
}

#[test]
fn mapping_named_after_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = LogBufferConfig {
        backing_path: None,
        ..config(dir.path())
    };

    let buffer = LogBuffer::open(&context(dir.path()), cfg).unwrap();
    buffer.write_entry(&entry(1, 0), b"hello", &[]).unwrap();
    assert_eq!(buffer.sync(), Ok(()));
    assert!(!buffer.durability_degraded());
    drop(buffer);

    let path = dir.path().join("app.mmap");
    let preamble = logbuf::Preamble::read_from(&path).unwrap();
    assert_eq!(preamble.validate(), Ok(()));
    assert_eq!(preamble.max_blocks_count(), 4);
    assert_eq!(preamble.total_size(), 4096);
    assert_eq!(
        preamble.fingerprint(),
        logbuf::fingerprint("app", &["net".into(), "disk".into()])
    );
}

#[test]
fn oversize_entries_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.mmap");
    let long = [0x6c; 3000];

    let buffer = LogBuffer::open(&context(dir.path()), config(&path)).unwrap();
    buffer.write_entry(&entry(1, 0), b"small", &[]).unwrap();
    buffer.write_entry(&entry(2, 1), &long, &[]).unwrap();
    drop(buffer);

    assert!(logbuf::oversize_path(&path).exists());

    let buffer = LogBuffer::open(&context(dir.path()), config(&path)).unwrap();
    let mut reader = buffer.reader().unwrap().with_order(ReadOrder::Timestamp);

    let first = reader.read_begin().unwrap();
    assert_eq!(first.entry().unwrap().header.timestamp_epoch, 1);
    first.consume();

    let second = reader.read_begin().unwrap();
    assert_eq!(second.block(), logbuf::OVERSIZE_BLOCK);
    let entry = second.entry().unwrap();
    assert_eq!(entry.header.timestamp_epoch, 2);
    assert_eq!(&entry.args[..long.len()], long);
    second.consume();

    assert!(reader.read_begin().is_err());
}
