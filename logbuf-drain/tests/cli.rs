#![cfg(target_family = "unix")]
use std::path::Path;

use assert_cmd::Command;
use logbuf::{
    Context, EntryMeta, LogBuffer, LogBufferConfig, MemoryPolicy, ReliabilityLevel, StringEncoding,
};

fn write_arena(path: &Path) {
    drop(open_arena(path));
}

fn open_arena(path: &Path) -> LogBuffer {
    let config = LogBufferConfig {
        name: "app".into(),
        categories: vec!["net".into(), "disk".into()],
        max_blocks_count: 4,
        total_size: 4096,
        policy: MemoryPolicy::AutoExpandWhenFull,
        reliability: ReliabilityLevel::High,
        backing_path: Some(path.to_owned()),
        ..LogBufferConfig::default()
    };

    let buffer = LogBuffer::open(&Context::default(), config).unwrap();
    for (timestamp, category_idx, text) in [(10, 0, "connected"), (20, 1, "flushed")] {
        let meta = EntryMeta {
            level: 3,
            category_idx,
            encoding: StringEncoding::Utf8,
            timestamp_ms: Some(timestamp),
        };
        buffer.write_entry(&meta, text.as_bytes(), &[]).unwrap();
    }
    buffer
}

fn drain_cmd(path: &Path) -> Command {
    let mut cmd = Command::cargo_bin("logbuf-drain").unwrap();
    cmd.arg("drain")
        .arg(path)
        .args(["--name", "app", "--category", "net", "--category", "disk"]);
    cmd
}

#[test]
fn inspect_prints_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.mmap");
    write_arena(&path);

    let assert = Command::cargo_bin("logbuf-drain")
        .unwrap()
        .arg("inspect")
        .arg(&path)
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("total_size: 4096"), "{stdout}");
    assert!(stdout.contains("per_block_size: 1024"), "{stdout}");
    assert!(stdout.contains("max_blocks_count: 4"), "{stdout}");
    assert!(stdout.contains("categories: 2"), "{stdout}");
}

#[test]
fn keep_then_drain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.mmap");
    write_arena(&path);

    let expected = "10\t3\tnet\tconnected\n20\t3\tdisk\tflushed\n";

    let before = std::fs::read(&path).unwrap();
    drain_cmd(&path).arg("--keep").assert().success().stdout(expected);
    assert!(std::fs::read(&path).unwrap() == before, "--keep wrote to the arena");

    drain_cmd(&path).assert().success().stdout(expected);
    drain_cmd(&path).assert().success().stdout("");
}

#[test]
fn keep_reads_a_live_arena() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.mmap");
    let buffer = open_arena(&path);

    // The writer holds the lock, only a copy can be opened.
    drain_cmd(&path).assert().failure();
    drain_cmd(&path)
        .arg("--keep")
        .assert()
        .success()
        .stdout("10\t3\tnet\tconnected\n20\t3\tdisk\tflushed\n");

    drop(buffer);
}

#[test]
fn drains_entries_larger_than_a_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.mmap");
    let buffer = open_arena(&path);

    let long = "x".repeat(1500);
    let meta = EntryMeta {
        level: 5,
        category_idx: 1,
        encoding: StringEncoding::Utf8,
        timestamp_ms: Some(15),
    };
    buffer.write_entry(&meta, long.as_bytes(), &[]).unwrap();
    drop(buffer);

    assert!(logbuf::oversize_path(&path).exists());
    let expected = format!("10\t3\tnet\tconnected\n15\t5\tdisk\t{long}\n20\t3\tdisk\tflushed\n");

    drain_cmd(&path).arg("--keep").assert().success().stdout(expected.clone());
    drain_cmd(&path).assert().success().stdout(expected);
    drain_cmd(&path).assert().success().stdout("");
}

#[test]
fn refuses_another_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.mmap");
    write_arena(&path);

    Command::cargo_bin("logbuf-drain")
        .unwrap()
        .arg("drain")
        .arg(&path)
        .args(["--name", "other"])
        .assert()
        .failure();

    // Untouched by the refusal.
    drain_cmd(&path)
        .arg("--keep")
        .assert()
        .success()
        .stdout("10\t3\tnet\tconnected\n20\t3\tdisk\tflushed\n");
}

#[test]
fn not_an_arena() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage");
    std::fs::write(&path, [0x17; 256]).unwrap();

    Command::cargo_bin("logbuf-drain")
        .unwrap()
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure();
}
