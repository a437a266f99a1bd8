// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use rand::Rng;
use slog::{o, Drain, Level, LevelFilter, Logger};

use async_comm::commitlog::codec::{BlockCompressionCodec, NoneCodec};
use async_comm::commitlog::{
    BlockHeaderCommitLog, CommitLog, CommitLogBlockInfo, CommitLogBlockStream, CommitLogReader,
    CommitLogReaderOptions, Quarantine, FRAGMENT_HEADER_SIZE, MAGIC_DATA,
};
use async_comm::{Code, CommitLogConfig, Filesystem, FilesystemPtr, LocalFilesystem};

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Critical,
        ))
        .fuse(),
        o!("test" => "commit-log"),
    )
}

struct Fixture {
    dir: tempfile::TempDir,
    fs: FilesystemPtr,
    log: Logger,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = test_logger();
        let fs: FilesystemPtr = Arc::new(LocalFilesystem::new(dir.path(), Some(&log)).unwrap());
        Fixture { dir, fs, log }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name.trim_start_matches('/'))
    }

    fn config(&self, compressor: &str) -> CommitLogConfig {
        CommitLogConfig {
            compressor: compressor.to_string(),
            archive_root: "/archive".into(),
            status_file: self.dir.path().join("run").join("STATUS"),
            ..CommitLogConfig::default()
        }
    }
}

fn payload(revision: i64) -> Vec<u8> {
    format!("mutations up to revision {};", revision)
        .into_bytes()
        .into_iter()
        .cycle()
        .take(600)
        .collect()
}

/// Encoded size of one uncompressed block.
fn block_len(revision: i64) -> u64 {
    (BlockHeaderCommitLog::encoded_length_for(1) + payload(revision).len()) as u64
}

fn read_all(reader: &mut CommitLogReader) -> Vec<(i64, Vec<u8>)> {
    let mut header = BlockHeaderCommitLog::new(1);
    let mut blocks = Vec::new();
    while let Some(block) = reader.next(&mut header) {
        blocks.push((header.get_revision(), block.to_vec()));
    }
    blocks
}

#[test]
fn blocks_replay_in_write_order() {
    let fx = Fixture::new();
    let writer =
        CommitLog::new(fx.fs.clone(), "/log/user", &fx.config("zlib"), None, Some(&fx.log)).unwrap();
    for rev in &[10, 20, 15] {
        writer.write(1, &payload(*rev), *rev, true).unwrap();
    }
    assert_eq!(writer.get_latest_revision(), 20);
    writer.close().unwrap();

    let mut reader = CommitLogReader::new(fx.fs.clone(), "/log/user", Some(&fx.log)).unwrap();
    let blocks = read_all(&mut reader);
    let revisions: Vec<i64> = blocks.iter().map(|(rev, _)| *rev).collect();
    assert_eq!(revisions, vec![10, 20, 15]);
    for (rev, data) in &blocks {
        assert_eq!(data, &payload(*rev));
    }
    assert_eq!(reader.get_latest_revision(), 20);
    assert_eq!(reader.get_init_fragment_ids(), &[0]);
    assert_eq!(reader.last_fragment_id(), Some(0));
    assert!(reader.damaged_fragments().is_empty());
}

#[test]
fn flipped_payload_bit_is_quarantined() {
    let fx = Fixture::new();
    let config = fx.config("none");
    let writer = CommitLog::new(fx.fs.clone(), "/log/user", &config, None, Some(&fx.log)).unwrap();
    for rev in &[1, 2, 3] {
        writer.write(0, &payload(*rev), *rev, false).unwrap();
    }
    writer.close().unwrap();

    // flip one bit somewhere in the second block's payload
    let fragment = fx.path("/log/user/0");
    let mut bytes = fs::read(&fragment).unwrap();
    let payload_start = FRAGMENT_HEADER_SIZE + block_len(1)
        + BlockHeaderCommitLog::encoded_length_for(1) as u64;
    let offset = payload_start as usize + rand::thread_rng().gen_range(0..payload(2).len());
    bytes[offset] ^= 1 << rand::thread_rng().gen_range(0..8);
    fs::write(&fragment, &bytes).unwrap();

    let quarantine = Quarantine::from_config(&config, Some(&fx.log));
    let mut stream = CommitLogBlockStream::open(
        fx.fs.clone(),
        "/log/user",
        "0",
        Some(quarantine),
        Some(&fx.log),
    )
    .unwrap();
    let mut info = CommitLogBlockInfo::default();
    let mut header = BlockHeaderCommitLog::new(1);
    assert!(stream.next(&mut info, &mut header));
    assert_eq!(header.get_revision(), 1);
    assert!(!stream.next(&mut info, &mut header));
    assert_eq!(info.error, Some(Code::BlockCompressorChecksumMismatch));
    assert_eq!(info.start_offset, FRAGMENT_HEADER_SIZE + block_len(1));
    assert!(!stream.next(&mut info, &mut header));

    let archived = fs::read(fx.path("/archive/log/user/0")).unwrap();
    assert_eq!(archived, bytes);
    let status = fs::read_to_string(&config.status_file).unwrap();
    assert!(status.contains("WARNING - Corruption detected in commit log fragment /log/user/0"));
    assert!(status.contains("- Fragment archived to /archive/log/user/0"));

    // the reader returns the good block, then moves on
    let mut reader = CommitLogReader::new(fx.fs.clone(), "/log/user", Some(&fx.log)).unwrap();
    let blocks = read_all(&mut reader);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].0, 1);
    assert_eq!(
        reader.damaged_fragments(),
        &[(String::from("/log/user/0"), Code::BlockCompressorChecksumMismatch)]
    );
}

fn truncate(path: &Path, len: u64) {
    OpenOptions::new()
        .write(true)
        .open(path)
        .unwrap()
        .set_len(len)
        .unwrap();
}

#[test]
fn truncation_is_distinguished_from_eof() {
    let fx = Fixture::new();
    let writer =
        CommitLog::new(fx.fs.clone(), "/log/user", &fx.config("none"), None, Some(&fx.log)).unwrap();
    writer.write(0, &payload(1), 1, false).unwrap();
    writer.write(0, &payload(2), 2, false).unwrap();
    writer.close().unwrap();

    // clean end of stream
    let mut stream =
        CommitLogBlockStream::open(fx.fs.clone(), "/log/user", "0", None, Some(&fx.log)).unwrap();
    let mut info = CommitLogBlockInfo::default();
    let mut header = BlockHeaderCommitLog::new(1);
    assert!(stream.next(&mut info, &mut header));
    assert!(stream.next(&mut info, &mut header));
    assert!(!stream.next(&mut info, &mut header));
    assert!(info.is_ok());
    drop(stream);

    // cut the file in the middle of the second block header
    let file_length = FRAGMENT_HEADER_SIZE + block_len(1) + 20;
    truncate(&fx.path("/log/user/0"), file_length);
    let mut stream =
        CommitLogBlockStream::open(fx.fs.clone(), "/log/user", "0", None, Some(&fx.log)).unwrap();
    assert!(stream.next(&mut info, &mut header));
    assert!(!stream.next(&mut info, &mut header));
    assert_eq!(info.error, Some(Code::RangeserverTruncatedCommitLog));
    assert_eq!(info.end_offset, file_length);
    drop(stream);

    // and in the middle of its payload
    let file_length = FRAGMENT_HEADER_SIZE + block_len(1) + block_len(2) - 7;
    let writer =
        CommitLog::new(fx.fs.clone(), "/log/other", &fx.config("none"), None, Some(&fx.log)).unwrap();
    writer.write(0, &payload(1), 1, false).unwrap();
    writer.write(0, &payload(2), 2, false).unwrap();
    writer.close().unwrap();
    truncate(&fx.path("/log/other/0"), file_length);
    let mut stream =
        CommitLogBlockStream::open(fx.fs.clone(), "/log/other", "0", None, Some(&fx.log)).unwrap();
    assert!(stream.next(&mut info, &mut header));
    assert!(!stream.next(&mut info, &mut header));
    assert_eq!(info.error, Some(Code::RangeserverTruncatedCommitLog));
    assert_eq!(info.end_offset, file_length);
}

#[test]
fn truncated_fragment_is_quarantined_once() {
    let fx = Fixture::new();
    let config = fx.config("none");
    let writer = CommitLog::new(fx.fs.clone(), "/log/user", &config, None, Some(&fx.log)).unwrap();
    writer.write(0, &payload(1), 1, false).unwrap();
    writer.write(0, &payload(2), 2, false).unwrap();
    writer.close().unwrap();

    let block_start = FRAGMENT_HEADER_SIZE + block_len(1);
    let file_length = block_start + 30;
    truncate(&fx.path("/log/user/0"), file_length);
    let truncated = fs::read(fx.path("/log/user/0")).unwrap();

    let quarantine = Quarantine::from_config(&config, Some(&fx.log));
    let mut stream = CommitLogBlockStream::open(
        fx.fs.clone(),
        "/log/user",
        "0",
        Some(quarantine),
        Some(&fx.log),
    )
    .unwrap();
    let mut info = CommitLogBlockInfo::default();
    let mut header = BlockHeaderCommitLog::new(1);
    assert!(stream.next(&mut info, &mut header));
    assert!(!stream.next(&mut info, &mut header));
    assert_eq!(info.error, Some(Code::RangeserverTruncatedCommitLog));
    assert_eq!(info.start_offset, block_start);
    assert_eq!(info.end_offset, file_length);
    assert!(!stream.next(&mut info, &mut header));
    assert!(!stream.next(&mut info, &mut header));

    let archived = fs::read(fx.path("/archive/log/user/0")).unwrap();
    assert_eq!(archived, truncated);
    let status = fs::read_to_string(&config.status_file).unwrap();
    assert_eq!(
        status
            .matches("WARNING - Corruption detected in commit log fragment /log/user/0")
            .count(),
        1
    );
    assert!(status.contains(&format!("- Offset: {}..{}", block_start, file_length)));
    assert!(status.contains("- Fragment archived to /archive/log/user/0"));
}

/// Writes a fragment in the version 0 layout, with or without the fragment
/// header.
fn write_v0_fragment(fx: &Fixture, name: &str, with_header: bool, revisions: &[i64]) {
    let mut file = Vec::new();
    if with_header {
        file.extend_from_slice(b"CL0000\x0c\n");
    }
    for rev in revisions {
        let mut header = BlockHeaderCommitLog::new(0);
        header.base.magic = *MAGIC_DATA;
        header.revision = *rev;
        header.cluster_id = 77;
        let mut block = BytesMut::new();
        NoneCodec
            .deflate(&payload(*rev), &mut block, &mut header, 0)
            .unwrap();
        file.extend_from_slice(&block);
    }
    let path = fx.path(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, file).unwrap();
}

#[test]
fn version_zero_fragments_have_no_cluster_id() {
    let fx = Fixture::new();
    write_v0_fragment(&fx, "/log/old/0", true, &[4, 5]);
    write_v0_fragment(&fx, "/log/old/1", false, &[6]);

    let stream =
        CommitLogBlockStream::open(fx.fs.clone(), "/log/old", "1", None, Some(&fx.log)).unwrap();
    assert_eq!(stream.version(), 0);
    assert_eq!(stream.offset(), 0);
    drop(stream);

    let mut reader = CommitLogReader::new(fx.fs.clone(), "/log/old", Some(&fx.log)).unwrap();
    let mut header = BlockHeaderCommitLog::new(1);
    let mut revisions = Vec::new();
    while let Some(block) = reader.next(&mut header) {
        assert_eq!(header.version(), 0);
        assert_eq!(header.get_cluster_id(), 0);
        assert_eq!(block.to_vec(), payload(header.get_revision()));
        revisions.push(header.get_revision());
    }
    assert_eq!(revisions, vec![4, 5, 6]);
}

#[test]
fn fragment_filter_limits_replay() {
    let fx = Fixture::new();
    let config = CommitLogConfig {
        roll_limit: 1,
        ..fx.config("zlib")
    };
    let writer = CommitLog::new(fx.fs.clone(), "/log/user", &config, None, Some(&fx.log)).unwrap();
    for rev in 1..=4 {
        writer.write(0, &payload(rev), rev, false).unwrap();
    }
    writer.close().unwrap();

    let options = CommitLogReaderOptions {
        fragment_filter: vec![1, 3],
        quarantine: None,
    };
    let mut reader =
        CommitLogReader::with_options(fx.fs.clone(), "/log/user", options, Some(&fx.log)).unwrap();
    let revisions: Vec<i64> = read_all(&mut reader).iter().map(|(rev, _)| *rev).collect();
    assert_eq!(revisions, vec![2, 4]);
}

#[test]
fn linked_logs_replay_and_purge() {
    let fx = Fixture::new();
    let config = fx.config("zlib");

    let transfer = CommitLog::new(fx.fs.clone(), "/log/xfer", &config, None, Some(&fx.log)).unwrap();
    transfer.write(0, &payload(5), 5, false).unwrap();
    transfer.write(0, &payload(6), 6, false).unwrap();
    transfer.close().unwrap();

    let user = CommitLog::new(fx.fs.clone(), "/log/user", &config, None, Some(&fx.log)).unwrap();
    user.write(0, &payload(10), 10, false).unwrap();
    let mut xfer_reader = CommitLogReader::new(fx.fs.clone(), "/log/xfer", Some(&fx.log)).unwrap();
    user.link_log(0, &mut xfer_reader).unwrap();
    user.link_log(0, &mut xfer_reader).unwrap();
    user.write(0, &payload(12), 12, false).unwrap();
    user.sync().unwrap();
    assert!(user.get_linked_logs().contains("/log/xfer"));
    assert_eq!(user.get_current_fragment_file(), "/log/user/1");

    let mut reader = CommitLogReader::new(fx.fs.clone(), "/log/user", Some(&fx.log)).unwrap();
    let revisions: Vec<i64> = read_all(&mut reader).iter().map(|(rev, _)| *rev).collect();
    assert_eq!(revisions, vec![10, 12, 5, 6]);
    assert!(reader.get_linked_logs().contains("/log/xfer"));

    let fragments = user.fragments();
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].log_dir, "/log/xfer");
    assert_eq!(fragments[1].references, 1);

    // linked fragments stay until their log is declared removable
    let mut removed = HashSet::new();
    user.purge(11, &HashSet::new(), &mut removed).unwrap();
    assert_eq!(user.fragments().len(), 2);
    assert!(fx.fs.exists("/log/xfer/0").unwrap());

    let mut ok_logs = HashSet::new();
    ok_logs.insert(String::from("/log/xfer"));
    user.purge(11, &ok_logs, &mut removed).unwrap();
    assert!(user.fragments().is_empty());
    assert!(removed.contains("/log/xfer"));
    assert!(!fx.fs.exists("/log/xfer").unwrap());
    assert!(!fx.fs.exists("/log/user/0").unwrap());
    assert!(fx.fs.exists("/log/user/1").unwrap());

    let stats = user.get_stats("user");
    assert!(stats.contains("user-log-fragment[/log/user/1]\tsize\t"));
}

#[test]
fn writer_takes_over_replayed_fragments() {
    let fx = Fixture::new();
    let config = fx.config("zlib");
    let first = CommitLog::new(fx.fs.clone(), "/log/user", &config, None, Some(&fx.log)).unwrap();
    first.write(0, &payload(3), 3, false).unwrap();
    first.close().unwrap();
    drop(first);

    let mut reader = CommitLogReader::new(fx.fs.clone(), "/log/user", Some(&fx.log)).unwrap();
    assert_eq!(read_all(&mut reader).len(), 1);
    let second = CommitLog::new(
        fx.fs.clone(),
        "/log/user",
        &config,
        Some(&mut reader),
        Some(&fx.log),
    )
    .unwrap();
    assert_eq!(second.get_current_fragment_file(), "/log/user/1");
    assert_eq!(second.get_latest_revision(), 3);
    assert_eq!(second.fragments().len(), 1);

    let mut removed = HashSet::new();
    second.purge(4, &HashSet::new(), &mut removed).unwrap();
    assert!(!fx.fs.exists("/log/user/0").unwrap());
}
