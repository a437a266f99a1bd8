// Copyright 2020 Joyent, Inc.

//! The commit log: a directory of numbered fragment files, each holding a
//! stream of compressed, checksummed blocks of serialized updates.
//!
//! [`CommitLog`] appends blocks and rolls to a new fragment once the current
//! one grows past the roll limit.  [`CommitLogReader`] replays a log
//! directory, following `COMMITLINK` blocks into linked logs.  Both keep
//! their fragments in a [`FragmentArena`] ordered by revision so that
//! fragments can be purged once everything in them has been persisted.

use std::collections::HashSet;

pub mod block_header;
pub mod block_stream;
pub mod codec;
pub mod fragment;
pub mod reader;
pub mod writer;

pub use block_header::{
    BlockHeader, BlockHeaderCommitLog, BlockHeaderEncoding, CompressionType,
    BLOCK_HEADER_VERSION_LATEST, MAGIC_LENGTH,
};
pub use block_stream::{
    CommitLogBlockInfo, CommitLogBlockStream, Quarantine, FRAGMENT_HEADER_SIZE,
    LATEST_FRAGMENT_VERSION,
};
pub use codec::{create_block_codec, create_block_codec_for, BlockCompressionCodec};
pub use fragment::{CommitLogFileInfo, FragmentArena, FragmentId};
pub use reader::{CommitLogReader, CommitLogReaderOptions};
pub use writer::CommitLog;

pub const MAGIC_DATA: &[u8; MAGIC_LENGTH] = b"COMMITDATA";
pub const MAGIC_LINK: &[u8; MAGIC_LENGTH] = b"COMMITLINK";

/// Revision value meaning "nothing seen yet".
pub const TIMESTAMP_MIN: i64 = i64::MIN;

/// State shared by the commit-log writer and reader.
#[derive(Debug)]
pub struct CommitLogBase {
    pub(crate) log_dir: String,
    pub(crate) arena: FragmentArena,
    /// Fragments no longer being written, ordered by revision.
    pub(crate) fragment_queue: Vec<FragmentId>,
    pub(crate) latest_revision: i64,
    pub(crate) range_reference_required: bool,
    pub(crate) linked_logs: HashSet<String>,
}

impl CommitLogBase {
    pub(crate) fn new(log_dir: &str) -> CommitLogBase {
        CommitLogBase {
            log_dir: trim_dir(log_dir),
            arena: FragmentArena::new(),
            fragment_queue: Vec::new(),
            latest_revision: TIMESTAMP_MIN,
            range_reference_required: true,
            linked_logs: HashSet::new(),
        }
    }

    pub fn get_log_dir(&self) -> &str {
        &self.log_dir
    }

    pub fn get_latest_revision(&self) -> i64 {
        self.latest_revision
    }

    pub fn range_reference_required(&self) -> bool {
        self.range_reference_required
    }

    pub fn fragments(&self) -> impl Iterator<Item = &CommitLogFileInfo> + '_ {
        self.fragment_queue
            .iter()
            .filter_map(move |id| self.arena.get(*id))
    }

    pub(crate) fn sort_fragments(&mut self) {
        let arena = &self.arena;
        self.fragment_queue.sort_by_key(|id| {
            arena
                .get(*id)
                .map(|info| info.revision)
                .unwrap_or(TIMESTAMP_MIN)
        });
    }

    /// Takes over every fragment of `other`, leaving it empty.
    pub(crate) fn stitch_in(&mut self, other: &mut CommitLogBase) {
        let ids = std::mem::take(&mut other.fragment_queue);
        let moved = self.arena.absorb(&mut other.arena, &ids);
        self.fragment_queue.extend(moved);
        self.sort_fragments();
        self.latest_revision = self.latest_revision.max(other.latest_revision);
        self.linked_logs.extend(other.linked_logs.drain());
    }
}

pub(crate) fn trim_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() && dir.starts_with('/') {
        String::from("/")
    } else {
        trimmed.to_string()
    }
}
