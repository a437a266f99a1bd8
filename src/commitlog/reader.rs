// Copyright 2020 Joyent, Inc.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use slog::{error, info, o, warn, Drain, Logger};

use crate::commitlog::block_header::{BlockHeaderCommitLog, BlockHeaderEncoding, CompressionType};
use crate::commitlog::block_stream::{
    CommitLogBlockInfo, CommitLogBlockStream, Quarantine, FRAGMENT_HEADER_SIZE,
};
use crate::commitlog::codec::{create_block_codec_for, BlockCompressionCodec};
use crate::commitlog::fragment::{CommitLogFileInfo, FragmentId};
use crate::commitlog::{trim_dir, CommitLogBase, MAGIC_LINK, TIMESTAMP_MIN};
use crate::error::{Code, Result};
use crate::fs::FilesystemPtr;

#[derive(Clone, Default)]
pub struct CommitLogReaderOptions {
    /// When non-empty, only these fragment numbers of the top-level log
    /// directory are read.
    pub fragment_filter: Vec<u32>,
    pub quarantine: Option<Quarantine>,
}

/// Replays the blocks of a commit log in stream order.
pub struct CommitLogReader {
    base: CommitLogBase,
    fs: FilesystemPtr,
    fragment_filter: HashSet<u32>,
    init_fragments: Vec<u32>,
    queue_offset: usize,
    /// Highest revision seen in the fragment being read.
    revision: i64,
    stream: Option<(FragmentId, CommitLogBlockStream)>,
    codecs: HashMap<CompressionType, Box<dyn BlockCompressionCodec>>,
    quarantine: Option<Quarantine>,
    last_fragment_fname: String,
    last_fragment_id: Option<u32>,
    damaged: Vec<(String, Code)>,
    log: Logger,
}

/// Leading decimal digits of `name`, or 0.
fn leading_number(name: &str) -> u64 {
    let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

impl CommitLogReader {
    pub fn new(
        fs: FilesystemPtr,
        log_dir: &str,
        log: Option<&Logger>,
    ) -> Result<CommitLogReader> {
        CommitLogReader::with_options(fs, log_dir, CommitLogReaderOptions::default(), log)
    }

    pub fn with_options(
        fs: FilesystemPtr,
        log_dir: &str,
        options: CommitLogReaderOptions,
        log: Option<&Logger>,
    ) -> Result<CommitLogReader> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let base = CommitLogBase::new(log_dir);
        let log = log.new(o!("commit-log" => base.log_dir.clone()));
        let mut reader = CommitLogReader {
            base,
            fs,
            fragment_filter: options.fragment_filter.into_iter().collect(),
            init_fragments: Vec::new(),
            queue_offset: 0,
            revision: TIMESTAMP_MIN,
            stream: None,
            codecs: HashMap::new(),
            quarantine: options.quarantine,
            last_fragment_fname: String::new(),
            last_fragment_id: None,
            damaged: Vec::new(),
            log,
        };
        let log_dir = reader.base.log_dir.clone();
        reader.load_fragments(&log_dir, None)?;
        Ok(reader)
    }

    fn load_fragments(&mut self, log_dir: &str, parent: Option<FragmentId>) -> Result<()> {
        let listing = match self.fs.readdir(log_dir) {
            Ok(listing) => listing,
            Err(e) if e.code() == Code::FsBadFilename || e.code() == Code::FsFileNotFound => {
                info!(self.log, "skipping missing log directory"; "dir" => log_dir);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut names: Vec<_> = listing.into_iter().filter(|d| !d.is_dir).collect();
        names.sort_by_key(|d| leading_number(&d.name));

        let toplevel = parent.is_none();
        let mut mark = None;
        let mut added = Vec::new();
        for dirent in names {
            if dirent.name.ends_with(".tmp") {
                continue;
            }
            if dirent.name.ends_with(".mark") {
                mark = Some(leading_number(&dirent.name));
                continue;
            }
            let num: u32 = match dirent.name.parse() {
                Ok(num) => num,
                Err(_) => {
                    warn!(self.log, "invalid file found in commit log directory";
                        "name" => %dirent.name, "dir" => log_dir);
                    continue;
                }
            };
            if toplevel && !self.fragment_filter.is_empty() && !self.fragment_filter.contains(&num)
            {
                info!(self.log, "dropping filtered log fragment"; "num" => num);
                continue;
            }
            if dirent.length <= FRAGMENT_HEADER_SIZE {
                continue;
            }
            let id = self
                .base
                .arena
                .insert(CommitLogFileInfo::new(log_dir, num, dirent.length, 0));
            if let Some(parent) = parent {
                self.base.arena.set_parent(id, parent);
            }
            added.push(id);
        }

        if let Some(mark) = mark {
            let first = added
                .first()
                .and_then(|id| self.base.arena.get(*id))
                .map(|info| u64::from(info.num));
            if first.map_or(true, |first| mark < first) {
                let mark_file = format!("{}/{}.mark", log_dir, mark);
                if let Err(e) = self.fs.remove(&mark_file) {
                    error!(self.log, "removing stale mark file";
                        "file" => %mark_file, "error" => %e);
                }
            } else {
                self.base.range_reference_required = false;
            }
        }

        self.base.fragment_queue.extend(added.iter().cloned());
        match parent {
            Some(parent) => {
                if let Some(info) = self.base.arena.get_mut(parent) {
                    info.purge_dirs.insert(log_dir.to_string());
                }
            }
            None => {
                self.init_fragments = self.base.fragments().map(|info| info.num).collect();
            }
        }
        Ok(())
    }

    fn note_revision(&mut self, revision: i64) {
        self.base.latest_revision = self.base.latest_revision.max(revision);
        self.revision = self.revision.max(revision);
    }

    /// Drops the fragment at the read position from the queue.
    fn skip_fragment(&mut self, id: FragmentId) {
        self.base.fragment_queue.remove(self.queue_offset);
        self.base.arena.remove(id);
    }

    fn next_raw_block(
        &mut self,
        info: &mut CommitLogBlockInfo,
        header: &mut BlockHeaderCommitLog,
    ) -> bool {
        loop {
            let id = match self.base.fragment_queue.get(self.queue_offset) {
                Some(id) => *id,
                None => return false,
            };

            if self.stream.as_ref().map_or(true, |(sid, _)| *sid != id) {
                let (log_dir, num) = match self.base.arena.get(id) {
                    Some(fragment) => (fragment.log_dir.clone(), fragment.num),
                    None => {
                        self.base.fragment_queue.remove(self.queue_offset);
                        continue;
                    }
                };
                match CommitLogBlockStream::open(
                    self.fs.clone(),
                    &log_dir,
                    &num.to_string(),
                    self.quarantine.clone(),
                    Some(&self.log),
                ) {
                    Ok(stream) => {
                        self.last_fragment_fname = stream.get_fname().to_string();
                        self.last_fragment_id = self.base.arena.toplevel_fragment_num(id);
                        self.stream = Some((id, stream));
                    }
                    Err(e) => {
                        warn!(self.log, "unable to open log fragment";
                            "dir" => %log_dir, "num" => num, "error" => %e);
                        self.damaged.push((format!("{}/{}", log_dir, num), e.code()));
                        self.skip_fragment(id);
                        continue;
                    }
                }
            }

            let advanced = match self.stream.as_mut() {
                Some((_, stream)) => stream.next(info, header),
                None => false,
            };
            if !advanced {
                self.stream = None;
                if let Some(code) = info.error {
                    warn!(self.log, "corruption detected in commit log fragment";
                        "fragment" => format!("{}/{}", info.log_dir, info.fragment),
                        "offset" => info.start_offset, "error" => %code);
                    self.damaged
                        .push((format!("{}/{}", info.log_dir, info.fragment), code));
                }
                if self.revision == TIMESTAMP_MIN {
                    info!(self.log, "skipping log fragment with no valid blocks";
                        "fragment" => format!("{}/{}", info.log_dir, info.fragment));
                    self.skip_fragment(id);
                } else {
                    if let Some(fragment) = self.base.arena.get_mut(id) {
                        fragment.revision = self.revision;
                    }
                    self.queue_offset += 1;
                }
                self.revision = TIMESTAMP_MIN;
                continue;
            }

            if header.check_magic(MAGIC_LINK) {
                let payload = &info.block[header.encoded_length()..];
                let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
                let linked = trim_dir(&String::from_utf8_lossy(&payload[..end]));
                info!(self.log, "following linked log"; "dir" => %linked);
                self.base.linked_logs.insert(linked.clone());
                if let Err(e) = self.load_fragments(&linked, Some(id)) {
                    error!(self.log, "loading linked log"; "dir" => %linked, "error" => %e);
                }
                self.note_revision(header.revision);
                continue;
            }

            return true;
        }
    }

    fn codec_for(&mut self, ctype: CompressionType) -> Result<&mut Box<dyn BlockCompressionCodec>> {
        match self.codecs.entry(ctype) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(create_block_codec_for(ctype)?)),
        }
    }

    /// Returns the next block's uncompressed contents, or `None` once every
    /// fragment has been read.  Blocks that fail to decompress are logged
    /// and skipped.
    pub fn next(&mut self, header: &mut BlockHeaderCommitLog) -> Option<Bytes> {
        let mut info = CommitLogBlockInfo::default();
        while self.next_raw_block(&mut info, header) {
            let block = info.block.clone();
            let ctype = header.base.compression_type;
            let mut output = BytesMut::with_capacity(header.base.data_length as usize);
            let inflated = self
                .codec_for(ctype)
                .and_then(|codec| codec.inflate(&block, &mut output, header));
            if let Err(e) = inflated {
                error!(self.log, "inflating commit log block";
                    "fragment" => format!("{}/{}", info.log_dir, info.fragment),
                    "offset" => info.start_offset, "error" => %e);
                continue;
            }
            self.note_revision(header.revision);
            return Some(output.freeze());
        }
        self.base.sort_fragments();
        None
    }

    /// True once `next` has consumed every fragment.
    pub fn exhausted(&self) -> bool {
        self.queue_offset >= self.base.fragment_queue.len()
    }

    pub fn base(&self) -> &CommitLogBase {
        &self.base
    }

    pub(crate) fn base_mut(&mut self) -> &mut CommitLogBase {
        &mut self.base
    }

    pub fn get_log_dir(&self) -> &str {
        self.base.get_log_dir()
    }

    pub fn get_latest_revision(&self) -> i64 {
        self.base.get_latest_revision()
    }

    pub fn range_reference_required(&self) -> bool {
        self.base.range_reference_required()
    }

    /// Fragment numbers found in the top-level directory at load time.
    pub fn get_init_fragment_ids(&self) -> &[u32] {
        &self.init_fragments
    }

    pub fn get_linked_logs(&self) -> BTreeSet<String> {
        self.base.linked_logs.iter().cloned().collect()
    }

    /// Top-level fragment number the last block came from.
    pub fn last_fragment_id(&self) -> Option<u32> {
        self.last_fragment_id
    }

    pub fn last_fragment_fname(&self) -> &str {
        &self.last_fragment_fname
    }

    /// Fragments that stopped early, with the reason.
    pub fn damaged_fragments(&self) -> &[(String, Code)] {
        &self.damaged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::fs::{Filesystem, LocalFilesystem};

    #[test]
    fn leading_numbers() {
        assert_eq!(leading_number("12"), 12);
        assert_eq!(leading_number("7.mark"), 7);
        assert_eq!(leading_number("junk"), 0);
    }

    #[test]
    fn listing_skips_unusable_names() {
        let dir = tempfile::tempdir().unwrap();
        let fs: FilesystemPtr = Arc::new(LocalFilesystem::new(dir.path(), None).unwrap());
        fs.mkdirs("/log/user").unwrap();
        for (name, len) in &[("0", 100), ("2", 100), ("10", 100), ("3", 8), ("5.tmp", 100), ("notes", 100)] {
            let fd = fs.create(&format!("/log/user/{}", name), true).unwrap();
            fs.append(fd, &vec![0u8; *len], false).unwrap();
            fs.close(fd).unwrap();
        }
        let log = Logger::root(slog::Discard, o!());
        let reader = CommitLogReader::new(fs.clone(), "/log/user/", Some(&log)).unwrap();
        assert_eq!(reader.get_init_fragment_ids(), &[0, 2, 10]);
        assert_eq!(reader.get_log_dir(), "/log/user");

        let options = CommitLogReaderOptions {
            fragment_filter: vec![2, 3],
            quarantine: None,
        };
        let filtered = CommitLogReader::with_options(fs, "/log/user", options, Some(&log)).unwrap();
        assert_eq!(filtered.get_init_fragment_ids(), &[2]);
    }

    #[test]
    fn mark_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs: FilesystemPtr = Arc::new(LocalFilesystem::new(dir.path(), None).unwrap());
        fs.mkdirs("/log/a").unwrap();
        for name in &["4", "5", "2.mark"] {
            let fd = fs.create(&format!("/log/a/{}", name), true).unwrap();
            fs.append(fd, &[1u8; 64], false).unwrap();
            fs.close(fd).unwrap();
        }
        let log = Logger::root(slog::Discard, o!());
        let reader = CommitLogReader::new(fs.clone(), "/log/a", Some(&log)).unwrap();
        assert!(reader.range_reference_required());
        assert!(!fs.exists("/log/a/2.mark").unwrap());

        let fd = fs.create("/log/a/5.mark", true).unwrap();
        fs.close(fd).unwrap();
        let reader = CommitLogReader::new(fs.clone(), "/log/a", Some(&log)).unwrap();
        assert!(!reader.range_reference_required());
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fs: FilesystemPtr = Arc::new(LocalFilesystem::new(dir.path(), None).unwrap());
        let log = Logger::root(slog::Discard, o!());
        let mut reader = CommitLogReader::new(fs, "/log/none", Some(&log)).unwrap();
        let mut header = BlockHeaderCommitLog::new(1);
        assert!(reader.next(&mut header).is_none());
        assert!(reader.exhausted());
        assert_eq!(reader.get_latest_revision(), TIMESTAMP_MIN);
    }
}
