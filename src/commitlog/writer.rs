// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeSet, HashSet};

use bytes::BytesMut;
use parking_lot::Mutex;
use slog::{debug, error, info, o, warn, Drain, Logger};

use crate::commitlog::block_header::BlockHeaderCommitLog;
use crate::commitlog::block_stream::CommitLogBlockStream;
use crate::commitlog::codec::{create_block_codec, BlockCompressionCodec, NoneCodec};
use crate::commitlog::fragment::{CommitLogFileInfo, FragmentId};
use crate::commitlog::reader::CommitLogReader;
use crate::commitlog::{CommitLogBase, MAGIC_DATA, MAGIC_LINK, TIMESTAMP_MIN};
use crate::config::CommitLogConfig;
use crate::error::{Code, Error, Result};
use crate::fs::{Fd, FilesystemPtr};

struct WriterState {
    base: CommitLogBase,
    fd: Option<Fd>,
    closed: bool,
    cur_fragment_num: u32,
    cur_fragment_length: u64,
    /// Highest revision written to the current fragment.
    fragment_revision: i64,
    needs_roll: bool,
    compressor: Box<dyn BlockCompressionCodec>,
    /// Fragments past the purge point that are still referenced by linked
    /// fragments.
    reap_set: BTreeSet<FragmentId>,
}

impl WriterState {
    fn fname(&self, num: u32) -> String {
        format!("{}/{}", self.base.log_dir, num)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::new(
                Code::Closed,
                format!("commit log {} is closed", self.base.log_dir),
            ));
        }
        Ok(())
    }
}

/// Appends blocks to a commit log directory.
///
/// All operations serialize on an internal lock, so a `CommitLog` can be
/// shared between threads.
pub struct CommitLog {
    fs: FilesystemPtr,
    roll_limit: u64,
    state: Mutex<WriterState>,
    log: Logger,
}

impl CommitLog {
    /// Opens `log_dir` for writing, starting a fragment numbered one past
    /// the highest existing fragment.  Fragments already replayed by
    /// `init_log` are taken over so that they can be purged later.
    pub fn new(
        fs: FilesystemPtr,
        log_dir: &str,
        config: &CommitLogConfig,
        init_log: Option<&mut CommitLogReader>,
        log: Option<&Logger>,
    ) -> Result<CommitLog> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let compressor = create_block_codec(&config.compressor)?;

        let mut base = CommitLogBase::new(log_dir);
        base.range_reference_required = config.range_reference_required;
        let log = log.new(o!("commit-log" => base.log_dir.clone()));

        if let Some(init) = init_log {
            if !init.range_reference_required() {
                base.range_reference_required = false;
            }
            base.stitch_in(init.base_mut());
        }

        let mut last_num = base
            .fragments()
            .filter(|info| info.log_dir == base.log_dir)
            .map(|info| info.num)
            .max();
        match fs.readdir(&base.log_dir) {
            Ok(listing) => {
                for dirent in listing {
                    if let Ok(num) = dirent.name.parse::<u32>() {
                        last_num = last_num.max(Some(num));
                    }
                }
            }
            Err(e) if e.code() == Code::FsBadFilename || e.code() == Code::FsFileNotFound => {}
            Err(e) => return Err(e),
        }
        let next_num = match last_num {
            Some(num) => following_fragment(&base.log_dir, num)?,
            None => 0,
        };

        fs.mkdirs(&base.log_dir)?;
        let fname = format!("{}/{}", base.log_dir, next_num);
        let fd = fs.create(&fname, true)?;
        let cur_fragment_length = CommitLogBlockStream::write_header(&fs, fd)?;
        info!(log, "opened commit log"; "fragment" => %fname,
            "compressor" => %config.compressor);

        Ok(CommitLog {
            fs,
            roll_limit: config.roll_limit,
            state: Mutex::new(WriterState {
                base,
                fd: Some(fd),
                closed: false,
                cur_fragment_num: next_num,
                cur_fragment_length,
                fragment_revision: TIMESTAMP_MIN,
                needs_roll: false,
                compressor,
                reap_set: BTreeSet::new(),
            }),
            log,
        })
    }

    /// Compresses `buffer` into one block tagged with `revision` and
    /// `cluster_id` and appends it to the current fragment.
    pub fn write(&self, cluster_id: u64, buffer: &[u8], revision: i64, sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.needs_roll {
            self.roll_locked(&mut state)?;
        }

        let mut header = BlockHeaderCommitLog::with_magic(MAGIC_DATA, revision, cluster_id);
        let mut block = BytesMut::new();
        state.compressor.deflate(buffer, &mut block, &mut header, 0)?;

        let fd = state.fd.ok_or_else(|| Error::from(Code::Closed))?;
        if let Err(e) = self.fs.append(fd, &block, sync) {
            state.needs_roll = true;
            return Err(e);
        }
        state.cur_fragment_length += block.len() as u64;
        state.fragment_revision = state.fragment_revision.max(revision);
        state.base.latest_revision = state.base.latest_revision.max(revision);

        if state.cur_fragment_length > self.roll_limit {
            self.roll_locked(&mut state)?;
        }
        Ok(())
    }

    /// Links the log replayed by `other` into this one.
    ///
    /// A `COMMITLINK` block naming the other log's directory is written and
    /// the fragment rolled; the other log's fragments then become children
    /// of that fragment and are purged along with it.
    pub fn link_log(&self, cluster_id: u64, other: &mut CommitLogReader) -> Result<()> {
        let log_dir = other.get_log_dir().to_string();
        let mut state = self.state.lock();
        state.check_open()?;

        if log_dir == state.base.log_dir {
            return Err(Error::new(
                Code::ConfigBadValue,
                format!("cannot link commit log {} to itself", log_dir),
            ));
        }
        if state.base.linked_logs.contains(&log_dir) {
            warn!(self.log, "skipping already linked log"; "dir" => %log_dir);
            return Ok(());
        }

        // Fragment revisions are only known once their blocks are read.
        if !other.exhausted() {
            let mut header = BlockHeaderCommitLog::new(0);
            while other.next(&mut header).is_some() {}
        }
        let link_revision = other.get_latest_revision();
        if link_revision == TIMESTAMP_MIN {
            info!(self.log, "nothing to link, log is empty"; "dir" => %log_dir);
            return Ok(());
        }

        if state.needs_roll {
            self.roll_locked(&mut state)?;
        }

        let mut payload = log_dir.as_bytes().to_vec();
        payload.push(0);
        let mut header = BlockHeaderCommitLog::with_magic(MAGIC_LINK, link_revision, cluster_id);
        let mut block = BytesMut::new();
        NoneCodec.deflate(&payload, &mut block, &mut header, 0)?;

        let fd = state.fd.ok_or_else(|| Error::from(Code::Closed))?;
        if let Err(e) = self.fs.append(fd, &block, true) {
            state.needs_roll = true;
            return Err(e);
        }
        state.cur_fragment_length += block.len() as u64;
        state.fragment_revision = state.fragment_revision.max(link_revision);
        state.base.latest_revision = state.base.latest_revision.max(link_revision);

        let link_id = self
            .roll_locked(&mut state)?
            .ok_or_else(|| Error::from(Code::Closed))?;
        if let Some(info) = state.base.arena.get_mut(link_id) {
            info.purge_dirs.insert(log_dir.clone());
        }

        let other_base = other.base_mut();
        let ids = std::mem::take(&mut other_base.fragment_queue);
        let moved = state.base.arena.absorb(&mut other_base.arena, &ids);
        for id in moved {
            let orphan = state
                .base
                .arena
                .get(id)
                .map_or(false, |info| info.parent.is_none());
            if orphan {
                state.base.arena.set_parent(id, link_id);
            }
            state.base.fragment_queue.push(id);
        }
        let nested: Vec<String> = other_base.linked_logs.drain().collect();
        state.base.linked_logs.extend(nested);
        state.base.linked_logs.insert(log_dir.clone());
        state.base.sort_fragments();

        info!(self.log, "linked log"; "dir" => %log_dir, "revision" => link_revision);
        Ok(())
    }

    /// Closes the current fragment and starts the next one.
    pub fn roll(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        self.roll_locked(&mut state).map(|_| ())
    }

    /// Returns the id of the fragment that was closed, if one was open.
    fn roll_locked(&self, state: &mut WriterState) -> Result<Option<FragmentId>> {
        state.needs_roll = true;
        let next_num = following_fragment(&state.base.log_dir, state.cur_fragment_num)?;
        let mut closed = None;
        if let Some(fd) = state.fd.take() {
            if let Err(e) = self.fs.close(fd) {
                error!(self.log, "closing log fragment";
                    "num" => state.cur_fragment_num, "error" => %e);
            }
            let info = CommitLogFileInfo::new(
                &state.base.log_dir,
                state.cur_fragment_num,
                state.cur_fragment_length,
                state.fragment_revision,
            );
            debug!(self.log, "rolled log fragment"; "fragment" => %info);
            let id = state.base.arena.insert(info);
            state.base.fragment_queue.push(id);
            state.base.sort_fragments();
            state.fragment_revision = TIMESTAMP_MIN;
            state.cur_fragment_num = next_num;
            closed = Some(id);
        }

        let fname = state.fname(state.cur_fragment_num);
        let fd = self.fs.create(&fname, true)?;
        state.fd = Some(fd);
        state.cur_fragment_length = CommitLogBlockStream::write_header(&self.fs, fd)?;
        state.needs_roll = false;
        Ok(closed)
    }

    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        state.check_open()?;
        match state.fd {
            Some(fd) => self.fs.flush(fd),
            None => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        match state.fd.take() {
            Some(fd) => self.fs.close(fd),
            None => Ok(()),
        }
    }

    /// Removes fragments whose highest revision is below `revision`, oldest
    /// first.  Linked fragments are only removed when their log is in
    /// `remove_ok_logs`, unless range references are not required.
    /// Directories of fully purged linked logs are added to `removed_logs`.
    pub fn purge(
        &self,
        revision: i64,
        remove_ok_logs: &HashSet<String>,
        removed_logs: &mut HashSet<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let rrr = state.base.range_reference_required;

        let reap: Vec<FragmentId> = state.reap_set.iter().cloned().collect();
        for id in reap {
            let removable = match state.base.arena.get(id) {
                Some(info) => info.references == 0 && (info.remove_ok(remove_ok_logs) || !rrr),
                None => true,
            };
            if removable {
                state.reap_set.remove(&id);
                self.remove_file_info(&mut state, id, removed_logs);
            }
        }

        while let Some(id) = state.base.fragment_queue.first().cloned() {
            let (purgeable, references) = match state.base.arena.get(id) {
                Some(info) => (
                    info.revision < revision && (info.remove_ok(remove_ok_logs) || !rrr),
                    info.references,
                ),
                None => (true, 0),
            };
            if !purgeable {
                debug!(self.log, "purge stopped"; "cutoff" => revision);
                break;
            }
            state.base.fragment_queue.remove(0);
            if references == 0 {
                self.remove_file_info(&mut state, id, removed_logs);
            } else {
                state.reap_set.insert(id);
            }
        }
        Ok(())
    }

    fn remove_file_info(
        &self,
        state: &mut WriterState,
        id: FragmentId,
        removed_logs: &mut HashSet<String>,
    ) {
        let info = match state.base.arena.remove(id) {
            Some(info) => info,
            None => return,
        };
        for dir in &info.purge_dirs {
            if let Err(e) = self.fs.rmdir(dir) {
                error!(self.log, "removing linked log directory"; "dir" => %dir, "error" => %e);
            }
            state.base.linked_logs.remove(dir);
            removed_logs.insert(dir.clone());
        }
        let fname = info.fname();
        match self.fs.remove(&fname) {
            Ok(()) => info!(self.log, "removed log fragment"; "fragment" => %info),
            Err(e) if e.code() == Code::FsFileNotFound || e.code() == Code::FsBadFilename => {}
            Err(e) => error!(self.log, "removing log fragment"; "file" => %fname, "error" => %e),
        }
    }

    /// One line per fragment: `<prefix>-log-fragment[<file>]\t<stat>\t<value>`.
    pub fn get_stats(&self, prefix: &str) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for info in state.base.fragments() {
            let fname = info.fname();
            out.push_str(&format!("{}-log-fragment[{}]\tsize\t{}\n", prefix, fname, info.size));
            out.push_str(&format!(
                "{}-log-fragment[{}]\trevision\t{}\n",
                prefix, fname, info.revision
            ));
            out.push_str(&format!(
                "{}-log-fragment[{}]\tdir\t{}\n",
                prefix, fname, info.log_dir
            ));
        }
        let fname = state.fname(state.cur_fragment_num);
        out.push_str(&format!(
            "{}-log-fragment[{}]\tsize\t{}\n",
            prefix, fname, state.cur_fragment_length
        ));
        out.push_str(&format!(
            "{}-log-fragment[{}]\trevision\t{}\n",
            prefix, fname, state.fragment_revision
        ));
        out.push_str(&format!(
            "{}-log-fragment[{}]\tdir\t(current)\n",
            prefix, fname
        ));
        out
    }

    /// Highest revision ever written or linked into this log.
    pub fn get_latest_revision(&self) -> i64 {
        self.state.lock().base.latest_revision
    }

    pub fn get_log_dir(&self) -> String {
        self.state.lock().base.log_dir.clone()
    }

    pub fn get_current_fragment_file(&self) -> String {
        let state = self.state.lock();
        state.fname(state.cur_fragment_num)
    }

    /// Closed fragments still awaiting purge, ordered by revision.
    pub fn fragments(&self) -> Vec<CommitLogFileInfo> {
        self.state.lock().base.fragments().cloned().collect()
    }

    pub fn get_linked_logs(&self) -> BTreeSet<String> {
        self.state.lock().base.linked_logs.iter().cloned().collect()
    }

    pub fn range_reference_required(&self) -> bool {
        self.state.lock().base.range_reference_required
    }
}

impl Drop for CommitLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(self.log, "closing commit log"; "error" => %e);
        }
    }
}

fn following_fragment(log_dir: &str, num: u32) -> Result<u32> {
    num.checked_add(1).ok_or_else(|| {
        Error::new(
            Code::FsBadFilename,
            format!("{}/{}: no fragment number follows", log_dir, num),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::fs::{Filesystem, LocalFilesystem};

    fn setup() -> (tempfile::TempDir, FilesystemPtr, Logger) {
        let dir = tempfile::tempdir().unwrap();
        let fs: FilesystemPtr = Arc::new(LocalFilesystem::new(dir.path(), None).unwrap());
        (dir, fs, Logger::root(slog::Discard, o!()))
    }

    #[test]
    fn numbering_starts_past_existing_fragments() {
        let (_dir, fs, log) = setup();
        fs.mkdirs("/log/user").unwrap();
        let fd = fs.create("/log/user/6", true).unwrap();
        fs.close(fd).unwrap();
        let config = CommitLogConfig::default();
        let commit_log = CommitLog::new(fs.clone(), "/log/user/", &config, None, Some(&log)).unwrap();
        assert_eq!(commit_log.get_current_fragment_file(), "/log/user/7");
        assert_eq!(fs.length("/log/user/7").unwrap(), 8);
        assert_eq!(commit_log.get_latest_revision(), TIMESTAMP_MIN);
    }

    #[test]
    fn last_possible_fragment_number_is_rejected() {
        let (_dir, fs, log) = setup();
        fs.mkdirs("/log/user").unwrap();
        for name in &["0", "4294967295"] {
            let fd = fs.create(&format!("/log/user/{}", name), true).unwrap();
            fs.close(fd).unwrap();
        }
        let config = CommitLogConfig::default();
        let err = CommitLog::new(fs.clone(), "/log/user", &config, None, Some(&log))
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::FsBadFilename);
        assert_eq!(fs.length("/log/user/0").unwrap(), 0);
    }

    #[test]
    fn rolls_past_limit() {
        let (_dir, fs, log) = setup();
        let config = CommitLogConfig {
            roll_limit: 256,
            compressor: String::from("none"),
            ..CommitLogConfig::default()
        };
        let commit_log = CommitLog::new(fs.clone(), "/log/user", &config, None, Some(&log)).unwrap();
        for rev in 1..=6 {
            commit_log.write(0, &[rev as u8; 100], rev, false).unwrap();
        }
        let fragments = commit_log.fragments();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].num, 0);
        assert_eq!(fragments[0].revision, 2);
        assert_eq!(fragments[2].revision, 6);
        assert_eq!(commit_log.get_current_fragment_file(), "/log/user/3");
        assert_eq!(commit_log.get_latest_revision(), 6);

        let stats = commit_log.get_stats("user");
        assert!(stats.contains("user-log-fragment[/log/user/0]\trevision\t2\n"));
    }

    #[test]
    fn purge_removes_old_fragments() {
        let (_dir, fs, log) = setup();
        let config = CommitLogConfig {
            compressor: String::from("zlib"),
            ..CommitLogConfig::default()
        };
        let commit_log = CommitLog::new(fs.clone(), "/log/user", &config, None, Some(&log)).unwrap();
        for rev in &[10, 20, 30] {
            commit_log.write(1, b"some mutations", *rev, true).unwrap();
            commit_log.roll().unwrap();
        }
        let mut removed = HashSet::new();
        commit_log.purge(25, &HashSet::new(), &mut removed).unwrap();
        assert!(!fs.exists("/log/user/0").unwrap());
        assert!(!fs.exists("/log/user/1").unwrap());
        assert!(fs.exists("/log/user/2").unwrap());
        assert_eq!(commit_log.fragments().len(), 1);
        assert!(removed.is_empty());
    }

    #[test]
    fn closed_log_rejects_writes() {
        let (_dir, fs, log) = setup();
        let commit_log =
            CommitLog::new(fs, "/log/user", &CommitLogConfig::default(), None, Some(&log)).unwrap();
        commit_log.close().unwrap();
        let err = commit_log.write(0, b"x", 1, false).unwrap_err();
        assert_eq!(err.code(), Code::Closed);
        commit_log.close().unwrap();
    }

    #[test]
    fn unknown_compressor_is_rejected() {
        let (_dir, fs, log) = setup();
        let config = CommitLogConfig {
            compressor: String::from("lzma"),
            ..CommitLogConfig::default()
        };
        let err = CommitLog::new(fs, "/log/user", &config, None, Some(&log))
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::BlockCompressorUnsupportedType);
    }
}
