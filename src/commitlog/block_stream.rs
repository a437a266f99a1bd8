// Copyright 2020 Joyent, Inc.

//! Sequential access to the blocks of one commit-log fragment.
//!
//! A fragment starts with an 8 byte ASCII header, `CL` followed by a four
//! digit version and `\f\n`, then holds `[BlockHeaderCommitLog][payload]`
//! pairs back to back.  Files without the header predate it and are read as
//! version 0 from offset 0.
//!
//! A block whose payload checksum does not match, or a fragment that ends in
//! the middle of a block, stops the stream.  The fragment is copied under the
//! archive root and a WARNING record is written to the status file before
//! `next` reports the error.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use slog::{error, info, o, warn, Drain, Logger};

use crate::commitlog::block_header::{BlockHeaderCommitLog, BlockHeaderEncoding};
use crate::commitlog::{MAGIC_DATA, MAGIC_LINK};
use crate::config::CommitLogConfig;
use crate::error::{Code, Error, Result};
use crate::fs::{copy_file, Fd, FilesystemPtr};
use crate::status::{Status, StatusCode, StatusPersister};

pub const FRAGMENT_HEADER_SIZE: u64 = 8;

pub const LATEST_FRAGMENT_VERSION: u32 = 1;

/// Block header version used by each fragment version.
const BLOCK_HEADER_VERSIONS: [u16; 2] = [0, 1];

/// Where damaged fragments are copied to and reported.
#[derive(Clone)]
pub struct Quarantine {
    archive_root: String,
    status: Option<Arc<StatusPersister>>,
}

impl Quarantine {
    pub fn new(archive_root: &str, status: Option<Arc<StatusPersister>>) -> Quarantine {
        Quarantine {
            archive_root: archive_root.trim_end_matches('/').to_string(),
            status,
        }
    }

    /// Archives under `config.archive_root` and records status in
    /// `config.status_file`.
    pub fn from_config(config: &CommitLogConfig, log: Option<&Logger>) -> Quarantine {
        let status = StatusPersister::new(&config.status_file, "commit-log", log);
        Quarantine::new(
            &config.archive_root.to_string_lossy(),
            Some(Arc::new(status)),
        )
    }

    pub fn archive_root(&self) -> &str {
        &self.archive_root
    }

    pub fn archive_path(&self, log_dir: &str, fragment: &str) -> String {
        let log_dir = log_dir.trim_end_matches('/');
        if log_dir.starts_with('/') {
            format!("{}{}/{}", self.archive_root, log_dir, fragment)
        } else {
            format!("{}/{}/{}", self.archive_root, log_dir, fragment)
        }
    }
}

/// Position and outcome of the most recent `next` call.
#[derive(Debug, Clone, Default)]
pub struct CommitLogBlockInfo {
    pub log_dir: String,
    pub fragment: String,
    pub start_offset: u64,
    pub end_offset: u64,
    /// The encoded header followed by the compressed payload.
    pub block: Bytes,
    pub error: Option<Code>,
}

impl CommitLogBlockInfo {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct CommitLogBlockStream {
    fs: FilesystemPtr,
    fd: Option<Fd>,
    log_dir: String,
    fragment: String,
    fname: String,
    version: u32,
    cur_offset: u64,
    file_length: u64,
    quarantine: Option<Quarantine>,
    archived: bool,
    log: Logger,
}

impl CommitLogBlockStream {
    pub fn open(
        fs: FilesystemPtr,
        log_dir: &str,
        fragment: &str,
        quarantine: Option<Quarantine>,
        log: Option<&Logger>,
    ) -> Result<CommitLogBlockStream> {
        let log_dir = log_dir.trim_end_matches('/').to_string();
        let fname = format!("{}/{}", log_dir, fragment);
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("fragment" => fname.clone()));

        let file_length = fs.length(&fname)?;
        let fd = fs.open(&fname)?;
        let mut stream = CommitLogBlockStream {
            fs,
            fd: Some(fd),
            log_dir,
            fragment: fragment.to_string(),
            fname,
            version: 0,
            cur_offset: 0,
            file_length,
            quarantine,
            archived: false,
            log,
        };
        if let Err(e) = stream.read_header() {
            stream.close();
            return Err(e);
        }
        Ok(stream)
    }

    fn read_header(&mut self) -> Result<()> {
        let fd = self.fd.ok_or_else(|| Error::from(Code::Closed))?;
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE as usize];
        let nread = if self.file_length >= FRAGMENT_HEADER_SIZE {
            self.fs.pread(fd, &mut buf, 0)?
        } else {
            0
        };
        match parse_fragment_header(&buf[..nread]) {
            Some(version) => {
                if version > LATEST_FRAGMENT_VERSION {
                    return Err(Error::new(
                        Code::BlockCompressorBadHeader,
                        format!(
                            "{} has unsupported fragment version {}",
                            self.fname, version
                        ),
                    ));
                }
                self.version = version;
                self.cur_offset = FRAGMENT_HEADER_SIZE;
            }
            None => {
                info!(self.log, "no fragment header, reading as legacy format");
                self.version = 0;
                self.cur_offset = 0;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            if let Err(e) = self.fs.close(fd) {
                warn!(self.log, "closing fragment"; "error" => %e);
            }
        }
    }

    pub fn get_fname(&self) -> &str {
        &self.fname
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn block_header_version(&self) -> u16 {
        BLOCK_HEADER_VERSIONS[self.version as usize]
    }

    pub fn offset(&self) -> u64 {
        self.cur_offset
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    /// Reads the next block into `info` and `header`.
    ///
    /// Returns false at the end of the stream.  `info.error` is `None` for a
    /// clean end and names the problem when the stream stopped early; once
    /// an error is reported every later call returns false.
    pub fn next(
        &mut self,
        info: &mut CommitLogBlockInfo,
        header: &mut BlockHeaderCommitLog,
    ) -> bool {
        info.log_dir = self.log_dir.clone();
        info.fragment = self.fragment.clone();
        info.start_offset = self.cur_offset;
        info.end_offset = self.cur_offset;
        info.block = Bytes::new();
        info.error = None;

        let fd = match self.fd {
            Some(fd) => fd,
            None => return false,
        };
        if self.cur_offset >= self.file_length {
            return false;
        }

        *header = BlockHeaderCommitLog::new(self.block_header_version());
        let header_len = header.encoded_length();
        if self.file_length - self.cur_offset < header_len as u64 {
            return self.truncated(info, "block header");
        }

        let mut block = BytesMut::with_capacity(header_len);
        block.resize(header_len, 0);
        match self.fs.pread(fd, &mut block[..], self.cur_offset) {
            Ok(n) if n == header_len => {}
            Ok(_) => return self.truncated(info, "block header"),
            Err(e) => return self.fail(info, e.code(), e.message()),
        }
        if let Err(e) = header.decode_from(&block) {
            let code = e.code();
            let msg = e.to_string();
            return self.fail(info, code, &msg);
        }
        if !header.check_magic(MAGIC_DATA) && !header.check_magic(MAGIC_LINK) {
            let msg = format!(
                "unknown block magic {:?}",
                String::from_utf8_lossy(&header.base.magic)
            );
            return self.fail(info, Code::BlockCompressorBadMagic, &msg);
        }
        let body_offset = self.cur_offset + header_len as u64;

        let zlength = header.base.data_zlength as usize;
        if self.file_length - body_offset < zlength as u64 {
            return self.truncated(info, "block payload");
        }
        block.resize(header_len + zlength, 0);
        match self.fs.pread(fd, &mut block[header_len..], body_offset) {
            Ok(n) if n == zlength => {}
            Ok(_) => return self.truncated(info, "block payload"),
            Err(e) => return self.fail(info, e.code(), e.message()),
        }

        let checksum = crc32c::crc32c(&block[header_len..]);
        if checksum != header.base.data_checksum {
            info.end_offset = body_offset + zlength as u64;
            let msg = format!(
                "block checksum mismatch: {:#x} (computed) != {:#x} (stored)",
                checksum, header.base.data_checksum
            );
            return self.fail(info, Code::BlockCompressorChecksumMismatch, &msg);
        }

        self.cur_offset = body_offset + zlength as u64;
        info.end_offset = self.cur_offset;
        info.block = block.freeze();
        true
    }

    fn truncated(&mut self, info: &mut CommitLogBlockInfo, what: &str) -> bool {
        info.end_offset = self.file_length;
        let msg = format!(
            "truncated {} at offset {} (file length {})",
            what, info.start_offset, self.file_length
        );
        self.fail(info, Code::RangeserverTruncatedCommitLog, &msg)
    }

    fn fail(&mut self, info: &mut CommitLogBlockInfo, code: Code, msg: &str) -> bool {
        error!(self.log, "commit log block stream stopped";
            "offset" => info.start_offset, "error" => %code, "detail" => msg);
        info.error = Some(code);
        self.cur_offset = self.file_length;
        self.quarantine(code, info);
        false
    }

    fn quarantine(&mut self, code: Code, info: &CommitLogBlockInfo) {
        if self.archived {
            return;
        }
        let quarantine = match &self.quarantine {
            Some(q) => q.clone(),
            None => return,
        };
        self.archived = true;

        let archive = quarantine.archive_path(&self.log_dir, &self.fragment);
        let mut details = vec![
            format!("Error: {}", code),
            format!("Offset: {}..{}", info.start_offset, info.end_offset),
        ];
        match self.archive_to(&archive) {
            Ok(bytes) => {
                warn!(self.log, "archived damaged fragment";
                    "archive" => %archive, "bytes" => bytes);
                details.push(format!("Fragment archived to {}", archive));
            }
            Err(e) => {
                error!(self.log, "archiving damaged fragment";
                    "archive" => %archive, "error" => %e);
                details.push(format!("Archive to {} failed: {}", archive, e));
            }
        }

        if let Some(status) = &quarantine.status {
            let text = format!("Corruption detected in commit log fragment {}", self.fname);
            if let Err(e) = status.set(Status::new(StatusCode::Warning, text), &details) {
                error!(self.log, "recording status"; "error" => %e);
            }
        }
    }

    fn archive_to(&self, archive: &str) -> Result<u64> {
        if let Some(pos) = archive.rfind('/') {
            if pos > 0 {
                self.fs.mkdirs(&archive[..pos])?;
            }
        }
        copy_file(self.fs.as_ref(), &self.fname, archive)
    }

    /// Writes the fragment header for a new fragment at `fd`.
    pub fn write_header(fs: &FilesystemPtr, fd: Fd) -> Result<u64> {
        let header = fragment_header(LATEST_FRAGMENT_VERSION);
        fs.append(fd, header.as_bytes(), true)?;
        Ok(FRAGMENT_HEADER_SIZE)
    }

    pub fn header_size() -> u64 {
        FRAGMENT_HEADER_SIZE
    }
}

impl Drop for CommitLogBlockStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn fragment_header(version: u32) -> String {
    format!("CL{:04}\x0c\n", version)
}

fn parse_fragment_header(buf: &[u8]) -> Option<u32> {
    if buf.len() != FRAGMENT_HEADER_SIZE as usize {
        return None;
    }
    if &buf[..2] != b"CL" || buf[6] != 0x0c || buf[7] != b'\n' {
        return None;
    }
    let digits = &buf[2..6];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::codec::{BlockCompressionCodec, NoneCodec};
    use crate::fs::{Filesystem, LocalFilesystem};

    fn write_blocks(fs: &FilesystemPtr, name: &str, revisions: &[i64]) -> Vec<u64> {
        let fd = fs.create(name, true).unwrap();
        CommitLogBlockStream::write_header(fs, fd).unwrap();
        let mut offsets = Vec::new();
        for rev in revisions {
            let mut header = BlockHeaderCommitLog::with_magic(MAGIC_DATA, *rev, 9);
            let mut block = BytesMut::new();
            let payload = format!("payload for revision {}", rev);
            NoneCodec
                .deflate(payload.as_bytes(), &mut block, &mut header, 0)
                .unwrap();
            offsets.push(fs.append(fd, &block, false).unwrap());
        }
        fs.close(fd).unwrap();
        offsets
    }

    #[test]
    fn fragment_header_format() {
        assert_eq!(fragment_header(1).as_bytes(), b"CL0001\x0c\n");
        assert_eq!(parse_fragment_header(b"CL0001\x0c\n"), Some(1));
        assert_eq!(parse_fragment_header(b"CL00x1\x0c\n"), None);
        assert_eq!(parse_fragment_header(b"CL0001"), None);
    }

    #[test]
    fn reads_blocks_then_clean_eof() {
        let dir = tempfile::tempdir().unwrap();
        let fs: FilesystemPtr = Arc::new(LocalFilesystem::new(dir.path(), None).unwrap());
        fs.mkdirs("/log/user").unwrap();
        let offsets = write_blocks(&fs, "/log/user/0", &[3, 1, 2]);
        assert_eq!(offsets[0], FRAGMENT_HEADER_SIZE);

        let log = Logger::root(slog::Discard, o!());
        let mut stream =
            CommitLogBlockStream::open(fs.clone(), "/log/user/", "0", None, Some(&log)).unwrap();
        assert_eq!(stream.version(), LATEST_FRAGMENT_VERSION);
        let mut info = CommitLogBlockInfo::default();
        let mut header = BlockHeaderCommitLog::new(1);
        let mut seen = Vec::new();
        while stream.next(&mut info, &mut header) {
            assert!(info.is_ok());
            assert_eq!(info.fragment, "0");
            seen.push((header.revision, info.start_offset));
        }
        assert!(info.is_ok());
        assert_eq!(
            seen,
            vec![(3, offsets[0]), (1, offsets[1]), (2, offsets[2])]
        );
        assert_eq!(stream.offset(), stream.file_length());
    }

    #[test]
    fn archive_paths() {
        let q = Quarantine::new("/archive/", None);
        assert_eq!(q.archive_path("/log/user", "7"), "/archive/log/user/7");
        assert_eq!(q.archive_path("log/user/", "7"), "/archive/log/user/7");
    }
}
