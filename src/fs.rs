// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slog::{debug, o, Drain, Logger};

use crate::error::{Code, Error, Result};

pub type Fd = i32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    pub length: u64,
    pub is_dir: bool,
}

/// File operations the commit log needs from its backing store.
///
/// Names are `/`-separated paths interpreted by the implementation.  File
/// handles are small integers valid until `close`.
pub trait Filesystem: Send + Sync {
    fn open(&self, name: &str) -> Result<Fd>;
    /// Creates `name` for appending, truncating it if `overwrite` is set.
    fn create(&self, name: &str, overwrite: bool) -> Result<Fd>;
    /// Reads sequentially until `buf` is full or the file ends.
    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize>;
    /// Reads at `offset` without moving the sequential read position.
    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize>;
    /// Appends `data`, returning the offset it was written at.
    fn append(&self, fd: Fd, data: &[u8], flush: bool) -> Result<u64>;
    fn flush(&self, fd: Fd) -> Result<()>;
    fn close(&self, fd: Fd) -> Result<()>;
    fn mkdirs(&self, name: &str) -> Result<()>;
    fn exists(&self, name: &str) -> Result<bool>;
    fn remove(&self, name: &str) -> Result<()>;
    fn rmdir(&self, name: &str) -> Result<()>;
    fn length(&self, name: &str) -> Result<u64>;
    fn readdir(&self, name: &str) -> Result<Vec<Dirent>>;
}

pub type FilesystemPtr = Arc<dyn Filesystem>;

/// Copies `from` to `to` through `fs`, replacing `to`.  Returns the number of
/// bytes copied.
pub fn copy_file(fs: &dyn Filesystem, from: &str, to: &str) -> Result<u64> {
    let src = fs.open(from)?;
    let dst = match fs.create(to, true) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = fs.close(src);
            return Err(e);
        }
    };
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    let result = loop {
        match fs.read(src, &mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = fs.append(dst, &buf[..n], false) {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };
    let _ = fs.close(src);
    let flushed = fs.flush(dst);
    fs.close(dst)?;
    flushed?;
    result
}

/// A `Filesystem` rooted at a local directory.
pub struct LocalFilesystem {
    root: PathBuf,
    files: Mutex<HashMap<Fd, File>>,
    next_fd: AtomicI32,
    log: Logger,
}

impl LocalFilesystem {
    pub fn new<P: AsRef<Path>>(root: P, log: Option<&Logger>) -> Result<LocalFilesystem> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Ok(LocalFilesystem {
            root,
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(1),
            log: log.new(o!("component" => "local-fs")),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a filesystem name onto a path under the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(Error::new(
                        Code::FsBadFilename,
                        format!("invalid file name '{}'", name),
                    ))
                }
            }
        }
        Ok(self.root.join(relative))
    }

    fn register(&self, file: File) -> Fd {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.files.lock().insert(fd, file);
        fd
    }

    fn with_file<T, F>(&self, fd: Fd, f: F) -> Result<T>
    where
        F: FnOnce(&mut File) -> std::io::Result<T>,
    {
        let mut files = self.files.lock();
        let file = files.get_mut(&fd).ok_or_else(|| {
            Error::new(Code::FsBadFileHandle, format!("bad file handle {}", fd))
        })?;
        f(file).map_err(|e| Error::new(Code::FsIoError, e.to_string()))
    }

    fn not_found(name: &str, e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::new(Code::FsFileNotFound, format!("{}: {}", name, e))
            }
            _ => Error::new(Code::FsIoError, format!("{}: {}", name, e)),
        }
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Filesystem for LocalFilesystem {
    fn open(&self, name: &str) -> Result<Fd> {
        let path = self.resolve(name)?;
        let file = File::open(&path).map_err(|e| Self::not_found(name, e))?;
        let fd = self.register(file);
        debug!(self.log, "open"; "name" => name, "fd" => fd);
        Ok(fd)
    }

    fn create(&self, name: &str, overwrite: bool) -> Result<Fd> {
        let path = self.resolve(name)?;
        let mut options = OpenOptions::new();
        options.read(true).create(true);
        if overwrite {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&path).map_err(|e| Self::not_found(name, e))?;
        let fd = self.register(file);
        debug!(self.log, "create"; "name" => name, "fd" => fd);
        Ok(fd)
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.with_file(fd, |file| read_full(file, buf))
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_file(fd, |file| {
            let saved = file.stream_position()?;
            file.seek(SeekFrom::Start(offset))?;
            let n = read_full(file, buf);
            file.seek(SeekFrom::Start(saved))?;
            n
        })
    }

    fn append(&self, fd: Fd, data: &[u8], flush: bool) -> Result<u64> {
        self.with_file(fd, |file| {
            let offset = file.seek(SeekFrom::End(0))?;
            file.write_all(data)?;
            if flush {
                file.sync_data()?;
            }
            Ok(offset)
        })
    }

    fn flush(&self, fd: Fd) -> Result<()> {
        self.with_file(fd, |file| {
            file.flush()?;
            file.sync_data()
        })
    }

    fn close(&self, fd: Fd) -> Result<()> {
        match self.files.lock().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(Error::new(
                Code::FsBadFileHandle,
                format!("bad file handle {}", fd),
            )),
        }
    }

    fn mkdirs(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        fs::create_dir_all(&path).map_err(|e| Self::not_found(name, e))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.resolve(name)?.exists())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).map_err(|e| Self::not_found(name, e))
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::not_found(name, e)),
        }
    }

    fn length(&self, name: &str) -> Result<u64> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path).map_err(|e| Self::not_found(name, e))?;
        Ok(meta.len())
    }

    fn readdir(&self, name: &str) -> Result<Vec<Dirent>> {
        let path = self.resolve(name)?;
        let entries = fs::read_dir(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::new(Code::FsBadFilename, format!("{}: {}", name, e))
            } else {
                Error::new(Code::FsIoError, format!("{}: {}", name, e))
            }
        })?;
        let mut listing = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            listing.push(Dirent {
                name: entry.file_name().to_string_lossy().into_owned(),
                length: meta.len(),
                is_dir: meta.is_dir(),
            });
        }
        Ok(listing)
    }
}
