// Copyright 2020 Joyent, Inc.

//! Persistent status records.
//!
//! Problems an operator needs to act on (a quarantined commit-log fragment,
//! for instance) are appended to a status file so that monitoring can pick
//! them up without scraping logs:
//!
//! ```text
//! WARNING - Corruption detected in commit log fragment /log/user/7
//! - Time 2020-04-01 12:00:00
//! - Fragment archived to /archive/log/user/7
//! ```
//!
//! The last `<CODE> - <text>` line of the file is the current status.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use slog::{info, o, warn, Drain, Logger};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl StatusCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Warning => "WARNING",
            StatusCode::Critical => "CRITICAL",
            StatusCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub text: String,
}

impl Status {
    pub fn new<S: Into<String>>(code: StatusCode, text: S) -> Status {
        Status {
            code,
            text: text.into(),
        }
    }

    pub fn ok() -> Status {
        Status::new(StatusCode::Ok, "")
    }

    fn parse(line: &str) -> Option<Status> {
        for code in &[
            StatusCode::Ok,
            StatusCode::Warning,
            StatusCode::Critical,
            StatusCode::Unknown,
        ] {
            let prefix = format!("{} - ", code.as_str());
            if let Some(text) = line.strip_prefix(prefix.as_str()) {
                return Some(Status::new(*code, text));
            }
        }
        None
    }
}

impl Default for Status {
    fn default() -> Status {
        Status::ok()
    }
}

pub struct StatusPersister {
    path: PathBuf,
    program: String,
    current: Mutex<Status>,
    log: Logger,
}

impl StatusPersister {
    /// Opens the status file at `path`, recovering the last recorded status
    /// if the file already exists.
    pub fn new<P: AsRef<Path>>(
        path: P,
        program: &str,
        log: Option<&Logger>,
    ) -> StatusPersister {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let path = path.as_ref().to_path_buf();
        let current = match fs::read_to_string(&path) {
            Ok(contents) => {
                let last = contents
                    .lines()
                    .filter(|line| !line.starts_with('#') && !line.starts_with('-'))
                    .filter(|line| !line.is_empty())
                    .last();
                match last {
                    Some(line) => Status::parse(line).unwrap_or_else(|| {
                        info!(log, "corrupt persistent status file";
                            "path" => %path.display());
                        Status::ok()
                    }),
                    None => Status::ok(),
                }
            }
            Err(_) => Status::ok(),
        };
        StatusPersister {
            path,
            program: program.to_string(),
            current: Mutex::new(current),
            log,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> String {
        format!(
            "# Persistent Status Log for {prog}\n\
             # The last entry in this file will be returned during the {prog}\n\
             # status check.  Once the issues described below have been dealt \
             with, this file\n\
             # can be removed to clear the {prog} persistent status and\n\
             # return to normal dynamic status checking.\n\
             #\n",
            prog = self.program
        )
    }

    /// Records `status` with a timestamp and any non-empty detail lines.
    pub fn set(&self, status: Status, additional_lines: &[String]) -> Result<()> {
        let mut current = self.current.lock();
        let mut text = String::new();
        if !self.path.exists() {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            text.push_str(&self.header());
        }
        text.push_str(&format!("{} - {}\n", status.code, status.text));
        text.push_str(&format!(
            "- Time {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        for line in additional_lines.iter().filter(|l| !l.is_empty()) {
            text.push_str(&format!("- {}\n", line));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if let Err(e) = file.write_all(text.as_bytes()) {
            warn!(self.log, "writing status file";
                "path" => %self.path.display(), "error" => %e);
            return Err(e.into());
        }
        *current = status;
        Ok(())
    }

    pub fn get(&self) -> Status {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_and_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("STATUS.test");
        let persister = StatusPersister::new(&path, "test", None);
        assert_eq!(persister.get(), Status::ok());

        persister
            .set(
                Status::new(StatusCode::Warning, "first problem"),
                &[String::from("detail one"), String::new()],
            )
            .unwrap();
        persister
            .set(Status::new(StatusCode::Critical, "second problem"), &[])
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# Persistent Status Log for test"));
        assert!(contents.contains("WARNING - first problem\n- Time "));
        assert!(contents.contains("- detail one\n"));
        assert_eq!(contents.matches("\n- \n").count(), 0);

        let reopened = StatusPersister::new(&path, "test", None);
        assert_eq!(
            reopened.get(),
            Status::new(StatusCode::Critical, "second problem")
        );
    }
}
