// Copyright 2020 Joyent, Inc.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Code, Error, Result};
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

fn default_reactor_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    pub reactor_count: usize,
    pub connect_timeout_ms: u64,
    pub send_queue_limit: usize,
    pub max_message_size: usize,
    pub datagram_buffer_size: usize,
    pub poll_interval_ms: u64,
}

impl Default for CommConfig {
    fn default() -> CommConfig {
        CommConfig {
            reactor_count: default_reactor_count(),
            connect_timeout_ms: 20_000,
            send_queue_limit: 4096,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            datagram_buffer_size: 65536,
            poll_interval_ms: 1000,
        }
    }
}

impl CommConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reactor_count == 0 {
            return Err(Error::new(
                Code::ConfigBadValue,
                "reactor_count must be at least 1",
            ));
        }
        if self.send_queue_limit == 0 {
            return Err(Error::new(
                Code::ConfigBadValue,
                "send_queue_limit must be at least 1",
            ));
        }
        if self.max_message_size < crate::protocol::HEADER_LENGTH {
            return Err(Error::new(
                Code::ConfigBadValue,
                "max_message_size smaller than a message header",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitLogConfig {
    pub roll_limit: u64,
    pub compressor: String,
    pub archive_root: PathBuf,
    pub status_file: PathBuf,
    pub range_reference_required: bool,
}

impl Default for CommitLogConfig {
    fn default() -> CommitLogConfig {
        CommitLogConfig {
            roll_limit: 100_000_000,
            compressor: String::from("zlib"),
            archive_root: PathBuf::from("/tmp/commit-log-archive"),
            status_file: PathBuf::from("/tmp/commit-log-archive/STATUS"),
            range_reference_required: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub comm: CommConfig,
    pub commit_log: CommitLogConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let file = File::open(path.as_ref()).map_err(|e| {
            Error::new(
                Code::ConfigBadValue,
                format!("opening {}: {}", path.as_ref().display(), e),
            )
        })?;
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        config.comm.validate()?;
        Ok(config)
    }

    pub fn from_str(json: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json)?;
        config.comm.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_config_uses_defaults() {
        let config = Config::from_str(
            r#"{"comm": {"reactor_count": 3}, "commit_log": {"compressor": "none"}}"#,
        )
        .unwrap();
        assert_eq!(config.comm.reactor_count, 3);
        assert_eq!(config.comm.send_queue_limit, 4096);
        assert_eq!(config.commit_log.compressor, "none");
        assert!(config.commit_log.range_reference_required);
    }

    #[test]
    fn zero_reactors_is_rejected() {
        let err = Config::from_str(r#"{"comm": {"reactor_count": 0}}"#)
            .unwrap_err();
        assert_eq!(err.code(), Code::ConfigBadValue);
    }

    #[test]
    fn load_reads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"comm": {{"connect_timeout_ms": 250}}}}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.comm.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.commit_log, CommitLogConfig::default());
    }
}
