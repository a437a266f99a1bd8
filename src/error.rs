// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::io;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use thiserror::Error as ThisError;

/// Numeric error codes shared by the comm layer and the commit log.
///
/// Codes travel inside `Event`s and `CommitLogBlockInfo` records, so they
/// must stay stable and convertible to and from `u32`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive,
)]
pub enum Code {
    Ok = 0,
    ProtocolError = 1,
    RequestTimeout = 2,
    Closed = 3,
    ConfigBadValue = 4,
    IoError = 5,

    CommNotConnected = 0x0001_0001,
    CommBrokenConnection = 0x0001_0002,
    CommConnectError = 0x0001_0003,
    CommAlreadyConnected = 0x0001_0004,
    CommSendError = 0x0001_0006,
    CommReceiveError = 0x0001_0007,
    CommPollError = 0x0001_0008,
    CommSocketError = 0x0001_000A,
    CommBindError = 0x0001_000B,
    CommListenError = 0x0001_000C,
    CommBadHeader = 0x0001_000E,
    CommBackpressure = 0x0001_0012,
    CommConnectTimeout = 0x0001_0013,

    BlockCompressorUnsupportedType = 0x0002_0001,
    BlockCompressorInflateError = 0x0002_0002,
    BlockCompressorDeflateError = 0x0002_0003,
    BlockCompressorBadHeader = 0x0002_0005,
    BlockCompressorBadMagic = 0x0002_0006,
    BlockCompressorChecksumMismatch = 0x0002_0007,
    BlockCompressorTruncated = 0x0002_0008,

    FsIoError = 0x0003_0001,
    FsFileNotFound = 0x0003_0002,
    FsBadFilename = 0x0003_0003,
    FsBadFileHandle = 0x0003_0004,

    RangeserverTruncatedCommitLog = 0x0005_0007,

    SerializationInputOverrun = 0x0006_0001,
    SerializationBadVint = 0x0006_0002,
    SerializationBadString = 0x0006_0003,
}

impl Code {
    pub fn from_u32(value: u32) -> Option<Code> {
        FromPrimitive::from_u32(value)
    }

    pub fn as_u32(self) -> u32 {
        ToPrimitive::to_u32(&self).unwrap_or(0)
    }

    pub fn is_ok(self) -> bool {
        self == Code::Ok
    }

    pub fn text(self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::ProtocolError => "protocol error",
            Code::RequestTimeout => "request timeout",
            Code::Closed => "closed",
            Code::ConfigBadValue => "bad config value",
            Code::IoError => "I/O error",
            Code::CommNotConnected => "COMM not connected",
            Code::CommBrokenConnection => "COMM broken connection",
            Code::CommConnectError => "COMM connect error",
            Code::CommAlreadyConnected => "COMM already connected",
            Code::CommSendError => "COMM send error",
            Code::CommReceiveError => "COMM receive error",
            Code::CommPollError => "COMM poll error",
            Code::CommSocketError => "COMM socket error",
            Code::CommBindError => "COMM bind error",
            Code::CommListenError => "COMM listen error",
            Code::CommBadHeader => "COMM bad header",
            Code::CommBackpressure => "COMM send queue full",
            Code::CommConnectTimeout => "COMM connect timeout",
            Code::BlockCompressorUnsupportedType => {
                "BLOCK COMPRESSOR unsupported type"
            }
            Code::BlockCompressorInflateError => {
                "BLOCK COMPRESSOR inflate error"
            }
            Code::BlockCompressorDeflateError => {
                "BLOCK COMPRESSOR deflate error"
            }
            Code::BlockCompressorBadHeader => "BLOCK COMPRESSOR bad block header",
            Code::BlockCompressorBadMagic => "BLOCK COMPRESSOR bad magic string",
            Code::BlockCompressorChecksumMismatch => {
                "BLOCK COMPRESSOR block checksum mismatch"
            }
            Code::BlockCompressorTruncated => "BLOCK COMPRESSOR block truncated",
            Code::FsIoError => "FS I/O error",
            Code::FsFileNotFound => "FS file not found",
            Code::FsBadFilename => "FS bad filename",
            Code::FsBadFileHandle => "FS bad file handle",
            Code::RangeserverTruncatedCommitLog => {
                "RANGE SERVER truncated commit log"
            }
            Code::SerializationInputOverrun => "SERIALIZATION input overrun",
            Code::SerializationBadVint => "SERIALIZATION bad vint encoding",
            Code::SerializationBadString => "SERIALIZATION bad string encoding",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

#[derive(Debug, ThisError)]
#[error("{code}: {message}")]
pub struct Error {
    code: Code,
    message: String,
}

impl Error {
    pub fn new<S: Into<String>>(code: Code, message: S) -> Error {
        Error {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Error {
        Error::new(code, code.text())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        let code = match e.kind() {
            io::ErrorKind::NotFound => Code::FsFileNotFound,
            io::ErrorKind::InvalidInput => Code::FsBadFilename,
            _ => Code::IoError,
        };
        Error::new(code, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::new(Code::ConfigBadValue, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
