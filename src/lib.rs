// Copyright 2020 Joyent, Inc.

//! AsyncComm: an event-driven messaging layer, and the commit log built on
//! its block format.
//!
//! Connections are spread over a fixed pool of reactor threads.  Each
//! reactor runs its own single-threaded event loop and owns its sockets for
//! their whole lifetime.  Application code receives [`Event`]s through a
//! [`DispatchHandler`], either directly on the reactor thread or through an
//! [`ApplicationQueue`] worker pool.  The [`Comm`] handle is the entry point:
//! connect, listen, send requests and responses, send datagrams and set
//! timers.
//!
//! Message framing
//!
//! Every message starts with a little-endian header:
//!
//! * VERSION      1-byte integer.  The only supported value is "1".
//!
//! * HEADER_LEN   1-byte integer, the size of the header including any
//!              alignment padding.
//!
//! * ALIGNMENT    1-byte integer.  When non-zero the header is padded to a
//!              multiple of this value.
//!
//! * FLAGS        1-byte bit set: REQUEST (0x01), IGNORE_RESPONSE (0x02),
//!              URGENT (0x04).
//!
//! * GID          4-byte request id.  A response carries the id of the
//!              request it answers.
//!
//! * TOTAL_LEN    4-byte length of header plus payload.
//!
//! * TIMEOUT_MS   4-byte deadline hint supplied by the sender.
//!
//! * COMMAND      2-byte application command code.
//!
//! Request ids are drawn from a per-`Comm` counter that skips 0.  A request
//! with a response handler gets exactly one terminal event: the response, a
//! REQUEST_TIMEOUT error, or a connection error.  Responses arriving after
//! the timeout fired are dropped.
//!
//! Commit log
//!
//! The [`commitlog`] module stores blocks of serialized updates in numbered
//! fragment files through a pluggable [`Filesystem`].  Each block carries a
//! checksummed header; damaged fragments are archived and reported through
//! a [`StatusPersister`] before replay stops at the damage.

#![allow(missing_docs)]

pub mod app_queue;
pub mod block_cache;
pub mod comm;
pub mod commitlog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod fs;
pub mod protocol;
pub mod reactor;
pub mod serialization;
pub mod status;

mod handler_map;
mod io_handler;
mod request_cache;
mod timer;

pub use app_queue::{ApplicationHandler, ApplicationQueue, EventHandler, QueuedDispatchHandler};
pub use block_cache::{BlockCacheStats, FileBlockCache};
pub use comm::{CloseMode, Comm};
pub use config::{CommConfig, CommitLogConfig, Config};
pub use dispatch::{
    ConnectionHandlerFactory, ConnectionHandlerFactoryPtr, DispatchHandler, DispatchHandlerPtr,
    DispatchHandlerSynchronizer,
};
pub use error::{Code, Error, Result};
pub use event::{Event, EventPtr, EventType};
pub use fs::{Filesystem, FilesystemPtr, LocalFilesystem};
pub use handler_map::ConnectionState;
pub use protocol::{CommBuf, CommHeader};
pub use status::{Status, StatusCode, StatusPersister};
pub use timer::TimerId;
