// Copyright 2020 Joyent, Inc.

use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, error, info, o, Drain, Logger};

use async_comm::{
    ApplicationQueue, Code, Comm, CommConfig, ConnectionHandlerFactoryPtr, DispatchHandlerPtr,
    Error, EventPtr, EventType, QueuedDispatchHandler, Result,
};

const COMMAND_ECHO: u16 = 1;
const COMMAND_DATE: u16 = 2;
const COMMAND_SLOW_ECHO: u16 = 3;

#[derive(Serialize, Deserialize)]
struct DatePayload {
    timestamp: i64,
    iso8601: DateTime<Utc>,
}

impl DatePayload {
    fn new() -> DatePayload {
        let now = Utc::now();
        DatePayload {
            timestamp: now.timestamp_millis(),
            iso8601: now,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SlowEchoPayload {
    echo: serde_json::Value,
    delay: Option<u64>,
}

fn date_handler(log: &Logger) -> Result<Bytes> {
    debug!(log, "handling date request");
    Ok(Bytes::from(serde_json::to_vec(&DatePayload::new())?))
}

fn slow_echo_handler(event: &EventPtr, log: &Logger) -> Result<Bytes> {
    debug!(log, "handling slow echo request");
    let payload: SlowEchoPayload = serde_json::from_slice(&event.payload)?;
    if let Some(delay) = payload.delay {
        thread::sleep(Duration::from_millis(delay));
    }
    Ok(Bytes::from(serde_json::to_vec(&payload.echo)?))
}

fn msg_handler(event: &EventPtr, log: &Logger) -> Result<Bytes> {
    match event.command() {
        Some(COMMAND_ECHO) => Ok(event.payload.clone()),
        Some(COMMAND_DATE) => date_handler(log),
        Some(COMMAND_SLOW_ECHO) => slow_echo_handler(event, log),
        other => Err(Error::new(
            Code::ProtocolError,
            format!("unsupported command: {:?}", other),
        )),
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2030".to_string());
    let addr = addr.parse::<SocketAddr>().expect("invalid listen address");

    let comm = Comm::new(CommConfig::default(), Some(&root_log)).expect("failed to start comm");
    let queue = Arc::new(ApplicationQueue::new(4, Some(&root_log)).expect("failed to start queue"));

    let factory: ConnectionHandlerFactoryPtr = {
        let comm = comm.clone();
        let queue = queue.clone();
        let log = root_log.clone();
        Arc::new(move || {
            let comm = comm.clone();
            let log = log.clone();
            let handler: DispatchHandlerPtr = Arc::new(move |event: EventPtr| {
                match event.event_type {
                    EventType::Message => {}
                    EventType::Disconnect => {
                        debug!(log, "peer disconnected"; "addr" => ?event.addr);
                        return;
                    }
                    _ => return,
                }
                let reply = match msg_handler(&event, &log) {
                    Ok(reply) => reply,
                    Err(e) => Bytes::from(format!("error: {}", e)),
                };
                if let Err(e) = comm.send_response(&event, reply) {
                    error!(log, "failed to send response"; "err" => %e);
                }
            });
            let queued: DispatchHandlerPtr = QueuedDispatchHandler::new(queue.clone(), handler);
            queued
        })
    };

    let bound = comm.listen(addr, factory).expect("failed to bind");
    info!(root_log, "listening for requests"; "address" => %bound);

    loop {
        thread::park();
    }
}
