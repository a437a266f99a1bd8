// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use clap::{crate_version, value_t, App, Arg, ArgMatches};
use slog::{o, Drain, Level, LevelFilter, Logger};

use async_comm::{Comm, CommBuf, CommConfig, CommHeader, DispatchHandlerSynchronizer, EventType};

static APP: &str = "commcall";
static DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u32 = 2030;
const DEFAULT_TIMEOUT_MS: u32 = 10_000;

pub fn parse_opts<'a>(app: String) -> ArgMatches<'a> {
    App::new(app)
        .about("Command-line tool for sending one request to a comm server")
        .version(crate_version!())
        .arg(
            Arg::with_name("host")
                .help("IP address of the remote server")
                .long("host")
                .short("h")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .help("TCP port of the remote server (Default: 2030)")
                .long("port")
                .short("p")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("command")
                .help("Numeric command code of the request")
                .long("command")
                .short("c")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("payload")
                .help("Request payload, sent as UTF-8 text")
                .long("payload")
                .takes_value(true)
                .required(false),
        )
        .arg(
            Arg::with_name("timeout")
                .help("Request timeout in milliseconds (Default: 10000)")
                .long("timeout")
                .short("t")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .short("v")
                .takes_value(false),
        )
        .get_matches()
}

fn main() {
    let matches = parse_opts(APP.to_string());
    let host = String::from(matches.value_of("host").unwrap_or(DEFAULT_HOST));
    let port = value_t!(matches, "port", u32).unwrap_or(DEFAULT_PORT);
    let addr = [host, String::from(":"), port.to_string()]
        .concat()
        .parse::<SocketAddr>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to parse host and port as valid socket address: \
                 {}",
                e
            );
            process::exit(1)
        });
    let command = value_t!(matches, "command", u16).unwrap_or_else(|e| e.exit());
    let timeout_ms = value_t!(matches, "timeout", u32).unwrap_or(DEFAULT_TIMEOUT_MS);
    let payload = String::from(matches.value_of("payload").unwrap_or(""));

    let level = if matches.is_present("verbose") {
        Level::Debug
    } else {
        Level::Warning
    };
    let plain = slog_term::PlainSyncDecorator::new(std::io::stderr());
    let log = Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            level,
        ))
        .fuse(),
        o!(),
    );

    let comm = Comm::new(CommConfig::default(), Some(&log)).unwrap_or_else(|e| {
        eprintln!("Failed to start comm: {}", e);
        process::exit(1)
    });

    let wait = Duration::from_millis(u64::from(timeout_ms) + 1_000);
    let sync = DispatchHandlerSynchronizer::new();
    let connected = comm
        .connect(addr, sync.clone())
        .map(|_| sync.wait_for_connection(wait))
        .unwrap_or(false);
    if !connected {
        eprintln!("Failed to connect to server at {}", addr);
        process::exit(1)
    }

    let cbuf = CommBuf::new(CommHeader::new(command), Bytes::from(payload));
    if let Err(e) = comm.send_request(addr, timeout_ms, cbuf, Some(sync.clone())) {
        eprintln!("Error: {}", e);
        process::exit(1)
    }

    let code = match sync.wait_for_event(wait) {
        Some(event) if event.event_type == EventType::Message => {
            println!("{}", String::from_utf8_lossy(&event.payload));
            0
        }
        Some(event) => {
            eprintln!("Error: {} ({})", event.error, event.event_type);
            1
        }
        None => {
            eprintln!("Error: no response from {}", addr);
            1
        }
    };
    comm.shutdown();
    process::exit(code)
}
