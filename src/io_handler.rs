// Copyright 2020 Joyent, Inc.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, o, warn, Logger};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::comm::CommContext;
use crate::dispatch::{ConnectionHandlerFactoryPtr, DispatchHandlerPtr};
use crate::error::Code;
use crate::event::Event;
use crate::protocol::{error_code, CommBuf, CommCodec, Message};

/// Where a stream connection comes from.
pub(crate) enum StreamSource {
    /// Outbound connect, optionally from a fixed local address.
    Connect { local: Option<SocketAddr> },
    /// Accepted by a listener on some other reactor.
    Accepted(std::net::TcpStream),
}

pub(crate) struct DataHandler {
    pub ctx: Arc<CommContext>,
    pub addr: SocketAddr,
    pub conn_id: u64,
    pub source: StreamSource,
    pub handler: DispatchHandlerPtr,
    pub outbound: mpsc::Receiver<CommBuf>,
    pub token: CancellationToken,
}

pub(crate) struct AcceptHandler {
    pub ctx: Arc<CommContext>,
    pub addr: SocketAddr,
    pub listener: std::net::TcpListener,
    pub factory: ConnectionHandlerFactoryPtr,
    pub token: CancellationToken,
}

pub(crate) struct DatagramHandler {
    pub ctx: Arc<CommContext>,
    pub addr: SocketAddr,
    pub socket: std::net::UdpSocket,
    pub handler: DispatchHandlerPtr,
    pub token: CancellationToken,
}

/// The closed set of socket kinds a reactor drives.
pub(crate) enum IoHandler {
    Accept(AcceptHandler),
    Data(DataHandler),
    Datagram(DatagramHandler),
}

impl IoHandler {
    /// Runs the socket to completion on the current reactor.  Sockets arrive
    /// here as std sockets and are registered with this reactor's driver
    /// before the first poll.
    pub(crate) async fn run(self) {
        match self {
            IoHandler::Accept(h) => h.run().await,
            IoHandler::Data(h) => h.run().await,
            IoHandler::Datagram(h) => h.run().await,
        }
    }
}

async fn connect(addr: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    match local {
        None => TcpStream::connect(addr).await,
        Some(local) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
            socket.connect(addr).await
        }
    }
}

impl DataHandler {
    async fn run(self) {
        let DataHandler {
            ctx,
            addr,
            conn_id,
            source,
            handler,
            outbound,
            token,
        } = self;
        let log = ctx.log.new(o!("addr" => addr.to_string(), "conn" => conn_id));

        let stream = match source {
            StreamSource::Accepted(stream) => match TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(log, "registering accepted socket"; "error" => %e);
                    ctx.teardown(addr, conn_id, Code::CommSocketError, &handler);
                    return;
                }
            },
            StreamSource::Connect { local } => {
                let attempt = tokio::select! {
                    _ = token.cancelled() => {
                        ctx.teardown(addr, conn_id, Code::Closed, &handler);
                        return;
                    }
                    res = time::timeout(
                        ctx.config.connect_timeout(),
                        connect(addr, local),
                    ) => res,
                };
                match attempt {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!(log, "connect failed"; "error" => %e);
                        ctx.teardown(addr, conn_id, Code::CommConnectError, &handler);
                        return;
                    }
                    Err(_) => {
                        warn!(log, "connect timed out";
                            "timeout_ms" => ctx.config.connect_timeout_ms);
                        ctx.teardown(
                            addr,
                            conn_id,
                            Code::CommConnectTimeout,
                            &handler,
                        );
                        return;
                    }
                }
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(log, "setting TCP_NODELAY"; "error" => %e);
        }
        if ctx.handlers.set_connected(&addr, conn_id) {
            debug!(log, "connection established");
            handler.handle(Event::connection_established(addr).into_ptr());
        }

        let max = ctx.config.max_message_size;
        let (rd, wr) = stream.into_split();
        let mut reader = FramedRead::new(rd, CommCodec::new(max));
        let writer = FramedWrite::new(wr, CommCodec::new(max));
        tokio::spawn(write_loop(writer, outbound, token.clone(), log.clone()));

        let code = loop {
            tokio::select! {
                _ = token.cancelled() => break Code::CommBrokenConnection,
                frame = reader.next() => match frame {
                    Some(Ok(msg)) => ctx.deliver(addr, None, msg, &handler),
                    Some(Err(e)) => {
                        let code = error_code(&e);
                        warn!(log, "read failed"; "error" => %e);
                        break code;
                    }
                    None => {
                        debug!(log, "peer closed connection");
                        break Code::CommBrokenConnection;
                    }
                },
            }
        };
        token.cancel();
        ctx.teardown(addr, conn_id, code, &handler);
    }
}

/*
 * Drains the outbound queue into the socket.  The queue closing means the
 * connection was closed gracefully: everything queued has been written, so
 * the write half is shut down and the reader is told to stop.
 */
async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, CommCodec>,
    mut outbound: mpsc::Receiver<CommBuf>,
    token: CancellationToken,
    log: Logger,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = outbound.recv() => next,
        };
        match next {
            Some(buf) => {
                if let Err(e) = sink.send(buf).await {
                    warn!(log, "write failed"; "error" => %e);
                    break;
                }
            }
            None => {
                if let Err(e) = sink.close().await {
                    debug!(log, "shutting down write half"; "error" => %e);
                }
                debug!(log, "outbound queue drained");
                break;
            }
        }
    }
    token.cancel();
}

impl AcceptHandler {
    async fn run(self) {
        let AcceptHandler {
            ctx,
            addr,
            listener,
            factory,
            token,
        } = self;
        let log = ctx.log.new(o!("listen" => addr.to_string()));
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(log, "registering listen socket"; "error" => %e);
                ctx.handlers.remove_accept(&addr);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        debug!(log, "accepted connection"; "peer" => %peer);
                        if let Err(e) = ctx.adopt(stream, peer, factory.get_instance()) {
                            warn!(log, "dropping accepted connection";
                                "peer" => %peer, "error" => %e);
                        }
                    }
                    Err(e) => {
                        warn!(log, "accept failed"; "error" => %e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!(log, "listener closed");
    }
}

impl DatagramHandler {
    async fn run(self) {
        let DatagramHandler {
            ctx,
            addr,
            socket,
            handler,
            token,
        } = self;
        let log = ctx.log.new(o!("udp" => addr.to_string()));
        let socket = match UdpSocket::from_std(socket) {
            Ok(socket) => socket,
            Err(e) => {
                error!(log, "registering datagram socket"; "error" => %e);
                ctx.handlers.remove_datagram(&addr);
                return;
            }
        };

        let mut buf = vec![0u8; ctx.config.datagram_buffer_size];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, peer)) => match Message::parse_datagram(&buf[..n]) {
                        Ok(msg) => ctx.deliver(peer, Some(addr), msg, &handler),
                        Err(e) => {
                            warn!(log, "bad datagram"; "peer" => %peer, "error" => %e);
                            let event = Event::error(
                                Some(peer),
                                e.code(),
                                Some(e.message().to_string()),
                            );
                            handler.handle(event.into_ptr());
                        }
                    },
                    Err(e) => {
                        debug!(log, "receive failed"; "error" => %e);
                    }
                },
            }
        }
        debug!(log, "datagram socket closed");
    }
}
