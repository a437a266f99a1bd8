// Copyright 2020 Joyent, Inc.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::config::CommConfig;
use crate::dispatch::{ConnectionHandlerFactoryPtr, DispatchHandlerPtr};
use crate::error::{Code, Error, Result};
use crate::event::Event;
use crate::handler_map::{ConnectionState, HandlerMap};
use crate::io_handler::{
    AcceptHandler, DataHandler, DatagramHandler, IoHandler, StreamSource,
};
use crate::protocol::{
    CommBuf, Message, FLAGS_BIT_IGNORE_RESPONSE, FLAGS_BIT_REQUEST,
};
use crate::reactor::ReactorFactory;
use crate::request_cache::{PendingRequest, RequestCache};
use crate::timer::{TimerAction, TimerId};

/// Number of consecutive ports probed by `find_available_*_port`.
const PORT_PROBE_RANGE: u16 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Send everything already queued, then close.
    Graceful,
    /// Close now, discarding queued sends.
    Immediate,
}

/// State shared by the `Comm` handle and every socket handler it starts.
pub(crate) struct CommContext {
    pub config: CommConfig,
    pub log: Logger,
    pub reactors: ReactorFactory,
    pub handlers: HandlerMap,
    pub requests: Arc<RequestCache>,
    next_gid: AtomicU32,
    shut_down: AtomicBool,
}

impl CommContext {
    fn next_gid(&self) -> u32 {
        loop {
            let gid = self.next_gid.fetch_add(1, Ordering::Relaxed);
            if gid != 0 {
                return gid;
            }
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(Error::new(Code::Closed, "comm has been shut down"))
        } else {
            Ok(())
        }
    }

    /// Hands an inbound message to whoever is waiting for it.  Responses go
    /// to the pending request that claims their gid; a response nobody
    /// claims arrived after its request timed out and is dropped.
    pub(crate) fn deliver(
        &self,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        msg: Message,
        handler: &DispatchHandlerPtr,
    ) {
        let header = msg.header;
        if !header.is_request() && header.gid != 0 {
            if let Some(request) = self.requests.remove(header.gid) {
                self.reactors.timers().cancel(request.timer_id);
                let event = match local {
                    Some(local) => Event::datagram(addr, local, msg),
                    None => Event::message(addr, msg),
                };
                request.handler.handle(event.into_ptr());
                return;
            }
            if local.is_none() {
                debug!(self.log, "discarding response with no pending request";
                    "addr" => %addr, "gid" => header.gid);
                return;
            }
        }
        let event = match local {
            Some(local) => Event::datagram(addr, local, msg),
            None => Event::message(addr, msg),
        };
        handler.handle(event.into_ptr());
    }

    /// Final step for a stream connection.  Only the handler that still owns
    /// the map entry reports DISCONNECT; a connection closed through
    /// `close_socket` has already been removed and stays quiet.
    pub(crate) fn teardown(
        &self,
        addr: SocketAddr,
        conn_id: u64,
        code: Code,
        handler: &DispatchHandlerPtr,
    ) {
        let removed = self.handlers.remove_data_if(&addr, conn_id);
        if let Some(entry) = &removed {
            entry.token.cancel();
        }
        let purge_code = match code {
            Code::CommConnectError | Code::CommConnectTimeout => code,
            _ => Code::CommBrokenConnection,
        };
        for timer_id in self.requests.purge_connection(conn_id, purge_code) {
            self.reactors.timers().cancel(timer_id);
        }
        if removed.is_some() {
            debug!(self.log, "connection closed"; "addr" => %addr,
                "error" => %code);
            handler.handle(Event::disconnect(addr, code).into_ptr());
        }
    }

    /// Takes over a socket accepted by a listener, moving it to the reactor
    /// chosen for its peer.
    pub(crate) fn adopt(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        handler: DispatchHandlerPtr,
    ) -> Result<()> {
        self.check_running()?;
        let stream = stream.into_std()?;
        let (tx, rx) = mpsc::channel(self.config.send_queue_limit);
        let token = CancellationToken::new();
        let conn_id = self
            .handlers
            .insert_data(peer, tx, token.clone())
            .ok_or_else(|| {
                Error::new(
                    Code::CommAlreadyConnected,
                    format!("connection from {} already exists", peer),
                )
            })?;
        let data = DataHandler {
            ctx: Arc::clone(self),
            addr: peer,
            conn_id,
            source: StreamSource::Accepted(stream),
            handler,
            outbound: rx,
            token,
        };
        let reactor = self.reactors.get_reactor_for(&peer);
        if let Err(e) = reactor.register(IoHandler::Data(data)) {
            self.handlers.remove_data_if(&peer, conn_id);
            return Err(e);
        }
        Ok(())
    }

    fn queue(&self, addr: &SocketAddr, cbuf: CommBuf) -> Result<u64> {
        if cbuf.len() > self.config.max_message_size {
            return Err(Error::new(
                Code::CommSendError,
                format!(
                    "message length {} exceeds limit {}",
                    cbuf.len(),
                    self.config.max_message_size
                ),
            ));
        }
        let route = self.handlers.route(addr)?;
        match route.outbound.try_send(cbuf) {
            Ok(()) => Ok(route.conn_id),
            Err(TrySendError::Full(_)) => Err(Error::new(
                Code::CommBackpressure,
                format!(
                    "send queue to {} is full ({} messages)",
                    addr, self.config.send_queue_limit
                ),
            )),
            Err(TrySendError::Closed(_)) => Err(Error::new(
                Code::CommBrokenConnection,
                format!("connection to {} is closing", addr),
            )),
        }
    }
}

/// Handle to the asynchronous communication layer.
///
/// Cloning a `Comm` is cheap; clones share one reactor pool, connection map,
/// pending-request table and timer heap.  Call `shutdown` when done: handlers
/// registered with the `Comm` may hold clones of it, so dropping handles
/// alone does not stop the reactors.
#[derive(Clone)]
pub struct Comm {
    ctx: Arc<CommContext>,
}

impl Comm {
    pub fn new(config: CommConfig, log: Option<&Logger>) -> Result<Comm> {
        config.validate()?;
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("component" => "comm"));
        let reactors = ReactorFactory::new(
            config.reactor_count,
            config.poll_interval(),
            &log,
        )?;
        let requests = Arc::new(RequestCache::new(log.clone()));
        Ok(Comm {
            ctx: Arc::new(CommContext {
                config,
                log,
                reactors,
                handlers: HandlerMap::new(),
                requests,
                next_gid: AtomicU32::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.ctx.log
    }

    pub fn config(&self) -> &CommConfig {
        &self.ctx.config
    }

    /// Starts connecting to `addr`.  Completion is reported to `handler` as
    /// CONNECTION_ESTABLISHED, or DISCONNECT carrying the failure code.
    /// Connecting to an address that is already connecting or connected is a
    /// no-op.
    pub fn connect(&self, addr: SocketAddr, handler: DispatchHandlerPtr) -> Result<()> {
        self.start_connect(addr, None, handler)
    }

    /// Like `connect`, binding the local end to `local_addr` first.
    pub fn connect_local(
        &self,
        addr: SocketAddr,
        local_addr: SocketAddr,
        handler: DispatchHandlerPtr,
    ) -> Result<()> {
        self.start_connect(addr, Some(local_addr), handler)
    }

    fn start_connect(
        &self,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        handler: DispatchHandlerPtr,
    ) -> Result<()> {
        self.ctx.check_running()?;
        let (tx, rx) = mpsc::channel(self.ctx.config.send_queue_limit);
        let token = CancellationToken::new();
        let conn_id = match self.ctx.handlers.insert_data(addr, tx, token.clone()) {
            Some(conn_id) => conn_id,
            None => {
                debug!(self.ctx.log, "connect to existing connection ignored";
                    "addr" => %addr);
                return Ok(());
            }
        };
        debug!(self.ctx.log, "connecting"; "addr" => %addr);
        let data = DataHandler {
            ctx: Arc::clone(&self.ctx),
            addr,
            conn_id,
            source: StreamSource::Connect { local },
            handler,
            outbound: rx,
            token,
        };
        let reactor = self.ctx.reactors.get_reactor_for(&addr);
        if let Err(e) = reactor.register(IoHandler::Data(data)) {
            self.ctx.handlers.remove_data_if(&addr, conn_id);
            return Err(e);
        }
        Ok(())
    }

    pub fn connection_state(&self, addr: &SocketAddr) -> Option<ConnectionState> {
        self.ctx.handlers.state(addr)
    }

    /// Binds `addr` and accepts connections on it.  Each accepted connection
    /// gets its own handler from `factory` and receives
    /// CONNECTION_ESTABLISHED first.  Returns the bound address, so port 0
    /// can be used.
    pub fn listen(
        &self,
        addr: SocketAddr,
        factory: ConnectionHandlerFactoryPtr,
    ) -> Result<SocketAddr> {
        self.ctx.check_running()?;
        let listener = TcpListener::bind(addr).map_err(|e| {
            Error::new(Code::CommBindError, format!("binding {}: {}", addr, e))
        })?;
        listener.set_nonblocking(true).map_err(|e| {
            Error::new(Code::CommListenError, format!("listening on {}: {}", addr, e))
        })?;
        let bound = listener.local_addr()?;
        let token = CancellationToken::new();
        self.ctx.handlers.insert_accept(bound, token.clone())?;
        let accept = AcceptHandler {
            ctx: Arc::clone(&self.ctx),
            addr: bound,
            listener,
            factory,
            token,
        };
        if let Err(e) = self.ctx.reactors.get_reactor().register(IoHandler::Accept(accept)) {
            self.ctx.handlers.remove_accept(&bound);
            return Err(e);
        }
        info!(self.ctx.log, "listening"; "addr" => %bound);
        Ok(bound)
    }

    /// Queues a request on the connection to `addr` and returns its gid.
    ///
    /// With a handler, exactly one terminal event reaches it: the response,
    /// a REQUEST_TIMEOUT error after `timeout_ms`, or an error when the
    /// connection fails first.  Without one the request is marked
    /// IGNORE_RESPONSE and gets gid 0.
    pub fn send_request(
        &self,
        addr: SocketAddr,
        timeout_ms: u32,
        mut cbuf: CommBuf,
        handler: Option<DispatchHandlerPtr>,
    ) -> Result<u32> {
        self.ctx.check_running()?;
        if timeout_ms == 0 {
            return Err(Error::new(
                Code::RequestTimeout,
                "request timeout must be greater than zero",
            ));
        }
        cbuf.header.flags |= FLAGS_BIT_REQUEST;
        cbuf.header.timeout_ms = timeout_ms;

        let handler = match handler {
            Some(handler) => handler,
            None => {
                cbuf.header.flags |= FLAGS_BIT_IGNORE_RESPONSE;
                cbuf.header.gid = 0;
                self.ctx.queue(&addr, cbuf)?;
                return Ok(0);
            }
        };

        cbuf.header.flags &= !FLAGS_BIT_IGNORE_RESPONSE;
        let gid = self.ctx.next_gid();
        cbuf.header.gid = gid;

        /*
         * The pending entry must exist before the message can possibly be
         * answered, so it is registered against the current connection id
         * before the send is queued.
         */
        let route = self.ctx.handlers.route(&addr)?;
        let timers = self.ctx.reactors.timers();
        let timer_id = timers.allocate_id();
        self.ctx.requests.insert(
            gid,
            PendingRequest {
                handler,
                addr,
                conn_id: route.conn_id,
                timer_id,
            },
        );
        if let Err(e) = self.ctx.check_running() {
            // shutdown may have purged the table before the insert landed
            return match self.ctx.requests.remove(gid) {
                Some(_) => Err(e),
                None => Ok(gid),
            };
        }
        timers.schedule(
            timer_id,
            Instant::now() + Duration::from_millis(u64::from(timeout_ms)),
            None,
            TimerAction::RequestTimeout {
                gid,
                cache: Arc::clone(&self.ctx.requests),
            },
        );
        self.ctx.reactors.timer_reactor().wakeup();

        match self.ctx.queue(&addr, cbuf) {
            Ok(conn_id) if conn_id == route.conn_id => Ok(gid),
            Ok(_) => {
                /*
                 * The connection was replaced between the lookup and the
                 * send.  Re-key the pending entry to the new connection.
                 */
                if let (Some(mut request), Ok(current)) = (
                    self.ctx.requests.remove(gid),
                    self.ctx.handlers.route(&addr),
                ) {
                    request.conn_id = current.conn_id;
                    self.ctx.requests.insert(gid, request);
                }
                Ok(gid)
            }
            Err(e) => {
                timers.cancel(timer_id);
                match self.ctx.requests.remove(gid) {
                    Some(_) => Err(e),
                    // a teardown already failed the request through its handler
                    None => Ok(gid),
                }
            }
        }
    }

    /// Replies to the request carried by `event`, reusing its gid and
    /// command.  Requests marked IGNORE_RESPONSE are not answered.
    pub fn send_response(&self, event: &Event, payload: Bytes) -> Result<()> {
        let header = event.header.ok_or_else(|| {
            Error::new(Code::ProtocolError, "event carries no message header")
        })?;
        let addr = event.addr.ok_or_else(|| {
            Error::new(Code::ProtocolError, "event carries no peer address")
        })?;
        if header.ignore_response() {
            return Ok(());
        }
        let cbuf = CommBuf::response(&header, payload);
        match event.local_addr {
            Some(local) => self.send_datagram(addr, local, cbuf),
            None => self.send_response_buf(addr, cbuf),
        }
    }

    /// Sends an already-built response on the connection to `addr`.
    pub fn send_response_buf(&self, addr: SocketAddr, mut cbuf: CommBuf) -> Result<()> {
        self.ctx.check_running()?;
        cbuf.header.flags &= !FLAGS_BIT_REQUEST;
        self.ctx.queue(&addr, cbuf).map(|_| ())
    }

    /// Binds a UDP socket and delivers every datagram received on it to
    /// `handler`.  Returns the bound address.
    pub fn create_datagram_receive_socket(
        &self,
        addr: SocketAddr,
        handler: DispatchHandlerPtr,
    ) -> Result<SocketAddr> {
        self.ctx.check_running()?;
        let socket = UdpSocket::bind(addr).map_err(|e| {
            Error::new(Code::CommBindError, format!("binding {}: {}", addr, e))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            Error::new(Code::CommSocketError, format!("configuring {}: {}", addr, e))
        })?;
        let bound = socket.local_addr()?;
        let sender = socket.try_clone().map_err(|e| {
            Error::new(Code::CommSocketError, format!("cloning {}: {}", bound, e))
        })?;
        let token = CancellationToken::new();
        self.ctx
            .handlers
            .insert_datagram(bound, Arc::new(sender), token.clone())?;
        let datagram = DatagramHandler {
            ctx: Arc::clone(&self.ctx),
            addr: bound,
            socket,
            handler,
            token,
        };
        let reactor = self.ctx.reactors.get_reactor();
        if let Err(e) = reactor.register(IoHandler::Datagram(datagram)) {
            self.ctx.handlers.remove_datagram(&bound);
            return Err(e);
        }
        debug!(self.ctx.log, "datagram socket bound"; "addr" => %bound);
        Ok(bound)
    }

    /// Sends one datagram from the socket bound at `local_addr`.  Failures,
    /// including an oversized datagram, are returned here rather than
    /// reported as events.
    pub fn send_datagram(
        &self,
        dest: SocketAddr,
        local_addr: SocketAddr,
        cbuf: CommBuf,
    ) -> Result<()> {
        self.ctx.check_running()?;
        let socket = self.ctx.handlers.datagram_socket(&local_addr)?;
        let bytes = cbuf.to_bytes();
        match socket.send_to(&bytes, dest) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(Error::new(
                Code::CommSendError,
                format!("short datagram send to {} ({} of {} bytes)", dest, n, bytes.len()),
            )),
            Err(e) => Err(Error::new(
                Code::CommSendError,
                format!("sending datagram to {}: {}", dest, e),
            )),
        }
    }

    /// Delivers one TIMER event to `handler` after `duration_ms`.
    pub fn set_timer(&self, duration_ms: u64, handler: DispatchHandlerPtr) -> Result<TimerId> {
        self.set_timer_absolute(
            Instant::now() + Duration::from_millis(duration_ms),
            handler,
        )
    }

    pub fn set_timer_absolute(
        &self,
        expire: Instant,
        handler: DispatchHandlerPtr,
    ) -> Result<TimerId> {
        self.add_timer(expire, None, handler)
    }

    /// Delivers a TIMER event every `interval_ms` until cancelled.
    pub fn set_recurring_timer(
        &self,
        interval_ms: u64,
        handler: DispatchHandlerPtr,
    ) -> Result<TimerId> {
        if interval_ms == 0 {
            return Err(Error::new(
                Code::ConfigBadValue,
                "recurring timer interval must be greater than zero",
            ));
        }
        let interval = Duration::from_millis(interval_ms);
        self.add_timer(Instant::now() + interval, Some(interval), handler)
    }

    fn add_timer(
        &self,
        expire: Instant,
        interval: Option<Duration>,
        handler: DispatchHandlerPtr,
    ) -> Result<TimerId> {
        self.ctx.check_running()?;
        let id = self.ctx.reactors.timers().insert(
            expire,
            interval,
            TimerAction::Dispatch(handler),
        );
        self.ctx.reactors.timer_reactor().wakeup();
        Ok(id)
    }

    /// Cancels every pending timer of `handler`.  A timer already handed to
    /// its reactor for firing may still deliver once.
    pub fn cancel_timer(&self, handler: &DispatchHandlerPtr) -> usize {
        self.ctx.reactors.timers().cancel_handler(handler)
    }

    pub fn cancel_timer_id(&self, id: TimerId) -> bool {
        self.ctx.reactors.timers().cancel(id)
    }

    /// Closes whatever socket is registered at `addr`: a connection (by
    /// remote address), a listener or a datagram socket (by local address).
    pub fn close_socket(&self, addr: SocketAddr, mode: CloseMode) -> Result<()> {
        if let Some(entry) = self.ctx.handlers.remove_data(&addr) {
            debug!(self.ctx.log, "closing connection"; "addr" => %addr,
                "mode" => ?mode);
            for timer_id in self
                .ctx
                .requests
                .purge_connection(entry.conn_id, Code::CommBrokenConnection)
            {
                self.ctx.reactors.timers().cancel(timer_id);
            }
            match mode {
                CloseMode::Graceful => drop(entry.outbound),
                CloseMode::Immediate => entry.token.cancel(),
            }
            return Ok(());
        }
        if let Some(entry) = self.ctx.handlers.remove_accept(&addr) {
            entry.token.cancel();
            return Ok(());
        }
        if let Some(entry) = self.ctx.handlers.remove_datagram(&addr) {
            entry.token.cancel();
            return Ok(());
        }
        Err(Error::new(
            Code::CommNotConnected,
            format!("no socket registered for {}", addr),
        ))
    }

    /// Stops every socket and reactor.  Each pending request receives one
    /// CLOSED error; plain timers are dropped.  Safe to call more than once.
    pub fn shutdown(&self) {
        if self.ctx.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(self.ctx.log, "shutting down";
            "connections" => self.ctx.handlers.connection_count(),
            "requests" => self.ctx.requests.len());
        for timer_id in self.ctx.requests.purge_all(Code::Closed) {
            self.ctx.reactors.timers().cancel(timer_id);
        }
        for token in self.ctx.handlers.drain() {
            token.cancel();
        }
        self.ctx.reactors.shutdown();
    }

    /// Number of requests still waiting for their terminal event.
    pub fn pending_requests(&self) -> usize {
        self.ctx.requests.len()
    }

    /// Finds a free TCP port at or above `addr`'s port.
    pub fn find_available_tcp_port(addr: SocketAddr) -> Result<SocketAddr> {
        find_port(addr, |candidate| TcpListener::bind(candidate).is_ok())
    }

    /// Finds a free UDP port at or above `addr`'s port.
    pub fn find_available_udp_port(addr: SocketAddr) -> Result<SocketAddr> {
        find_port(addr, |candidate| UdpSocket::bind(candidate).is_ok())
    }
}

fn find_port<F>(addr: SocketAddr, available: F) -> Result<SocketAddr>
where
    F: Fn(SocketAddr) -> bool,
{
    let start = addr.port();
    for offset in 0..PORT_PROBE_RANGE {
        let port = match start.checked_add(offset) {
            Some(port) => port,
            None => break,
        };
        let mut candidate = addr;
        candidate.set_port(port);
        if available(candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::new(
        Code::CommBindError,
        format!(
            "no available port in range {}..{}",
            start,
            start.saturating_add(PORT_PROBE_RANGE)
        ),
    ))
}

impl Drop for CommContext {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            warn!(self.log, "comm dropped without shutdown");
            self.reactors.shutdown();
        }
    }
}
