// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;
use slog::{debug, Logger};

use crate::dispatch::DispatchHandlerPtr;
use crate::error::Code;
use crate::event::Event;
use crate::timer::TimerId;

pub(crate) struct PendingRequest {
    pub handler: DispatchHandlerPtr,
    pub addr: SocketAddr,
    pub conn_id: u64,
    pub timer_id: TimerId,
}

/// Outstanding requests keyed by gid.
///
/// An entry leaves the table exactly once: through `remove` when the response
/// arrives, `expire` when its timer fires, `purge_connection` when the
/// connection goes away, or `purge_all` at shutdown.  Whoever removes it owns
/// the single delivery.
pub struct RequestCache {
    map: Mutex<HashMap<u32, PendingRequest>>,
    log: Logger,
}

impl RequestCache {
    pub fn new(log: Logger) -> RequestCache {
        RequestCache {
            map: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub(crate) fn insert(&self, gid: u32, request: PendingRequest) {
        self.map.lock().insert(gid, request);
    }

    pub(crate) fn remove(&self, gid: u32) -> Option<PendingRequest> {
        self.map.lock().remove(&gid)
    }

    pub(crate) fn expire(&self, gid: u32) {
        let request = match self.remove(gid) {
            Some(request) => request,
            None => return,
        };
        debug!(self.log, "request timed out"; "gid" => gid,
            "addr" => %request.addr);
        let event = Event::error(
            Some(request.addr),
            Code::RequestTimeout,
            Some(format!("request {} timed out", gid)),
        );
        request.handler.handle(event.into_ptr());
    }

    /// Fails every request sent over connection `conn_id` with `code`.
    /// Returns the timers that no longer need to fire.
    pub(crate) fn purge_connection(&self, conn_id: u64, code: Code) -> Vec<TimerId> {
        let purged: Vec<(u32, PendingRequest)> = {
            let mut map = self.map.lock();
            let gids: Vec<u32> = map
                .iter()
                .filter(|(_, req)| req.conn_id == conn_id)
                .map(|(gid, _)| *gid)
                .collect();
            gids.into_iter()
                .filter_map(|gid| map.remove(&gid).map(|req| (gid, req)))
                .collect()
        };
        self.fail(purged, code)
    }

    /// Fails every outstanding request with `code`.  Returns the timers
    /// that no longer need to fire.
    pub(crate) fn purge_all(&self, code: Code) -> Vec<TimerId> {
        let purged: Vec<(u32, PendingRequest)> = self.map.lock().drain().collect();
        self.fail(purged, code)
    }

    fn fail(&self, purged: Vec<(u32, PendingRequest)>, code: Code) -> Vec<TimerId> {
        let mut timers = Vec::with_capacity(purged.len());
        for (gid, request) in purged {
            debug!(self.log, "purging request"; "gid" => gid,
                "addr" => %request.addr, "error" => %code);
            timers.push(request.timer_id);
            let event = Event::error(
                Some(request.addr),
                code,
                Some(format!("request {} abandoned", gid)),
            );
            request.handler.handle(event.into_ptr());
        }
        timers
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}
