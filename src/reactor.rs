// Copyright 2020 Joyent, Inc.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use slog::{debug, error, info, o, Logger};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::error::{Code, Error, Result};
use crate::io_handler::IoHandler;
use crate::timer::TimerHeap;

/// Work handed to a reactor from other threads.
pub(crate) enum ReactorOp {
    Register(IoHandler),
    /// Recompute the poll deadline (a timer was added).
    Wakeup,
    Shutdown,
}

/// One polling thread.
///
/// Sockets registered with a reactor are driven by that reactor's thread for
/// their whole lifetime.  Other threads never touch the reactor's sockets
/// directly; they push a `ReactorOp` onto its pending-operations queue, which
/// the loop drains between polls.
pub struct Reactor {
    id: usize,
    ops: mpsc::UnboundedSender<ReactorOp>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Reactor {
    fn start(
        id: usize,
        name: String,
        timers: Option<Arc<TimerHeap>>,
        poll_interval: Duration,
        log: Logger,
    ) -> Result<Reactor> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                Error::new(
                    Code::CommPollError,
                    format!("creating reactor runtime: {}", e),
                )
            })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let thread_log = log.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                runtime.block_on(poll_loop(rx, timers, poll_interval, thread_log));
            })
            .map_err(|e| {
                Error::new(
                    Code::CommPollError,
                    format!("spawning reactor thread: {}", e),
                )
            })?;
        debug!(log, "reactor started");
        Ok(Reactor {
            id,
            ops: tx,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn register(&self, handler: IoHandler) -> Result<()> {
        self.ops
            .send(ReactorOp::Register(handler))
            .map_err(|_| Error::new(Code::Closed, "reactor has shut down"))
    }

    pub fn wakeup(&self) {
        let _ = self.ops.send(ReactorOp::Wakeup);
    }

    /// Stops the poll loop.  Every socket the reactor owns is dropped with it.
    pub fn shutdown(&self) {
        let _ = self.ops.send(ReactorOp::Shutdown);
    }

    /// Waits for the reactor thread to exit.  A reactor cannot join itself,
    /// so the call is a no-op on the reactor's own thread.
    pub fn join(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

async fn poll_loop(
    mut ops: mpsc::UnboundedReceiver<ReactorOp>,
    timers: Option<Arc<TimerHeap>>,
    poll_interval: Duration,
    log: Logger,
) {
    loop {
        let idle = Instant::now() + poll_interval;
        let deadline = timers
            .as_ref()
            .and_then(|heap| heap.next_expiry())
            .map(|expire| Instant::from_std(expire).min(idle))
            .unwrap_or(idle);

        tokio::select! {
            op = ops.recv() => match op {
                Some(ReactorOp::Register(handler)) => {
                    tokio::spawn(handler.run());
                }
                Some(ReactorOp::Wakeup) => {}
                Some(ReactorOp::Shutdown) | None => break,
            },
            _ = time::sleep_until(deadline) => {}
        }

        if let Some(heap) = timers.as_ref() {
            for action in heap.pop_expired(std::time::Instant::now()) {
                action.fire();
            }
        }
    }
    debug!(log, "reactor exiting");
}

/// The fixed pool of reactors plus the one that owns the timer heap.
pub struct ReactorFactory {
    reactors: Vec<Arc<Reactor>>,
    timer_reactor: Arc<Reactor>,
    timers: Arc<TimerHeap>,
    next: AtomicUsize,
    log: Logger,
}

impl ReactorFactory {
    pub fn new(
        count: usize,
        poll_interval: Duration,
        log: &Logger,
    ) -> Result<ReactorFactory> {
        if count == 0 {
            error!(log, "reactor count must be at least 1");
            return Err(Error::new(
                Code::ConfigBadValue,
                "reactor count must be at least 1",
            ));
        }

        let mut reactors = Vec::with_capacity(count);
        for id in 0..count {
            let rlog = log.new(o!("reactor" => id));
            let reactor = Reactor::start(
                id,
                format!("reactor-{}", id),
                None,
                poll_interval,
                rlog,
            )?;
            reactors.push(Arc::new(reactor));
        }

        let timers = Arc::new(TimerHeap::new());
        let timer_reactor = Arc::new(Reactor::start(
            count,
            String::from("reactor-timer"),
            Some(Arc::clone(&timers)),
            poll_interval,
            log.new(o!("reactor" => "timer")),
        )?);

        info!(log, "reactor pool started"; "reactors" => count);
        Ok(ReactorFactory {
            reactors,
            timer_reactor,
            timers,
            next: AtomicUsize::new(0),
            log: log.clone(),
        })
    }

    /// Round-robin assignment.
    pub fn get_reactor(&self) -> Arc<Reactor> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.reactors[n % self.reactors.len()])
    }

    /// Assignment keyed by remote address, so all traffic for one endpoint
    /// lands on the same reactor.
    pub fn get_reactor_for(&self, addr: &SocketAddr) -> Arc<Reactor> {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        let n = hasher.finish() as usize;
        Arc::clone(&self.reactors[n % self.reactors.len()])
    }

    pub fn timer_reactor(&self) -> &Arc<Reactor> {
        &self.timer_reactor
    }

    pub fn timers(&self) -> &Arc<TimerHeap> {
        &self.timers
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    pub fn shutdown(&self) {
        debug!(self.log, "stopping reactors");
        self.timers.clear();
        for reactor in self.reactors.iter().chain(Some(&self.timer_reactor)) {
            reactor.shutdown();
        }
        for reactor in self.reactors.iter().chain(Some(&self.timer_reactor)) {
            reactor.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchHandlerPtr;
    use crate::event::EventPtr;
    use crate::timer::TimerAction;
    use std::sync::mpsc as std_mpsc;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn zero_reactors_is_a_config_error() {
        let err = ReactorFactory::new(0, Duration::from_millis(100), &test_logger())
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::ConfigBadValue);
    }

    #[test]
    fn assignment_is_round_robin_and_sticky() {
        let factory =
            ReactorFactory::new(3, Duration::from_millis(100), &test_logger())
                .unwrap();
        let ids: Vec<usize> = (0..6).map(|_| factory.get_reactor().id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        let addr: SocketAddr = "10.0.0.1:38040".parse().unwrap();
        let first = factory.get_reactor_for(&addr).id();
        for _ in 0..10 {
            assert_eq!(factory.get_reactor_for(&addr).id(), first);
        }
        factory.shutdown();
    }

    #[test]
    fn timer_reactor_fires_due_timers() {
        let factory =
            ReactorFactory::new(1, Duration::from_millis(500), &test_logger())
                .unwrap();
        let (tx, rx) = std_mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let handler: DispatchHandlerPtr = Arc::new(move |ev: EventPtr| {
            let _ = tx.lock().send(ev.event_type);
        });
        factory.timers().insert(
            std::time::Instant::now() + Duration::from_millis(20),
            None,
            TimerAction::Dispatch(handler),
        );
        factory.timer_reactor().wakeup();
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, crate::event::EventType::Timer);
        factory.shutdown();
    }
}
