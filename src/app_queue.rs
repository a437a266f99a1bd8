// Copyright 2020 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slog::{debug, error, o, Drain, Logger};

use crate::dispatch::{DispatchHandler, DispatchHandlerPtr};
use crate::error::{Code, Error, Result};
use crate::event::EventPtr;

/// A unit of work for an `ApplicationQueue`.
pub trait ApplicationHandler: Send {
    fn run(self: Box<Self>);

    /// Handlers sharing a non-zero group id run one at a time, in the order
    /// they were added.
    fn group_id(&self) -> u64 {
        0
    }

    /// Urgent handlers are served before everything else, even while the
    /// queue is stopped.
    fn is_urgent(&self) -> bool {
        false
    }

    /// Expired handlers are dropped without running.
    fn is_expired(&self) -> bool {
        false
    }
}

struct Record {
    handler: Box<dyn ApplicationHandler>,
    group_id: u64,
}

struct GroupState {
    running: bool,
    outstanding: usize,
}

struct State {
    queue: VecDeque<Record>,
    urgent: VecDeque<Record>,
    groups: HashMap<u64, GroupState>,
    threads_available: usize,
    paused: bool,
    shutdown: bool,
}

impl State {
    fn release(&mut self, group_id: u64) {
        if group_id == 0 {
            return;
        }
        let done = match self.groups.get_mut(&group_id) {
            Some(group) => {
                group.running = false;
                group.outstanding -= 1;
                group.outstanding == 0
            }
            None => false,
        };
        if done {
            self.groups.remove(&group_id);
        }
    }

    /// Accounts for a handler dropped unrun.  Another member of its group
    /// may still be running, so `running` is left alone.
    fn discard_expired(&mut self, group_id: u64) {
        if group_id == 0 {
            return;
        }
        let done = match self.groups.get_mut(&group_id) {
            Some(group) => {
                group.outstanding -= 1;
                group.outstanding == 0
            }
            None => false,
        };
        if done {
            self.groups.remove(&group_id);
        }
    }

    fn take_from(&mut self, urgent: bool) -> Option<Record> {
        let mut i = 0;
        loop {
            let queue = if urgent { &mut self.urgent } else { &mut self.queue };
            let rec = queue.get(i)?;
            if rec.handler.is_expired() {
                let rec = queue.remove(i)?;
                self.discard_expired(rec.group_id);
                continue;
            }
            let group_id = rec.group_id;
            let blocked = group_id != 0
                && self.groups.get(&group_id).map(|g| g.running).unwrap_or(false);
            if blocked {
                i += 1;
                continue;
            }
            let queue = if urgent { &mut self.urgent } else { &mut self.queue };
            let rec = queue.remove(i)?;
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.running = true;
            }
            return Some(rec);
        }
    }

    fn take_next(&mut self) -> Option<Record> {
        if let Some(rec) = self.take_from(true) {
            return Some(rec);
        }
        if self.paused {
            return None;
        }
        self.take_from(false)
    }

    fn has_runnable_work(&self) -> bool {
        !self.urgent.is_empty() || (!self.paused && !self.queue.is_empty())
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    quiesce: Condvar,
    threads_total: usize,
    log: Logger,
}

/// Worker pool that runs `ApplicationHandler`s off the reactor threads.
pub struct ApplicationQueue {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    dynamic_threads: bool,
}

impl ApplicationQueue {
    pub fn new(worker_count: usize, log: Option<&Logger>) -> Result<ApplicationQueue> {
        ApplicationQueue::with_dynamic_threads(worker_count, true, log)
    }

    /// With `dynamic_threads`, an urgent handler added while every worker is
    /// busy gets a one-shot thread of its own.
    pub fn with_dynamic_threads(
        worker_count: usize,
        dynamic_threads: bool,
        log: Option<&Logger>,
    ) -> Result<ApplicationQueue> {
        if worker_count == 0 {
            return Err(Error::new(
                Code::ConfigBadValue,
                "application queue needs at least one worker",
            ));
        }
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                urgent: VecDeque::new(),
                groups: HashMap::new(),
                threads_available: 0,
                paused: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
            quiesce: Condvar::new(),
            threads_total: worker_count,
            log: log.new(o!("component" => "app-queue")),
        });

        let mut threads = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("app-queue-{}", i))
                .spawn(move || worker(worker_shared, false))?;
            threads.push(handle);
        }
        Ok(ApplicationQueue {
            shared,
            threads: Mutex::new(threads),
            dynamic_threads,
        })
    }

    pub fn add(&self, handler: Box<dyn ApplicationHandler>) {
        let group_id = handler.group_id();
        let urgent = handler.is_urgent();
        let mut state = self.shared.state.lock();
        if group_id != 0 {
            state
                .groups
                .entry(group_id)
                .and_modify(|g| g.outstanding += 1)
                .or_insert(GroupState {
                    running: false,
                    outstanding: 1,
                });
        }
        let rec = Record { handler, group_id };
        if urgent {
            state.urgent.push_back(rec);
            if self.dynamic_threads && state.threads_available == 0 {
                let shared = Arc::clone(&self.shared);
                if let Err(e) = thread::Builder::new()
                    .name(String::from("app-queue-urgent"))
                    .spawn(move || worker(shared, true))
                {
                    error!(self.shared.log, "spawning urgent worker";
                        "error" => %e);
                }
            }
        } else {
            state.queue.push_back(rec);
        }
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Resumes normal (non-urgent) processing.
    pub fn start(&self) {
        self.shared.state.lock().paused = false;
        self.shared.cond.notify_all();
    }

    /// Pauses normal processing.  Urgent handlers keep running.
    pub fn stop(&self) {
        self.shared.state.lock().paused = true;
    }

    /// Waits until no handler is running and nothing runnable is queued.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.threads_available < self.shared.threads_total
            || state.has_runnable_work()
        {
            if self
                .shared
                .quiesce
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return false;
            }
        }
        true
    }

    pub fn backlog(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + state.urgent.len()
    }

    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
    }

    pub fn join(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for ApplicationQueue {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn worker(shared: Arc<Shared>, one_shot: bool) {
    loop {
        let rec = {
            let mut state = shared.state.lock();
            if !one_shot {
                state.threads_available += 1;
            }
            let rec = loop {
                if state.shutdown {
                    break None;
                }
                if let Some(rec) = state.take_next() {
                    break Some(rec);
                }
                if one_shot {
                    break None;
                }
                if state.threads_available == shared.threads_total {
                    shared.quiesce.notify_all();
                }
                shared.cond.wait(&mut state);
            };
            if !one_shot {
                state.threads_available -= 1;
            }
            rec
        };

        let rec = match rec {
            Some(rec) => rec,
            None => {
                debug!(shared.log, "worker exiting");
                return;
            }
        };

        let group_id = rec.group_id;
        let handler = rec.handler;
        if panic::catch_unwind(AssertUnwindSafe(move || handler.run())).is_err() {
            error!(shared.log, "application handler panicked";
                "group" => group_id);
        }

        if group_id != 0 {
            shared.state.lock().release(group_id);
            shared.cond.notify_all();
        }
        if one_shot {
            return;
        }
    }
}

/// Runs one event through a dispatch handler on a queue worker.
pub struct EventHandler {
    event: EventPtr,
    handler: DispatchHandlerPtr,
}

impl EventHandler {
    pub fn new(event: EventPtr, handler: DispatchHandlerPtr) -> EventHandler {
        EventHandler { event, handler }
    }
}

impl ApplicationHandler for EventHandler {
    fn run(self: Box<Self>) {
        self.handler.handle(self.event)
    }

    fn is_urgent(&self) -> bool {
        self.event.header.map(|h| h.is_urgent()).unwrap_or(false)
    }

    fn is_expired(&self) -> bool {
        self.event.is_expired()
    }
}

/// A dispatch handler that moves every event onto an `ApplicationQueue`, so
/// `handler` runs on a worker thread instead of the reactor.
pub struct QueuedDispatchHandler {
    queue: Arc<ApplicationQueue>,
    handler: DispatchHandlerPtr,
}

impl QueuedDispatchHandler {
    pub fn new(queue: Arc<ApplicationQueue>, handler: DispatchHandlerPtr) -> Arc<QueuedDispatchHandler> {
        Arc::new(QueuedDispatchHandler { queue, handler })
    }
}

impl DispatchHandler for QueuedDispatchHandler {
    fn handle(&self, event: EventPtr) {
        self.queue
            .add(Box::new(EventHandler::new(event, Arc::clone(&self.handler))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Job<F: FnOnce() + Send> {
        work: Option<F>,
        group: u64,
        urgent: bool,
        expired: bool,
    }

    impl<F: FnOnce() + Send> ApplicationHandler for Job<F> {
        fn run(mut self: Box<Self>) {
            if let Some(work) = self.work.take() {
                work()
            }
        }

        fn group_id(&self) -> u64 {
            self.group
        }

        fn is_urgent(&self) -> bool {
            self.urgent
        }

        fn is_expired(&self) -> bool {
            self.expired
        }
    }

    fn job<F: FnOnce() + Send + 'static>(group: u64, urgent: bool, work: F) -> Box<dyn ApplicationHandler> {
        Box::new(Job {
            work: Some(work),
            group,
            urgent,
            expired: false,
        })
    }

    fn expired_job<F: FnOnce() + Send + 'static>(group: u64, work: F) -> Box<dyn ApplicationHandler> {
        Box::new(Job {
            work: Some(work),
            group,
            urgent: false,
            expired: true,
        })
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = ApplicationQueue::new(0, None).err().unwrap();
        assert_eq!(err.code(), Code::ConfigBadValue);
    }

    #[test]
    fn group_members_run_in_order_one_at_a_time() {
        let queue = ApplicationQueue::new(4, None).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        for i in 0..20 {
            let order = Arc::clone(&order);
            let active = Arc::clone(&active);
            queue.add(job(7, false, move || {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                thread::sleep(Duration::from_millis(1));
                order.lock().push(i);
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        assert!(queue.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn expired_member_does_not_unblock_its_group() {
        let queue = ApplicationQueue::new(2, None).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let member = |name: &'static str, sleep: u64| {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            let order = Arc::clone(&order);
            move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(sleep));
                order.lock().push(name);
                active.fetch_sub(1, Ordering::SeqCst);
            }
        };

        queue.add(job(7, false, member("a", 300)));
        thread::sleep(Duration::from_millis(50));
        queue.add(expired_job(7, member("b", 0)));
        queue.add(job(7, false, member("c", 0)));

        assert!(queue.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock(), vec!["a", "c"]);
        assert!(queue.shared.state.lock().groups.is_empty());
    }

    #[test]
    fn panics_do_not_kill_workers() {
        let queue = ApplicationQueue::new(1, None).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        queue.add(job(0, false, || panic!("handler failure")));
        let ran2 = Arc::clone(&ran);
        queue.add(job(0, false, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(queue.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_queue_still_runs_urgent_work() {
        let queue = ApplicationQueue::with_dynamic_threads(1, false, None).unwrap();
        queue.stop();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let normal = Arc::clone(&ran);
        queue.add(job(0, false, move || normal.lock().push("normal")));
        let urgent = Arc::clone(&ran);
        queue.add(job(0, true, move || urgent.lock().push("urgent")));
        assert!(queue.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(*ran.lock(), vec!["urgent"]);
        assert_eq!(queue.backlog(), 1);
        queue.start();
        assert!(queue.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(*ran.lock(), vec!["urgent", "normal"]);
    }

    #[test]
    fn queued_dispatch_handler_moves_events_to_workers() {
        let queue = Arc::new(ApplicationQueue::new(2, None).unwrap());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let reactor_thread = thread::current().id();
        let inner: DispatchHandlerPtr = Arc::new(move |_: EventPtr| {
            assert_ne!(thread::current().id(), reactor_thread);
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        let queued = QueuedDispatchHandler::new(Arc::clone(&queue), inner);
        for _ in 0..5 {
            queued.handle(Event::timer().into_ptr());
        }
        assert!(queue.wait_for_idle(Duration::from_secs(10)));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
