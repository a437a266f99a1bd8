// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::event::{EventPtr, EventType};

/// Receives events from reactor threads.
///
/// Implementations are called from a reactor thread that services many
/// sockets, so they should return quickly (or hand the event to an
/// `ApplicationQueue`).
pub trait DispatchHandler: Send + Sync {
    fn handle(&self, event: EventPtr);
}

pub type DispatchHandlerPtr = Arc<dyn DispatchHandler>;

impl<F> DispatchHandler for F
where
    F: Fn(EventPtr) + Send + Sync,
{
    fn handle(&self, event: EventPtr) {
        self(event)
    }
}

/// Produces one dispatch handler per accepted connection.
pub trait ConnectionHandlerFactory: Send + Sync {
    fn get_instance(&self) -> DispatchHandlerPtr;
}

pub type ConnectionHandlerFactoryPtr = Arc<dyn ConnectionHandlerFactory>;

impl<F> ConnectionHandlerFactory for F
where
    F: Fn() -> DispatchHandlerPtr + Send + Sync,
{
    fn get_instance(&self) -> DispatchHandlerPtr {
        self()
    }
}

/// Compares handlers by identity.
pub(crate) fn same_handler(a: &DispatchHandlerPtr, b: &DispatchHandlerPtr) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Turns asynchronous delivery into a blocking wait.
///
/// Every event handed to this handler is queued until a caller picks it up
/// with `wait_for_event`.
#[derive(Default)]
pub struct DispatchHandlerSynchronizer {
    queue: Mutex<VecDeque<EventPtr>>,
    cond: Condvar,
}

impl DispatchHandlerSynchronizer {
    pub fn new() -> Arc<DispatchHandlerSynchronizer> {
        Arc::new(DispatchHandlerSynchronizer::default())
    }

    /// Waits up to `timeout` for the next event.
    pub fn wait_for_event(&self, timeout: Duration) -> Option<EventPtr> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            let _ = self
                .cond
                .wait_while_for(&mut queue, |q| q.is_empty(), timeout);
        }
        queue.pop_front()
    }

    /// Waits for CONNECTION_ESTABLISHED; any other event counts as failure.
    pub fn wait_for_connection(&self, timeout: Duration) -> bool {
        match self.wait_for_event(timeout) {
            Some(event) => event.event_type == EventType::ConnectionEstablished,
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl DispatchHandler for DispatchHandlerSynchronizer {
    fn handle(&self, event: EventPtr) {
        self.queue.lock().push_back(event);
        self.cond.notify_one();
    }
}
