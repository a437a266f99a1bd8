// Copyright 2020 Joyent, Inc.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::dispatch::{same_handler, DispatchHandlerPtr};
use crate::event::Event;
use crate::request_cache::RequestCache;

pub type TimerId = u64;

/// What happens when a timer expires.
#[derive(Clone)]
pub(crate) enum TimerAction {
    /// Deliver a TIMER event to the handler.
    Dispatch(DispatchHandlerPtr),
    /// Expire the pending request `gid` if no response has claimed it yet.
    RequestTimeout { gid: u32, cache: Arc<RequestCache> },
}

impl TimerAction {
    pub(crate) fn fire(self) {
        match self {
            TimerAction::Dispatch(handler) => {
                handler.handle(Event::timer().into_ptr())
            }
            TimerAction::RequestTimeout { gid, cache } => cache.expire(gid),
        }
    }
}

struct TimerEntry {
    expire: Instant,
    seq: u64,
    id: TimerId,
    interval: Option<Duration>,
    action: TimerAction,
}

/*
 * BinaryHeap is a max-heap, so the ordering is reversed to pop the earliest
 * expiry first.  Ties are broken by insertion sequence.
 */
impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        other
            .expire
            .cmp(&self.expire)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<TimerEntry>,
    /// Ids of timers that have not been cancelled or fired.  Cancelled
    /// entries stay in the heap and are skipped when they surface.
    live: HashSet<TimerId>,
    next_id: TimerId,
    next_seq: u64,
}

/// Min-heap of pending timers keyed by absolute expiry.
///
/// Cancellation marks the timer dead rather than digging it out of the heap.
/// A timer already popped by `pop_expired` is no longer tracked, so a cancel
/// racing with its firing may still see it delivered once.
#[derive(Default)]
pub struct TimerHeap {
    inner: Mutex<Inner>,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap::default()
    }

    pub(crate) fn allocate_id(&self) -> TimerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.next_id
    }

    pub(crate) fn schedule(
        &self,
        id: TimerId,
        expire: Instant,
        interval: Option<Duration>,
        action: TimerAction,
    ) {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.live.insert(id);
        inner.heap.push(TimerEntry {
            expire,
            seq,
            id,
            interval,
            action,
        });
    }

    pub(crate) fn insert(
        &self,
        expire: Instant,
        interval: Option<Duration>,
        action: TimerAction,
    ) -> TimerId {
        let id = self.allocate_id();
        self.schedule(id, expire, interval, action);
        id
    }

    /// Returns true if the timer was still pending.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.lock().live.remove(&id)
    }

    /// Cancels every pending timer that delivers to `handler`.
    pub fn cancel_handler(&self, handler: &DispatchHandlerPtr) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<TimerId> = inner
            .heap
            .iter()
            .filter(|entry| match &entry.action {
                TimerAction::Dispatch(h) => same_handler(h, handler),
                TimerAction::RequestTimeout { .. } => false,
            })
            .map(|entry| entry.id)
            .collect();
        doomed
            .into_iter()
            .filter(|id| inner.live.remove(id))
            .count()
    }

    /// Expiry of the earliest live timer.
    pub fn next_expiry(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        loop {
            let (id, expire) = match inner.heap.peek() {
                Some(top) => (top.id, top.expire),
                None => return None,
            };
            if inner.live.contains(&id) {
                return Some(expire);
            }
            inner.heap.pop();
        }
    }

    /// Removes every live timer due at `now`, rescheduling recurring ones.
    pub(crate) fn pop_expired(&self, now: Instant) -> Vec<TimerAction> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        let mut recurring = Vec::new();
        while let Some(top) = inner.heap.peek() {
            if top.expire > now {
                break;
            }
            let entry = match inner.heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            if !inner.live.contains(&entry.id) {
                continue;
            }
            match entry.interval {
                Some(interval) => {
                    due.push(entry.action.clone());
                    recurring.push(TimerEntry {
                        expire: entry.expire + interval,
                        ..entry
                    });
                }
                None => {
                    inner.live.remove(&entry.id);
                    due.push(entry.action);
                }
            }
        }
        for mut entry in recurring {
            inner.next_seq += 1;
            entry.seq = inner.next_seq;
            inner.heap.push(entry);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every timer.  Called on shutdown so handler references held by
    /// pending timers are released.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        inner.live.clear();
    }
}
