use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    error::ErrorKind,
    event::{DispatchHandler, Event},
};

/// Blocking adapter over the async core. Install as a per-request or default
/// handler; received MESSAGE events queue up and `wait_for_reply` pops them,
/// while DISCONNECT/ERROR events surface as failures.
///
/// Waiters must run on non-reactor threads.
pub struct ReplySynchronizer {
    queue: Mutex<VecDeque<Event>>,
    cond: Condvar,
    capacity: usize,
}

impl Default for ReplySynchronizer {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl ReplySynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), cond: Condvar::new(), capacity }
    }

    /// Blocks until the next reply. `Err` carries the kind of a DISCONNECT
    /// or ERROR event.
    pub fn wait_for_reply(&self) -> Result<Event, ErrorKind> {
        let mut queue = crate::lock::mutex(&self.queue);
        loop {
            while let Some(event) = queue.pop_front() {
                if let Some(outcome) = classify(event) {
                    return outcome;
                }
            }
            queue = self.cond.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// As [`Self::wait_for_reply`], giving up after `timeout`.
    pub fn wait_for_reply_timeout(&self, timeout: Duration) -> Option<Result<Event, ErrorKind>> {
        let deadline = Instant::now() + timeout;
        let mut queue = crate::lock::mutex(&self.queue);
        loop {
            while let Some(event) = queue.pop_front() {
                if let Some(outcome) = classify(event) {
                    return Some(outcome);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }
}

impl DispatchHandler for ReplySynchronizer {
    fn handle(&self, event: Event) {
        let mut queue = crate::lock::mutex(&self.queue);
        if queue.len() >= self.capacity {
            warn!("reply queue full, dropping event");
            return;
        }
        queue.push_back(event);
        drop(queue);
        self.cond.notify_one();
    }
}

/// One-shot variant of [`ReplySynchronizer`] for exactly one reply: the
/// first MESSAGE, DISCONNECT or ERROR event wins.
pub struct DispatchHandlerSynchronizer {
    slot: Mutex<Option<Event>>,
    cond: Condvar,
}

impl Default for DispatchHandlerSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchHandlerSynchronizer {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None), cond: Condvar::new() }
    }

    pub fn wait(&self) -> Result<Event, ErrorKind> {
        let mut slot = crate::lock::mutex(&self.slot);
        loop {
            if let Some(event) = slot.take() {
                if let Some(outcome) = classify(event) {
                    return outcome;
                }
            }
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Event, ErrorKind>> {
        let deadline = Instant::now() + timeout;
        let mut slot = crate::lock::mutex(&self.slot);
        loop {
            if let Some(event) = slot.take() {
                if let Some(outcome) = classify(event) {
                    return Some(outcome);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }
}

impl DispatchHandler for DispatchHandlerSynchronizer {
    fn handle(&self, event: Event) {
        if !is_reply(&event) {
            return;
        }
        let mut slot = crate::lock::mutex(&self.slot);
        if slot.is_none() {
            *slot = Some(event);
            drop(slot);
            self.cond.notify_one();
        }
    }
}

/// CONNECTED and TIMER are progress notifications, not replies.
fn classify(event: Event) -> Option<Result<Event, ErrorKind>> {
    match event {
        Event::Message { .. } => Some(Ok(event)),
        Event::Disconnected { kind, .. } | Event::Error { kind, .. } => Some(Err(kind)),
        Event::Connected { .. } | Event::Timer => None,
    }
}

fn is_reply(event: &Event) -> bool {
    matches!(event, Event::Message { .. } | Event::Disconnected { .. } | Event::Error { .. })
}
