//! Event Dispatcher
//!
//! Thread-safe FIFO between the radio callback context (producer) and the
//! consumer. Producers never block. With a configured capacity the oldest
//! entry is dropped to make room; otherwise the queue is unbounded.

use crate::domain::models::DispatchedEvent;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug)]
struct Queue {
    events: VecDeque<DispatchedEvent>,
    capacity: Option<usize>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    notify: Notify,
}

/// Cloneable handle; every clone refers to the same queue
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    shared: Arc<Shared>,
}

impl EventDispatcher {
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// `Some(0)` is treated as `Some(1)`
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    events: VecDeque::new(),
                    capacity: capacity.map(|c| c.max(1)),
                    dropped: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.shared.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue without blocking. Returns `false` if the dispatcher is closed
    /// and the event was discarded.
    pub fn push(&self, event: DispatchedEvent) -> bool {
        {
            let mut queue = self.lock();
            if queue.closed {
                return false;
            }
            if let Some(capacity) = queue.capacity {
                while queue.events.len() >= capacity {
                    queue.events.pop_front();
                    queue.dropped += 1;
                    if queue.dropped == 1 || queue.dropped % 100 == 0 {
                        warn!(
                            dropped = queue.dropped,
                            capacity, "Event queue full, dropping oldest event"
                        );
                    }
                }
            }
            queue.events.push_back(event);
        }
        self.shared.available.notify_one();
        self.shared.notify.notify_one();
        true
    }

    /// Take the next event without waiting
    pub fn try_take(&self) -> Option<DispatchedEvent> {
        self.lock().events.pop_front()
    }

    /// Block until an event is available. Returns `None` once the dispatcher
    /// is closed and drained.
    pub fn take(&self) -> Option<DispatchedEvent> {
        let mut queue = self.lock();
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            if queue.closed {
                return None;
            }
            queue = self
                .shared
                .available
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`take`](Self::take) but gives up after `timeout`
    pub fn take_timeout(&self, timeout: Duration) -> Option<DispatchedEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if queue.closed || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
        }
    }

    /// Async counterpart of [`take`](Self::take)
    pub async fn next(&self) -> Option<DispatchedEvent> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut queue = self.lock();
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting events and wake every waiting consumer
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.available.notify_all();
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events discarded by the drop-oldest policy
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    pub fn capacity(&self) -> Option<usize> {
        self.lock().capacity
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::unbounded()
    }
}
