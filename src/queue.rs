//! Bounded Queue
//!
//! Size-bounded FIFO used wherever two tasks trade control. Two overflow
//! policies:
//!
//! - `Wait`: the producer awaits free space. Used on the inbound wire so
//!   upstream sees backpressure before data loss.
//! - `DropOldest`: the producer always succeeds and the oldest queued
//!   item is evicted. Used on the archival tee where losing the tail of
//!   an outage beats stalling ingestion.
//!
//! Sender and receiver sides are split so the consumer can be a single
//! draining loop. `tokio::sync::mpsc` covers the Wait case but cannot
//! express eviction, so both policies share one VecDeque core.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Wait,
    DropOldest,
}

struct Shared<T> {
    items: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Build a bounded queue, returning the two halves.
pub fn bounded<T>(capacity: usize, policy: OverflowPolicy) -> (QueueSender<T>, QueueReceiver<T>) {
    assert!(capacity > 0, "queue capacity must be nonzero");
    let shared = Arc::new(Shared {
        items: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity.min(4096)),
            closed: false,
        }),
        not_empty: Notify::new(),
        not_full: Notify::new(),
        capacity,
        policy,
        dropped: AtomicU64::new(0),
    });
    (
        QueueSender {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

pub struct QueueSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue closed")
    }
}

impl std::error::Error for SendError {}

impl<T> QueueSender<T> {
    /// Enqueue one item according to the overflow policy. `Wait` suspends
    /// until space frees up; `DropOldest` never suspends.
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.shared.policy {
            OverflowPolicy::DropOldest => self.push_drop_oldest(item),
            OverflowPolicy::Wait => loop {
                let mut notified = std::pin::pin!(self.shared.not_full.notified());
                // Register before the capacity check so a dequeue racing
                // with this send cannot strand the producer.
                notified.as_mut().enable();
                {
                    let mut inner = self.shared.items.lock();
                    if inner.closed {
                        return Err(SendError::Closed);
                    }
                    if inner.queue.len() < self.shared.capacity {
                        inner.queue.push_back(item);
                        drop(inner);
                        self.shared.not_empty.notify_one();
                        return Ok(());
                    }
                }
                notified.await;
            },
        }
    }

    /// Non-suspending enqueue, valid for any policy: `DropOldest` evicts,
    /// `Wait` refuses when full.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        match self.shared.policy {
            OverflowPolicy::DropOldest => self
                .push_drop_oldest(item)
                .map_err(|_| TrySendError::Closed),
            OverflowPolicy::Wait => {
                let mut inner = self.shared.items.lock();
                if inner.closed {
                    return Err(TrySendError::Closed);
                }
                if inner.queue.len() >= self.shared.capacity {
                    return Err(TrySendError::Full(item));
                }
                inner.queue.push_back(item);
                drop(inner);
                self.shared.not_empty.notify_one();
                Ok(())
            }
        }
    }

    fn push_drop_oldest(&self, item: T) -> Result<(), SendError> {
        let mut inner = self.shared.items.lock();
        if inner.closed {
            return Err(SendError::Closed);
        }
        if inner.queue.len() >= self.shared.capacity {
            inner.queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.queue.push_back(item);
        drop(inner);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Close the queue. The receiver drains what is already enqueued and
    /// then observes end-of-stream.
    pub fn close(&self) {
        self.shared.items.lock().closed = true;
        self.shared.not_empty.notify_waiters();
        self.shared.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted under `DropOldest`.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed,
}

pub struct QueueReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueReceiver<T> {
    /// Dequeue the next item, suspending while empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let mut notified = std::pin::pin!(self.shared.not_empty.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.shared.items.lock();
                if let Some(item) = inner.queue.pop_front() {
                    drop(inner);
                    self.shared.not_full.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-suspending dequeue.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut inner = self.shared.items.lock();
        let item = inner.queue.pop_front();
        if item.is_some() {
            drop(inner);
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Drain up to `max` items without suspending.
    pub fn drain(&mut self, max: usize) -> Vec<T> {
        let mut inner = self.shared.items.lock();
        let take = max.min(inner.queue.len());
        let out: Vec<T> = inner.queue.drain(..take).collect();
        drop(inner);
        if !out.is_empty() {
            self.shared.not_full.notify_waiters();
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// TESTS
// =============================================================================
