//! Bounded lanes with per-lane overflow policy.
//!
//! One lane per traffic class: video drops the oldest frame on overflow
//! (stale frames are worthless), audio drops the newest batch (a gap
//! hurts less than replaying the past late), control blocks briefly and
//! then gives up. The per-client send queue is this same structure used
//! single-producer/single-consumer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("lane is closed")]
    Closed,

    #[error("push timed out after {0:?}")]
    PushTimeout(Duration),

    #[error("pop timed out after {0:?}")]
    PopTimeout(Duration),
}

impl QueueError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            QueueError::Closed => "E_RESOURCE_LANE_CLOSED",
            QueueError::PushTimeout(_) => "E_RESOURCE_PUSH_TIMEOUT",
            QueueError::PopTimeout(_) => "E_RESOURCE_POP_TIMEOUT",
        }
    }
}

/// What happens when a push finds the lane full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room (video).
    DropOldest,
    /// Discard the incoming item (audio).
    DropNewest,
    /// Wait for room up to the given timeout (control).
    Block(Duration),
}

/// Outcome of a policy-applied push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Pushed,
    /// The incoming item went in; this one fell out of the front.
    DroppedOldest(T),
    /// The incoming item itself was discarded.
    DroppedNewest(T),
}

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A bounded MPSC/SPSC lane.
pub struct Lane<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> Lane<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0, "lane capacity must be positive");
        Lane {
            inner: Mutex::new(Inner { queue: VecDeque::with_capacity(capacity), closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            policy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Non-blocking push: fails with the item back if the lane is full,
    /// regardless of policy.
    pub fn try_push(&self, item: T) -> Result<Option<T>, QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.queue.len() >= self.capacity {
            return Ok(Some(item));
        }
        inner.queue.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(None)
    }

    /// Policy-applying push. Never blocks longer than the `Block`
    /// policy's timeout, and never blocks at all for the drop policies.
    pub fn push(&self, item: T) -> Result<PushOutcome<T>, QueueError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if inner.queue.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    let evicted = inner.queue.pop_front().expect("full lane has a front");
                    inner.queue.push_back(item);
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::DroppedOldest(evicted));
                }
                OverflowPolicy::DropNewest => {
                    return Ok(PushOutcome::DroppedNewest(item));
                }
                OverflowPolicy::Block(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while inner.queue.len() >= self.capacity {
                        if inner.closed {
                            return Err(QueueError::Closed);
                        }
                        if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                            return Err(QueueError::PushTimeout(timeout));
                        }
                    }
                    if inner.closed {
                        return Err(QueueError::Closed);
                    }
                }
            }
        }
        inner.queue.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(PushOutcome::Pushed)
    }

    /// Block-with-timeout push regardless of the lane's own policy; used
    /// for control packets sharing a drop-policy lane.
    pub fn push_blocking(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(item);
                drop(inner);
                self.not_empty.notify_one();
                return Ok(());
            }
            if self.not_full.wait_until(&mut inner, deadline).timed_out() {
                return Err(QueueError::PushTimeout(timeout));
            }
        }
    }

    /// Blocking pop with deadline. After `close()` remaining items drain
    /// normally and then `Closed` is returned.
    pub fn pop(&self, timeout: Duration) -> Result<T, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            if inner.closed {
                return Err(QueueError::Closed);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return Err(QueueError::PopTimeout(timeout));
            }
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Result<Option<T>, QueueError> {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.queue.pop_front() {
            drop(inner);
            self.not_full.notify_one();
            return Ok(Some(item));
        }
        if inner.closed {
            return Err(QueueError::Closed);
        }
        Ok(None)
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let drained = inner.queue.drain(..).collect();
        drop(inner);
        self.not_full.notify_all();
        drained
    }

    /// Close the lane: producers fail immediately, consumers drain what
    /// is left and then observe `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
