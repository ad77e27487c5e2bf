//! Outbound Session Queue
//!
//! Bounded per-client queue between the upstream fan-out path and the
//! client's own send loop.
//!
//! # Design
//!
//! Fan-out never waits on a client: [`OutboundQueue::push`] is synchronous
//! and O(1). When the queue is full the configured [`OverflowPolicy`] decides
//! which frame is lost and the dropped counter is incremented. The session's
//! writer is the only consumer and drains frames in FIFO order with
//! [`OutboundQueue::pop`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

// =============================================================================
// Frames
// =============================================================================

/// A serialized frame ready to be written to a client.
///
/// Cloning is cheap so one upstream message can be enqueued to many
/// subscribers without re-serializing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame(Arc<str>);

impl OutboundFrame {
    /// Get the frame text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OutboundFrame {
    fn from(text: String) -> Self {
        Self(Arc::from(text))
    }
}

impl From<&str> for OutboundFrame {
    fn from(text: &str) -> Self {
        Self(Arc::from(text))
    }
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Session State
// =============================================================================

/// Lifecycle state of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Accepting requests and receiving frames.
    #[default]
    Active,
    /// Releasing subscriptions.
    Closing,
    /// Terminal.
    Closed,
}

// =============================================================================
// Overflow Policy
// =============================================================================

/// What to do when a frame arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

impl OverflowPolicy {
    /// Parse a policy name (`drop_oldest` or `drop_newest`).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Some(Self::DropOldest),
            "drop_newest" => Some(Self::DropNewest),
            _ => None,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
        }
    }
}

/// Result of pushing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued with room to spare.
    Queued,
    /// Frame queued after evicting the oldest frame.
    DroppedOldest,
    /// Queue full; the incoming frame was discarded.
    DroppedNewest,
    /// Queue closed; the frame was discarded.
    Closed,
}

impl PushOutcome {
    /// Whether this push lost a frame to overflow.
    #[must_use]
    pub const fn is_overflow(self) -> bool {
        matches!(self, Self::DroppedOldest | Self::DroppedNewest)
    }
}

// =============================================================================
// Outbound Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueInner {
    frames: VecDeque<OutboundFrame>,
    closed: bool,
}

/// Bounded FIFO of frames waiting to be written to one client.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<QueueInner>,
    notify: Notify,
    dropped: AtomicU64,
}

impl OutboundQueue {
    /// Create a queue. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            policy,
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame without blocking, applying the overflow policy when
    /// the queue is full.
    pub fn push(&self, frame: OutboundFrame) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            if inner.frames.len() < self.capacity {
                inner.frames.push_back(frame);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.frames.pop_front();
                        inner.frames.push_back(frame);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                }
            }
        };

        if outcome.is_overflow() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if outcome != PushOutcome::DroppedNewest {
            self.notify.notify_one();
        }
        outcome
    }

    /// Wait for the next frame.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next frame if one is ready.
    #[must_use]
    pub fn try_pop(&self) -> Option<OutboundFrame> {
        self.inner.lock().frames.pop_front()
    }

    /// Close the queue and discard queued frames.
    ///
    /// Returns the number of frames discarded. Closing twice discards nothing.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let discarded = inner.frames.len();
            inner.frames.clear();
            discarded
        };
        self.notify.notify_waiters();
        discarded
    }

    /// Check whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Check whether no frames are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued frames.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy in effect.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Total frames lost to overflow.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
