use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub const DEFAULT_OUTBOUND_DEPTH: usize = 64;

/// One serialized frame waiting to go out on a socket.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub payload: String,
    /// Critical frames are never dropped under backpressure; they displace
    /// the oldest non-critical frame instead.
    pub critical: bool,
    /// Lifecycle frames that put the socket into Draining once sent.
    pub drain_after: bool,
}

impl OutboundFrame {
    pub fn normal(payload: String) -> Self {
        Self {
            payload,
            critical: false,
            drain_after: false,
        }
    }

    /// Lifecycle frame: survives backpressure and drains the socket.
    pub fn lifecycle(payload: String) -> Self {
        Self {
            payload,
            critical: true,
            drain_after: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest non-critical frame was displaced.
    DisplacedOldest,
    /// The queue was full of critical frames; the incoming frame was dropped.
    Dropped,
    Closed,
}

/// Bounded per-socket outbound channel. Producers (the pub/sub dispatcher,
/// the socket's own handlers) push; only the socket task pops. Ordering is
/// FIFO apart from the displacement rule above.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundFrame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, frame: OutboundFrame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut queue = self.lock();
            if queue.len() < self.capacity {
                queue.push_back(frame);
                PushOutcome::Queued
            } else {
                let displaced = queue.iter().position(|f| !f.critical);
                match displaced {
                    Some(idx) => {
                        queue.remove(idx);
                        queue.push_back(frame);
                        PushOutcome::DisplacedOldest
                    }
                    // Every queued frame is critical. A critical frame may
                    // overflow the soft cap; anything else is dropped.
                    None if frame.critical => {
                        queue.push_back(frame);
                        PushOutcome::Queued
                    }
                    None => PushOutcome::Dropped,
                }
            }
        };

        if outcome != PushOutcome::Dropped {
            self.notify.notify_one();
        }
        outcome
    }

    /// Wait for the next frame. Returns None once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<OutboundFrame> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OutboundFrame>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
