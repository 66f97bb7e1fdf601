//! Injection Queues
//!
//! Each direction owns a FIFO of payloads submitted by external callers.
//! Callers enqueue from any task; the relay pump is the only consumer.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const STATE_PENDING: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_DISCARDED: u8 = 2;

/// Completion state of an injected payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    /// Written to the socket by the relay pump
    Done,
    /// Dropped because a new session started before it was written
    Discarded,
}

/// A payload waiting to be written into a live session
#[derive(Debug)]
pub struct PendingSend {
    payload: Bytes,
    state: AtomicU8,
}

impl PendingSend {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            state: AtomicU8::new(STATE_PENDING),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn state(&self) -> SendState {
        match self.state.load(Ordering::Acquire) {
            STATE_DONE => SendState::Done,
            STATE_DISCARDED => SendState::Discarded,
            _ => SendState::Pending,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state() == SendState::Done
    }

    /// Transitions out of `Pending` happen at most once
    pub(crate) fn mark_done(&self) {
        let _ = self.state.compare_exchange(
            STATE_PENDING,
            STATE_DONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn mark_discarded(&self) {
        let _ = self.state.compare_exchange(
            STATE_PENDING,
            STATE_DISCARDED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Mutex-guarded FIFO of pending sends for one direction
#[derive(Debug, Default)]
pub struct DirectionQueue {
    items: Mutex<VecDeque<Arc<PendingSend>>>,
}

impl DirectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<PendingSend>>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a payload and return the shared handle the caller waits on
    pub fn enqueue(&self, payload: impl Into<Bytes>) -> Arc<PendingSend> {
        let item = Arc::new(PendingSend::new(payload));
        self.lock().push_back(Arc::clone(&item));
        item
    }

    pub fn dequeue_one(&self) -> Option<Arc<PendingSend>> {
        self.lock().pop_front()
    }

    /// Drop every queued item, flagging each as discarded. Returns how many
    /// items were removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.lock().drain(..).collect();
        for item in &drained {
            item.mark_discarded();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = DirectionQueue::new();
        queue.enqueue(&b"one"[..]);
        queue.enqueue(&b"two"[..]);
        queue.enqueue(&b"three"[..]);

        assert_eq!(queue.len(), 3);
        assert_eq!(&queue.dequeue_one().unwrap().payload()[..], b"one");
        assert_eq!(&queue.dequeue_one().unwrap().payload()[..], b"two");
        assert_eq!(&queue.dequeue_one().unwrap().payload()[..], b"three");
        assert!(queue.dequeue_one().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_discards_pending_items() {
        let queue = DirectionQueue::new();
        let first = queue.enqueue(&b"stale"[..]);
        let second = queue.enqueue(&b"stale too"[..]);

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(first.state(), SendState::Discarded);
        assert_eq!(second.state(), SendState::Discarded);
    }

    #[test]
    fn test_done_is_final() {
        let queue = DirectionQueue::new();
        let item = queue.enqueue(&b"payload"[..]);

        let taken = queue.dequeue_one().unwrap();
        taken.mark_done();
        assert!(item.is_done());

        // A later clear never reverts a delivered item
        taken.mark_discarded();
        assert_eq!(item.state(), SendState::Done);
    }

    #[test]
    fn test_concurrent_enqueue() {
        let queue = Arc::new(DirectionQueue::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        queue.enqueue(format!("{}-{}", i, j));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 400);
    }
}
