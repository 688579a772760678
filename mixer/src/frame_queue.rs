//! Bounded hand-off between a decode thread and the render thread.
//!
//! The producer blocks while the queue is full, which throttles decoding to
//! the display rate. Deactivating the queue releases every waiter so a
//! source can be torn down without deadlocking its decode thread.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default number of decoded frames buffered per source
pub const DEFAULT_CAPACITY: usize = 3;

pub struct FrameQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// Signalled when space frees up or the queue is deactivated
    not_full: Condvar,
    /// Signalled when the queue becomes empty or is deactivated
    drained: Condvar,
    active: AtomicBool,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    /// Create an inactive queue. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            drained: Condvar::new(),
            active: AtomicBool::new(false),
            capacity,
        }
    }

    /// Append an item, waiting while the queue is full.
    ///
    /// Returns `false` and drops the item if the queue is (or becomes)
    /// inactive.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        loop {
            if !self.active.load(Ordering::Acquire) {
                return false;
            }
            if items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut items);
        }
        items.push_back(item);
        true
    }

    /// Remove the head without blocking
    pub fn pop(&self) -> Option<T> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
            if items.is_empty() {
                self.drained.notify_all();
            }
        }
        item
    }

    /// Inspect the head without removing it
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.items.lock().front().map(f)
    }

    /// Drop every queued item and return how many were discarded
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        self.not_full.notify_all();
        self.drained.notify_all();
        dropped
    }

    pub fn set_active(&self, active: bool) {
        // Flip the flag under the lock so a waiter cannot miss the wakeup
        let _items = self.items.lock();
        self.active.store(active, Ordering::Release);
        if !active {
            self.not_full.notify_all();
            self.drained.notify_all();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until the consumer has taken every item.
    ///
    /// Returns `true` once the queue is empty or inactive, `false` on
    /// timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        while !items.is_empty() && self.active.load(Ordering::Acquire) {
            if self.drained.wait_until(&mut items, deadline).timed_out() {
                return items.is_empty() || !self.active.load(Ordering::Acquire);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn active_queue(capacity: usize) -> Arc<FrameQueue<u32>> {
        let queue = Arc::new(FrameQueue::new(capacity));
        queue.set_active(true);
        queue
    }

    #[test]
    fn test_fifo_order() {
        let queue = active_queue(3);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.peek_with(|v| *v), Some(1));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_inactive_queue_refuses_push() {
        let queue: FrameQueue<u32> = FrameQueue::new(3);
        assert!(!queue.is_active());
        assert!(!queue.push(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let queue: FrameQueue<u32> = FrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(FrameQueue::<u32>::default().capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_push_blocks_while_full() {
        let queue = active_queue(2);
        assert!(queue.push(1));
        assert!(queue.push(2));

        let pushed = Arc::new(AtomicUsize::new(0));
        let producer = {
            let queue = Arc::clone(&queue);
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                let ok = queue.push(3);
                pushed.store(1, Ordering::SeqCst);
                ok
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pushed.load(Ordering::SeqCst), 0, "push must block when full");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.len(), 2);
        assert!(queue.len() <= queue.capacity());
    }

    #[test]
    fn test_deactivation_wakes_blocked_pusher() {
        let queue = active_queue(1);
        assert!(queue.push(1));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(30));
        queue.set_active(false);

        assert!(!producer.join().unwrap(), "push after deactivation fails");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let queue = active_queue(3);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..200 {
                    if !queue.push(i) {
                        break;
                    }
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 200 {
            assert!(queue.len() <= 3);
            if let Some(v) = queue.pop() {
                received.push(v);
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_clear_returns_count() {
        let queue = active_queue(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.clear(), 0);
    }

    #[test]
    fn test_wait_drained() {
        let queue = active_queue(3);
        assert!(queue.wait_drained(Duration::from_millis(1)));

        queue.push(1);
        assert!(!queue.wait_drained(Duration::from_millis(20)));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.pop()
            })
        };
        assert!(queue.wait_drained(Duration::from_secs(2)));
        assert_eq!(consumer.join().unwrap(), Some(1));
    }

    #[test]
    fn test_wait_drained_returns_on_deactivation() {
        let queue = active_queue(3);
        queue.push(1);

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_drained(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.set_active(false);
        assert!(waiter.join().unwrap());
    }
}
