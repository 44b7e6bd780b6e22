//! Bounded blocking queue.
//!
//! A fixed-capacity FIFO channel shared between producers and consumers.
//! `push` never blocks: a full queue rejects the element and the caller
//! decides what to drop. `pop` blocks until an element arrives or the
//! queue is closed and drained, which is what lets worker threads finish
//! their backlog before joining.

#![allow(dead_code)] // The full queue contract is wider than what the server wires up.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe bounded FIFO with blocking pop and non-blocking push.
pub struct BlockQueue<T> {
    state: Mutex<QueueState<T>>,
    cond: Condvar,
    capacity: usize,
}

impl<T> BlockQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BlockQueue capacity must be positive");
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cond: Condvar::new(),
            capacity,
        }
    }

    /// Append an element. Returns false without blocking when the queue
    /// is full or closed; a rejected push wakes every waiter so stalled
    /// consumers get a chance to drain.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.closed || state.items.len() >= self.capacity {
            self.cond.notify_all();
            return false;
        }
        state.items.push_back(item);
        self.cond.notify_one();
        true
    }

    /// Remove and return the front element, blocking while the queue is
    /// empty. Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`pop`](Self::pop) but waits at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if result.timed_out() && state.items.is_empty() {
                return None;
            }
        }
    }

    /// Close the queue: pending elements remain poppable, new pushes are
    /// rejected, and every blocked consumer is woken.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    /// Maximum number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued element.
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> BlockQueue<T> {
    /// Clone of the front element, if any.
    pub fn front(&self) -> Option<T> {
        self.lock().items.front().cloned()
    }

    /// Clone of the back element, if any.
    pub fn back(&self) -> Option<T> {
        self.lock().items.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = BlockQueue::new(4);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_push_full_rejects() {
        let q = BlockQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.len(), 2);
        assert!(q.is_full());
    }

    #[test]
    fn test_front_back_clear() {
        let q = BlockQueue::new(4);
        q.push(10);
        q.push(20);
        assert_eq!(q.front(), Some(10));
        assert_eq!(q.back(), Some(20));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.front(), None);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let q: BlockQueue<u32> = BlockQueue::new(1);
        let start = std::time::Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = Arc::new(BlockQueue::new(1));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(q.push(42));
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_close_drains_then_none() {
        let q = BlockQueue::new(4);
        q.push(1);
        q.push(2);
        q.close();
        assert!(!q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let q: Arc<BlockQueue<u32>> = Arc::new(BlockQueue::new(1));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_many_producers_one_consumer() {
        let q = Arc::new(BlockQueue::new(64));
        let mut producers = Vec::new();
        for base in 0..4u32 {
            let q = Arc::clone(&q);
            producers.push(thread::spawn(move || {
                for i in 0..16u32 {
                    while !q.push(base * 16 + i) {
                        thread::yield_now();
                    }
                }
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..64 {
            seen.push(q.pop().unwrap());
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }
}
