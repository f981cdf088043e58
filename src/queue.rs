//! Thread safe FIFO with timed blocking pop.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

/// A mutex/condvar protected queue shared between producer and consumer
/// threads.
#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Add an item to the end of the queue.
    pub fn push(&self, item: T) {
        if let Ok(mut items) = self.items.lock() {
            items.push_back(item);
            self.cond.notify_all();
        }
    }

    /// Add an item to the front of the queue (next to be popped).
    pub fn push_front(&self, item: T) {
        if let Ok(mut items) = self.items.lock() {
            items.push_front(item);
            self.cond.notify_all();
        }
    }

    /// Remove the first item, waiting up to `timeout` for the queue to
    /// become non-empty.
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().ok()?;
        if items.is_empty() && !timeout.is_zero() {
            let (guard, _) = self.cond.wait_timeout(items, timeout).ok()?;
            items = guard;
        }
        items.pop_front()
    }

    /// Wake up all waiting consumers without adding an item.
    pub fn notify(&self) {
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn push_pop_order() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.push_front(0);
        assert_eq!(queue.pop(Duration::ZERO), Some(0));
        assert_eq!(queue.pop(Duration::ZERO), Some(1));
        assert_eq!(queue.pop(Duration::ZERO), Some(2));
        assert_eq!(queue.pop(Duration::ZERO), None);
    }

    #[test]
    fn pop_waits_for_producer() {
        let queue = Arc::new(Queue::new());
        let producer = queue.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42);
        });
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_secs(2)), Some(42));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().ok();
    }

    #[test]
    fn pop_times_out() {
        let queue: Queue<u8> = Queue::new();
        let start = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
