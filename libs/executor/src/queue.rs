//! Blocking FIFO queue shared between producers and worker threads.
//!
//! Workers park on a condition variable while the queue is empty. Closing the
//! queue rejects new items but lets consumers drain what is already queued;
//! `take` returns `None` only once the queue is both closed and empty.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Multi-producer, multi-consumer blocking queue.
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> TaskQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an item, waking one waiting consumer.
    ///
    /// Returns the item back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is open and empty.
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Remove the oldest item without blocking.
    pub fn try_take(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Close the queue. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        drop(state);
        self.available.notify_all();
        true
    }

    /// Remove and return every queued item.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        let taken: Vec<_> = (0..5).map(|_| queue.take().unwrap()).collect();
        assert_eq!(taken, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_close_rejects_push_but_drains() {
        let queue = TaskQueue::new();
        queue.push(1).unwrap();
        assert!(queue.close());
        assert!(!queue.close());
        assert_eq!(queue.push(2), Err(2));
        assert_eq!(queue.take(), Some(1));
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_take_blocks_until_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("ready").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("ready"));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.take())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.close();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), None);
        }
    }

    #[test]
    fn test_drain() {
        let queue = TaskQueue::new();
        queue.push('a').unwrap();
        queue.push('b').unwrap();
        assert_eq!(queue.drain(), vec!['a', 'b']);
        assert!(queue.is_empty());
    }
}
