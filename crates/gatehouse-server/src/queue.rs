use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use gatehouse_protocol::Message;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("message queue is full")]
    Full,
    #[error("message queue is shut down")]
    Shutdown,
}

struct QueueState {
    messages: VecDeque<Message>,
    shutdown: bool,
}

/// Bounded FIFO between the network threads and the main loop.
///
/// When full, `push` rejects the new message and leaves the queue as it
/// is. After `shutdown`, pushes fail but queued messages can still be
/// popped.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(capacity.min(1024)),
                shutdown: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, message: Message) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(QueueError::Shutdown);
        }
        if state.messages.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        state.messages.push_back(message);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Pop the oldest message. With `wait`, blocks until one arrives and
    /// returns `None` only once the queue is shut down and empty.
    pub fn pop(&self, wait: bool) -> Option<Message> {
        let mut state = self.lock();
        if !wait {
            return state.messages.pop_front();
        }
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            if state.shutdown {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like `pop(true)` but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            let now = Instant::now();
            if state.shutdown || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Refuse further pushes and wake every waiting consumer.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued message. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.messages.len();
        state.messages.clear();
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn msg(n: u32) -> Message {
        Message::generic(n.to_string(), 3001, "")
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(8);
        for n in 0..3 {
            queue.push(msg(n)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        for n in 0..3 {
            assert_eq!(queue.pop(false).unwrap().client_id(), n.to_string());
        }
        assert!(queue.pop(false).is_none());
    }

    #[test]
    fn test_full_queue_rejects_newest() {
        let queue = MessageQueue::new(2);
        queue.push(msg(1)).unwrap();
        queue.push(msg(2)).unwrap();
        assert_eq!(queue.push(msg(3)), Err(QueueError::Full));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(false).unwrap().client_id(), "1");
        queue.push(msg(4)).unwrap();
        assert_eq!(queue.pop(false).unwrap().client_id(), "2");
        assert_eq!(queue.pop(false).unwrap().client_id(), "4");
    }

    #[test]
    fn test_shutdown_unblocks_waiting_pop() {
        let queue = Arc::new(MessageQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop(true))
        };
        thread::sleep(Duration::from_millis(50));
        queue.shutdown();
        assert!(consumer.join().unwrap().is_none());
        assert_eq!(queue.push(msg(1)), Err(QueueError::Shutdown));
        assert!(queue.is_shutdown());
    }

    #[test]
    fn test_drain_after_shutdown() {
        let queue = MessageQueue::new(4);
        queue.push(msg(1)).unwrap();
        queue.push(msg(2)).unwrap();
        queue.shutdown();
        queue.shutdown();
        assert!(queue.pop(true).is_some());
        assert!(queue.pop_timeout(Duration::from_secs(1)).is_some());
        assert!(queue.pop(true).is_none());
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue = MessageQueue::new(4);
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(50)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_blocking_pop_receives_from_producers() {
        let queue = Arc::new(MessageQueue::new(1000));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for n in 0..100 {
                        queue.push(msg(p * 1000 + n)).unwrap();
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < 400 {
            assert!(queue.pop_timeout(Duration::from_secs(5)).is_some());
            received += 1;
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = MessageQueue::new(4);
        queue.push(msg(1)).unwrap();
        queue.push(msg(2)).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
    }
}
