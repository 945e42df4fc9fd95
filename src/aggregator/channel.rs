//! Bounded blocking channel used between the aggregation threads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// The channel was closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO queue with blocking `put` and `get`.
///
/// Closing wakes every waiter. Items already queued can still be received
/// after close.
pub struct Channel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Channel<T> {
    /// Creates a channel holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueues `item`, waiting while the channel is full.
    pub fn put(&self, item: T) -> Result<(), ChannelClosed> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(ChannelClosed);
            }
            if state.buffer.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }
        state.buffer.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues an item, waiting while the channel is empty.
    pub fn get(&self) -> Result<T, ChannelClosed> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.buffer.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(ChannelClosed);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, ChannelClosed> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.buffer.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.closed {
                return Err(ChannelClosed);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.buffer.pop_front());
            }
        }
    }

    /// Closes the channel and wakes every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let ch = Channel::new(4);
        ch.put(1).expect("put");
        ch.put(2).expect("put");
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.get(), Ok(1));
        assert_eq!(ch.get(), Ok(2));
        assert!(ch.is_empty());
    }

    #[test]
    fn test_get_timeout_on_empty() {
        let ch: Channel<u32> = Channel::new(1);
        assert_eq!(ch.get_timeout(Duration::from_millis(10)), Ok(None));
    }

    #[test]
    fn test_close_drains_then_errors() {
        let ch = Channel::new(2);
        ch.put("a").expect("put");
        ch.close();
        assert!(ch.is_closed());
        assert_eq!(ch.put("b"), Err(ChannelClosed));
        assert_eq!(ch.get(), Ok("a"));
        assert_eq!(ch.get(), Err(ChannelClosed));
        assert_eq!(ch.get_timeout(Duration::from_millis(1)), Err(ChannelClosed));
    }

    #[test]
    fn test_put_blocks_until_space() {
        let ch = Arc::new(Channel::new(1));
        ch.put(0).expect("put");

        let producer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                for i in 1..100 {
                    ch.put(i).expect("put");
                }
                ch.close();
            })
        };

        let mut received = Vec::new();
        while let Ok(v) = ch.get() {
            received.push(v);
        }
        producer.join().expect("producer panicked");
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_wakes_blocked_getter() {
        let ch: Arc<Channel<u8>> = Arc::new(Channel::new(1));
        let getter = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.get())
        };
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert_eq!(getter.join().expect("getter panicked"), Err(ChannelClosed));
    }
}
