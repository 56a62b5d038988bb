//! Publish/subscribe fan-out used for every notification stream in the crate
//!
//! Each subscriber gets its own unbounded flume channel. Emitting never blocks
//! and subscribers that dropped their receiver are pruned on the next emit.

use parking_lot::Mutex;

#[derive(Debug)]
pub struct Broadcaster<T> {
    subscribers: Mutex<Vec<flume::Sender<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Send an event to every live subscriber
    ///
    /// Returns the number of subscribers the event was delivered to.
    pub fn emit(&self, event: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_disconnected());
        subscribers.len()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}
