use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

/// Broadcast list of channel senders.
///
/// Every value is cloned to each live subscriber in subscription order.
/// Subscribers whose receiver was dropped are pruned on the next send.
pub struct Listeners<T> {
    senders: Arc<Mutex<Vec<Sender<T>>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Listeners {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Listeners {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = channel();
        self.add(tx);
        rx
    }

    pub fn add(&self, sender: Sender<T>) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
    }

    pub fn send(&self, value: T) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// Drop every sender; subscribers see their channel disconnect.
    pub fn close(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
