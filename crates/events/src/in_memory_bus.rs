//! In-process bus over std channels.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{BusSubscription, EventBus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    #[error("bus subscriber list lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out
/// - Subscribers whose receiver was dropped are pruned on the next publish
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriber count (as of the last publish).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> BusSubscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned list still hands out a subscription; it never receives, and the
        // worker behind it falls back to its polling tick.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        BusSubscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommitNotice;

    #[test]
    fn every_subscriber_receives_every_notice() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(CommitNotice { head: 1 }).unwrap();
        bus.publish(CommitNotice { head: 2 }).unwrap();

        assert_eq!(a.recv().unwrap().head, 1);
        assert_eq!(a.recv().unwrap().head, 2);
        assert_eq!(b.drain_latest(), Some(CommitNotice { head: 2 }));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(CommitNotice { head: 1 }).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
