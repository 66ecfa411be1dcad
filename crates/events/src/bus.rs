//! Commit notification fan-out (mechanics only).
//!
//! The bus carries **notices**, not data: after a commit the store broadcasts the
//! new head and every listener (projection workers, subscription workers) reads
//! whatever it is missing from the log itself. A lost or duplicated notice can
//! therefore only delay a consumer, never corrupt it; each worker also polls on a
//! tick so it converges without any notice at all.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stocklens_core::GlobalVersion;

/// Broadcast after every successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNotice {
    /// Highest global version now committed.
    pub head: GlobalVersion,
}

/// Receiving side of a bus subscription.
///
/// Meant to be drained by a single thread.
#[derive(Debug)]
pub struct BusSubscription<M> {
    receiver: Receiver<M>,
}

impl<M> BusSubscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Collapse everything already queued into the latest message.
    ///
    /// Notices are monotonic, so only the newest one matters.
    pub fn drain_latest(&self) -> Option<M> {
        let mut latest = None;
        while let Ok(message) = self.receiver.try_recv() {
            latest = Some(message);
        }
        latest
    }
}

/// Broadcast pub/sub: every subscriber gets a copy of every published message.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> BusSubscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> BusSubscription<M> {
        (**self).subscribe()
    }
}
