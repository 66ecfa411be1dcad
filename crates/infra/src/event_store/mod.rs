//! Append-only event store boundary.
//!
//! One trait, three backends (memory, durable file log, optional Postgres) and lazy
//! readers on top. Every backend assigns `global_version` at a single serialized
//! point and exposes events only once they are durable.

pub mod file;
pub mod in_memory;
mod index;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod read;
pub mod r#trait;
pub mod validation;

pub use file::{FileEventStore, RecoveryReport};
pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
pub use read::{GlobalReader, StreamReader};
pub use r#trait::{EventStore, EventStoreError, SharedEventStore};

use stocklens_core::{ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{CommitNotice, EventBus, EventEnvelope, NewEvent};
use tracing::warn;

/// Adapter that publishes a [`CommitNotice`] after every successful append.
///
/// This ensures the ordering invariant: **publish happens only after append succeeds**.
/// The append is already durable when the notice goes out, so a failed publish is
/// logged and not reported to the writer; listeners also poll and catch up anyway.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<CommitNotice>,
{
    fn append_batch(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self.store.append_batch(stream_id, expected, events)?;

        // 2) Publish the new head (best-effort)
        if let Some(last) = committed.last() {
            let notice = CommitNotice { head: last.global_version() };
            if let Err(err) = self.bus.publish(notice) {
                warn!(stream_id = %stream_id, head = notice.head, error = ?err, "commit notice not published");
            }
        }

        Ok(committed)
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<StreamVersion, EventStoreError> {
        self.store.stream_version(stream_id)
    }

    fn head(&self) -> Result<GlobalVersion, EventStoreError> {
        self.store.head()
    }

    fn read_stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.store.read_stream_page(stream_id, from_version, limit)
    }

    fn read_global(
        &self,
        from_global_version: GlobalVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.store.read_global(from_global_version, limit)
    }
}
