use std::sync::RwLock;

use tracing::debug;

use stocklens_core::{ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{EventEnvelope, NewEvent};

use super::index::EventLog;
use super::r#trait::{EventStore, EventStoreError};

/// In-memory append-only event store.
///
/// Intended for tests/dev. The write section of the lock is the single point where
/// global versions are assigned.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<EventLog>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append_batch(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let mut log = self.log.write().map_err(|_| EventStoreError::poisoned("event log"))?;

        let committed = log.prepare(stream_id, expected, events)?;
        for env in &committed {
            log.push(env.clone())?;
        }

        if let Some(last) = committed.last() {
            debug!(
                stream_id = %stream_id,
                global_version = last.global_version(),
                count = committed.len(),
                "appended events"
            );
        }
        Ok(committed)
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<StreamVersion, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::poisoned("event log"))?;
        Ok(log.stream_version(stream_id))
    }

    fn head(&self) -> Result<GlobalVersion, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::poisoned("event log"))?;
        Ok(log.head())
    }

    fn read_stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::poisoned("event log"))?;
        Ok(log.stream_page(stream_id, from_version, limit))
    }

    fn read_global(
        &self,
        from_global_version: GlobalVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self.log.read().map_err(|_| EventStoreError::poisoned("event log"))?;
        Ok(log.global_page(from_global_version, limit))
    }
}
