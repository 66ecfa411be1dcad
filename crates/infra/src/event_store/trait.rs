use std::sync::Arc;

use thiserror::Error;

use stocklens_core::{ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{EventEnvelope, NewEvent};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, durability) as opposed
/// to domain errors (validation of business invariants).
///
/// ## Error Categories
///
/// - **VersionConflict**: optimistic concurrency check failed; recoverable by
///   re-reading the stream and retrying with a fresh expectation
/// - **StreamTypeMismatch** / **Validation**: the append was malformed and nothing
///   was written
/// - **Durability**: the write could not be made durable; nothing was written
/// - **Corrupt**: the persisted log violates its own invariants
/// - **Backend**: lock poisoning or an unexpected storage failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("version conflict on stream {stream_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        stream_id: StreamId,
        expected: ExpectedVersion,
        actual: StreamVersion,
    },

    #[error("stream {stream_id} has stream_type '{existing}', attempted append with '{attempted}'")]
    StreamTypeMismatch {
        stream_id: StreamId,
        existing: String,
        attempted: String,
    },

    #[error("invalid append: {0}")]
    Validation(String),

    #[error("durability failure: {0}")]
    Durability(String),

    #[error("corrupt event log: {0}")]
    Corrupt(String),

    #[error("event store backend error: {0}")]
    Backend(String),
}

impl EventStoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, EventStoreError::VersionConflict { .. })
    }

    /// Rejected before anything was written, for a reason retrying cannot fix.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EventStoreError::Validation(_) | EventStoreError::StreamTypeMismatch { .. }
        )
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        EventStoreError::Backend(format!("{what} lock poisoned"))
    }
}

/// Append-only, globally ordered event store.
///
/// The `EventStore` is the **single source of truth**: streams (one per aggregate
/// instance) with gap-free `stream_version`s, interleaved into one gap-free
/// `global_version` order.
///
/// ## Append Semantics
///
/// `append_batch()`:
/// - Validates that every event targets `stream_id` with one `stream_type`
/// - Checks optimistic concurrency (`expected` must equal the current stream version)
/// - Assigns `stream_version`s from `current + 1` and `global_version`s from `head + 1`
/// - Persists the batch atomically (all or nothing) and durably before returning
///
/// ## Read Semantics
///
/// Reads return finite, ordered pages and never expose an event before it is
/// durable. Paging can restart from any version.
pub trait EventStore: Send + Sync {
    /// Append events to one stream as a single atomic unit.
    fn append_batch(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Append a single event to its stream.
    fn append(&self, event: NewEvent, expected: ExpectedVersion) -> Result<EventEnvelope, EventStoreError> {
        let stream_id = event.stream_id.clone();
        self.append_batch(&stream_id, expected, vec![event])?
            .pop()
            .ok_or_else(|| EventStoreError::Backend("append committed no event".to_string()))
    }

    /// Highest `stream_version` of the stream (0 if it does not exist).
    fn stream_version(&self, stream_id: &StreamId) -> Result<StreamVersion, EventStoreError>;

    /// Highest committed `global_version` (0 for an empty store).
    fn head(&self) -> Result<GlobalVersion, EventStoreError>;

    /// Up to `limit` events of one stream, starting at `from_version` (inclusive).
    fn read_stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    /// Up to `limit` events in global order, starting at `from_global_version` (inclusive).
    fn read_global(
        &self,
        from_global_version: GlobalVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append_batch(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).append_batch(stream_id, expected, events)
    }

    fn append(&self, event: NewEvent, expected: ExpectedVersion) -> Result<EventEnvelope, EventStoreError> {
        (**self).append(event, expected)
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<StreamVersion, EventStoreError> {
        (**self).stream_version(stream_id)
    }

    fn head(&self) -> Result<GlobalVersion, EventStoreError> {
        (**self).head()
    }

    fn read_stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).read_stream_page(stream_id, from_version, limit)
    }

    fn read_global(
        &self,
        from_global_version: GlobalVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).read_global(from_global_version, limit)
    }
}

/// Shared, type-erased store handle used by the engine, router and pipeline.
pub type SharedEventStore = Arc<dyn EventStore>;
