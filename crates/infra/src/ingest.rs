//! Batch ingestion pipeline (producer-facing write path).
//!
//! ```text
//! IngestBatch
//!   ↓
//! 1. Validate every event (a stream with one bad event is rejected whole)
//!   ↓
//! 2. Group by stream, first-appearance order; expected versions must be consecutive
//!   ↓
//! 3. Check every stream's expected version before committing any stream
//!   ↓
//! 4. Commit each surviving stream atomically (append_batch)
//!   ↓
//! 5. Catch up synchronous projections, then notify the router
//! ```
//!
//! Streams are the unit of atomicity: one stream's rejection never blocks another
//! stream of the same batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use stocklens_core::{
    CausationId, CorrelationId, ExpectedVersion, GlobalVersion, ProducerId, StreamId, StreamVersion,
};
use stocklens_events::{EventMetadata, NewEvent};

use crate::event_store::validation::{validate_batch, validate_type_name};
use crate::event_store::{EventStoreError, SharedEventStore};
use crate::projections::ProjectionEngine;
use crate::router::EventRouter;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Rejected before any append; never persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version conflict on stream {stream_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        stream_id: StreamId,
        expected: ExpectedVersion,
        actual: StreamVersion,
    },

    /// The append could not be made durable; nothing of it was written.
    #[error("durability failure: {0}")]
    Durability(String),

    /// Not attempted because an earlier stream of the batch hit a durability failure.
    #[error("not attempted after an earlier durability failure")]
    Aborted,

    #[error("event store error: {0}")]
    Store(String),
}

impl IngestError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, IngestError::VersionConflict { .. })
    }
}

impl From<EventStoreError> for IngestError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::VersionConflict {
                stream_id,
                expected,
                actual,
            } => IngestError::VersionConflict {
                stream_id,
                expected,
                actual,
            },
            EventStoreError::Validation(_) | EventStoreError::StreamTypeMismatch { .. } => {
                IngestError::Validation(value.to_string())
            }
            EventStoreError::Durability(msg) => IngestError::Durability(msg),
            EventStoreError::Corrupt(_) | EventStoreError::Backend(_) => IngestError::Store(value.to_string()),
        }
    }
}

fn default_schema_version() -> u32 {
    1
}

/// One event as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub stream_id: String,
    pub stream_type: String,
    /// The stream's version just before this event.
    pub expected_version: StreamVersion,
    pub event_type: String,
    pub payload: JsonValue,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub event_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub causation_id: Option<CausationId>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl BatchEvent {
    pub fn new(
        stream_id: impl Into<String>,
        stream_type: impl Into<String>,
        expected_version: StreamVersion,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_type: stream_type.into(),
            expected_version,
            event_type: event_type.into(),
            payload,
            schema_version: default_schema_version(),
            event_id: None,
            correlation_id: None,
            causation_id: None,
            occurred_at: None,
        }
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_causation(mut self, id: CausationId) -> Self {
        self.causation_id = Some(id);
        self
    }

    fn to_new_event(&self, producer: &ProducerId) -> Result<NewEvent, IngestError> {
        let stream_id = StreamId::new(self.stream_id.as_str()).map_err(|e| IngestError::Validation(e.to_string()))?;
        validate_type_name("stream_type", &self.stream_type)?;
        validate_type_name("event_type", &self.event_type)?;
        if !self.payload.is_object() {
            return Err(IngestError::Validation(format!(
                "payload of {} on {} must be a JSON object",
                self.event_type, self.stream_id
            )));
        }

        let mut metadata = EventMetadata::new().with_producer(producer.clone());
        metadata.correlation_id = self.correlation_id;
        metadata.causation_id = self.causation_id;

        let mut event = NewEvent::new(stream_id, self.stream_type.as_str(), self.event_type.as_str(), self.payload.clone())
            .with_metadata(metadata);
        event.schema_version = self.schema_version;
        if let Some(id) = self.event_id {
            event = event.with_event_id(id);
        }
        if let Some(at) = self.occurred_at {
            event = event.with_occurred_at(at);
        }
        Ok(event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub producer_id: ProducerId,
    pub events: Vec<BatchEvent>,
}

impl IngestBatch {
    pub fn new(producer_id: ProducerId) -> Self {
        Self {
            producer_id,
            events: Vec::new(),
        }
    }

    pub fn push(mut self, event: BatchEvent) -> Self {
        self.events.push(event);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamCommit {
    pub stream_id: StreamId,
    /// Stream version after the commit.
    pub stream_version: StreamVersion,
    pub first_global_version: GlobalVersion,
    pub last_global_version: GlobalVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRejection {
    /// As submitted (it may not be a valid id).
    pub stream_id: String,
    pub error: IngestError,
}

/// Per-stream outcome of one submitted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub committed: Vec<StreamCommit>,
    pub rejected: Vec<StreamRejection>,
    /// Store head once the batch was processed.
    pub head: GlobalVersion,
}

impl BatchReport {
    pub fn is_fully_committed(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn events_committed(&self) -> u64 {
        self.committed
            .iter()
            .map(|c| c.last_global_version - c.first_global_version + 1)
            .sum()
    }
}

struct StreamGroup<'b> {
    raw_id: &'b str,
    events: Vec<&'b BatchEvent>,
}

struct Prepared {
    raw_id: String,
    stream_id: StreamId,
    expected: ExpectedVersion,
    events: Vec<NewEvent>,
}

/// Producer-facing write path tying the store, projections and router together.
pub struct IngestPipeline {
    store: SharedEventStore,
    engine: Arc<ProjectionEngine>,
    router: Arc<EventRouter>,
}

impl IngestPipeline {
    pub fn new(store: SharedEventStore, engine: Arc<ProjectionEngine>, router: Arc<EventRouter>) -> Self {
        Self { store, engine, router }
    }

    /// Submit a producer batch; see the module docs for the steps.
    #[instrument(skip_all, fields(producer = %batch.producer_id, events = batch.events.len()))]
    pub fn submit(&self, batch: &IngestBatch) -> Result<BatchReport, IngestError> {
        if batch.events.is_empty() {
            return Err(IngestError::Validation("batch contains no events".to_string()));
        }

        let mut report = BatchReport::default();
        let prepared = group_by_stream(&batch.events)
            .into_iter()
            .filter_map(|group| match prepare(group, &batch.producer_id) {
                Ok(p) => Some(p),
                Err(rejection) => {
                    warn!(stream_id = %rejection.stream_id, error = %rejection.error, "stream rejected");
                    report.rejected.push(rejection);
                    None
                }
            })
            .collect::<Vec<_>>();

        // Every expectation is checked before the first commit.
        let mut ready = Vec::with_capacity(prepared.len());
        for p in prepared {
            match self.store.stream_version(&p.stream_id) {
                Ok(actual) if p.expected.matches(actual) => ready.push(p),
                Ok(actual) => {
                    debug!(stream_id = %p.stream_id, expected = %p.expected, actual, "version conflict");
                    report.rejected.push(StreamRejection {
                        stream_id: p.raw_id,
                        error: IngestError::VersionConflict {
                            stream_id: p.stream_id,
                            expected: p.expected,
                            actual,
                        },
                    });
                }
                Err(err) => report.rejected.push(StreamRejection {
                    stream_id: p.raw_id,
                    error: err.into(),
                }),
            }
        }

        let mut aborted = false;
        for p in ready {
            if aborted {
                report.rejected.push(StreamRejection {
                    stream_id: p.raw_id,
                    error: IngestError::Aborted,
                });
                continue;
            }
            match self.store.append_batch(&p.stream_id, p.expected, p.events) {
                Ok(committed) => {
                    if let (Some(first), Some(last)) = (committed.first(), committed.last()) {
                        report.committed.push(StreamCommit {
                            stream_id: p.stream_id,
                            stream_version: last.stream_version(),
                            first_global_version: first.global_version(),
                            last_global_version: last.global_version(),
                        });
                    }
                }
                Err(err) => {
                    let err = IngestError::from(err);
                    match &err {
                        IngestError::VersionConflict { .. } => {
                            debug!(stream_id = %p.stream_id, error = %err, "version conflict at commit");
                        }
                        IngestError::Durability(_) => {
                            error!(stream_id = %p.stream_id, error = %err, "durability failure, aborting batch");
                            aborted = true;
                        }
                        _ => warn!(stream_id = %p.stream_id, error = %err, "stream rejected at commit"),
                    }
                    report.rejected.push(StreamRejection {
                        stream_id: p.raw_id,
                        error: err,
                    });
                }
            }
        }

        report.head = self.store.head()?;
        if !report.committed.is_empty() {
            self.after_commit(report.head);
        }
        info!(
            committed = report.committed.len(),
            rejected = report.rejected.len(),
            head = report.head,
            "batch processed"
        );
        Ok(report)
    }

    /// Append a single event and return its global version.
    #[instrument(skip(self, payload, metadata), fields(stream_id = %stream_id))]
    pub fn append(
        &self,
        stream_id: &StreamId,
        stream_type: &str,
        expected: ExpectedVersion,
        event_type: &str,
        payload: JsonValue,
        metadata: EventMetadata,
    ) -> Result<GlobalVersion, IngestError> {
        validate_type_name("stream_type", stream_type)?;
        validate_type_name("event_type", event_type)?;
        if !payload.is_object() {
            return Err(IngestError::Validation("payload must be a JSON object".to_string()));
        }

        let event = NewEvent::new(stream_id.clone(), stream_type, event_type, payload).with_metadata(metadata);
        let committed = match self.store.append(event, expected) {
            Ok(env) => env,
            Err(err) => {
                let err = IngestError::from(err);
                match &err {
                    IngestError::VersionConflict { .. } => debug!(error = %err, "version conflict"),
                    IngestError::Durability(_) => error!(error = %err, "durability failure"),
                    _ => warn!(error = %err, "append rejected"),
                }
                return Err(err);
            }
        };

        let gv = committed.global_version();
        self.after_commit(gv);
        Ok(gv)
    }

    /// Synchronous views first, so producers see their own writes in them.
    fn after_commit(&self, head: GlobalVersion) {
        if let Err(err) = self.engine.catch_up_synchronous() {
            error!(head, error = %err, "synchronous projections could not catch up");
        }
        self.router.notify(head);
    }
}

fn group_by_stream(events: &[BatchEvent]) -> Vec<StreamGroup<'_>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<StreamGroup<'_>> = Vec::new();
    for event in events {
        let slot = *index.entry(event.stream_id.as_str()).or_insert_with(|| {
            groups.push(StreamGroup {
                raw_id: event.stream_id.as_str(),
                events: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].events.push(event);
    }
    groups
}

fn prepare(group: StreamGroup<'_>, producer: &ProducerId) -> Result<Prepared, StreamRejection> {
    let reject = |error: IngestError| StreamRejection {
        stream_id: group.raw_id.to_string(),
        error,
    };

    let events = group
        .events
        .iter()
        .map(|e| e.to_new_event(producer))
        .collect::<Result<Vec<_>, _>>()
        .map_err(reject)?;

    let first = ExpectedVersion::exact(group.events.first().map(|e| e.expected_version).unwrap_or_default());
    for (offset, e) in group.events.iter().enumerate() {
        let Some(want) = first.advanced_by(offset as u64) else {
            return Err(reject(IngestError::Validation(format!(
                "stream {}: expected version {first} leaves no room for {} events",
                group.raw_id,
                group.events.len()
            ))));
        };
        if !want.matches(e.expected_version) {
            return Err(reject(IngestError::Validation(format!(
                "stream {}: expected versions must be consecutive (event {offset} has {}, want {want})",
                group.raw_id, e.expected_version
            ))));
        }
    }

    let stream_id = match events.first() {
        Some(e) => e.stream_id.clone(),
        None => return Err(reject(IngestError::Validation("empty stream group".to_string()))),
    };
    validate_batch(&stream_id, &events).map_err(|e| reject(e.into()))?;

    Ok(Prepared {
        raw_id: group.raw_id.to_string(),
        stream_id,
        expected: first,
        events,
    })
}
