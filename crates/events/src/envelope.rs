use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use stocklens_core::{CausationId, CorrelationId, GlobalVersion, ProducerId, StreamId, StreamVersion};

use crate::event::Event;

/// Provenance attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
    pub producer_id: Option<ProducerId>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_causation(mut self, id: CausationId) -> Self {
        self.causation_id = Some(id);
        self
    }

    pub fn with_producer(mut self, id: ProducerId) -> Self {
        self.producer_id = Some(id);
        self
    }
}

/// An event ready to be appended to a stream.
///
/// It carries everything except the two versions, which only the store assigns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub stream_type: String,
    pub event_type: String,
    /// Schema version of `payload` (payload evolution, not stream position).
    pub schema_version: u32,
    pub payload: JsonValue,
    pub metadata: EventMetadata,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        stream_id: StreamId,
        stream_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            stream_id,
            stream_type: stream_type.into(),
            event_type: event_type.into(),
            schema_version: 1,
            payload,
            metadata: EventMetadata::default(),
            occurred_at: Utc::now(),
        }
    }

    /// Build from a typed domain event, capturing its type, schema version and
    /// business time.
    pub fn from_typed<E>(
        stream_id: StreamId,
        stream_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            stream_id,
            stream_type: stream_type.into(),
            event_type: event.event_type().to_string(),
            schema_version: event.version(),
            payload: event.payload()?,
            metadata: EventMetadata::default(),
            occurred_at: event.occurred_at(),
        })
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// A committed event as persisted and handed to readers.
///
/// Only the store creates envelopes; everyone else sees them read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,
    stream_id: StreamId,
    stream_type: String,
    event_type: String,
    schema_version: u32,

    /// Position in the stream (1-based, gap-free).
    stream_version: StreamVersion,
    /// Position in the whole store (1-based, gap-free).
    global_version: GlobalVersion,

    payload: JsonValue,
    metadata: EventMetadata,
    occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Seal a pending event with the versions assigned at commit.
    pub fn commit(event: NewEvent, stream_version: StreamVersion, global_version: GlobalVersion) -> Self {
        Self {
            event_id: event.event_id,
            stream_id: event.stream_id,
            stream_type: event.stream_type,
            event_type: event.event_type,
            schema_version: event.schema_version,
            stream_version,
            global_version,
            payload: event.payload,
            metadata: event.metadata,
            occurred_at: event.occurred_at,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn stream_version(&self) -> StreamVersion {
        self.stream_version
    }

    pub fn global_version(&self) -> GlobalVersion {
        self.global_version
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_keeps_pending_fields_and_assigns_versions() {
        let stream = StreamId::new("portfolio-1").unwrap();
        let pending = NewEvent::new(stream.clone(), "portfolio", "PortfolioCreated", json!({"owner": "ada"}))
            .with_metadata(EventMetadata::new().with_correlation(CorrelationId::new()));

        let env = EventEnvelope::commit(pending.clone(), 1, 7);

        assert_eq!(env.stream_id(), &stream);
        assert_eq!(env.event_type(), "PortfolioCreated");
        assert_eq!(env.stream_version(), 1);
        assert_eq!(env.global_version(), 7);
        assert_eq!(env.event_id(), pending.event_id);
        assert_eq!(env.metadata(), &pending.metadata);
    }

    #[test]
    fn envelope_serializes_with_every_persisted_field() {
        let env = EventEnvelope::commit(
            NewEvent::new(StreamId::new("s-1").unwrap(), "portfolio", "X", json!({})),
            1,
            1,
        );
        let value = serde_json::to_value(&env).unwrap();
        for field in [
            "event_id",
            "stream_id",
            "stream_type",
            "event_type",
            "stream_version",
            "global_version",
            "payload",
            "metadata",
            "occurred_at",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
