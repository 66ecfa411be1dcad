use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::EventEnvelope;

/// A typed domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "PortfolioCreated").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// JSON payload persisted for this event. The event type is stored beside it,
    /// so the payload holds only the variant's fields.
    fn payload(&self) -> Result<JsonValue, serde_json::Error>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot decode {event_type}: {reason}")]
pub struct DecodeError {
    pub event_type: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(event_type: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            event_type: event_type.into(),
            reason: reason.to_string(),
        }
    }
}

/// Tagged-union decoding of persisted events.
///
/// Implementors match on the event type string once, map each known type to a
/// variant and return `Ok(None)` for every other type, so consumers can match the
/// resulting enum exhaustively and treat unknown types as a no-op.
pub trait DecodeEvent: Sized {
    fn decode(event_type: &str, payload: &JsonValue) -> Result<Option<Self>, DecodeError>;

    fn decode_envelope(envelope: &EventEnvelope) -> Result<Option<Self>, DecodeError> {
        Self::decode(envelope.event_type(), envelope.payload())
    }
}
