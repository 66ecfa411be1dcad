use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use stocklens_core::GlobalVersion;

use crate::{DecodeError, EventEnvelope, EventFilter};

/// Parameters of a view query (a JSON object, `null` for "everything").
pub type QueryParams = JsonValue;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("event at global version {global_version} could not be decoded: {source}")]
    Decode {
        global_version: GlobalVersion,
        #[source]
        source: DecodeError,
    },

    #[error("event at global version {global_version} rejected: {reason}")]
    Rejected {
        global_version: GlobalVersion,
        reason: String,
    },

    #[error("apply panicked at global version {global_version}: {message}")]
    Panicked {
        global_version: GlobalVersion,
        message: String,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("state serialization failed: {0}")]
    Serialize(String),
}

impl ProjectionError {
    pub fn decode(envelope: &EventEnvelope, source: DecodeError) -> Self {
        Self::Decode {
            global_version: envelope.global_version(),
            source,
        }
    }

    pub fn rejected(envelope: &EventEnvelope, reason: impl Into<String>) -> Self {
        Self::Rejected {
            global_version: envelope.global_version(),
            reason: reason.into(),
        }
    }
}

/// A projection derives a queryable view from the global event log.
///
/// `apply` must be a pure function of `(state, event)`: no clocks, no IO, no
/// randomness, no reads of anything but its arguments. The engine relies on this to
/// rebuild a view by replay and to compare replays byte for byte, which also means
/// `State` should serialize deterministically (ordered maps, not hash maps).
///
/// `apply` is only called with events accepted by `interest()`. Events a projection
/// is not interested in still advance its checkpoint.
pub trait Projection: Send + Sync + 'static {
    type State: Clone + Serialize + Send + Sync + 'static;

    /// Unique view name.
    fn name(&self) -> &str;

    /// Which events this projection consumes.
    fn interest(&self) -> EventFilter;

    /// Zero value the view starts from (and is reset to on rebuild).
    fn initial_state(&self) -> Self::State;

    fn apply(&self, state: &mut Self::State, event: &EventEnvelope) -> Result<(), ProjectionError>;

    /// Answer a read-only query against the current state.
    ///
    /// The default returns the whole state.
    fn query(&self, state: &Self::State, params: &QueryParams) -> Result<JsonValue, ProjectionError> {
        let _ = params;
        serde_json::to_value(state).map_err(|e| ProjectionError::Serialize(e.to_string()))
    }
}
