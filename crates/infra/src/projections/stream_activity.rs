use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stocklens_events::{EventEnvelope, EventFilter, Projection, ProjectionError, QueryParams};

/// Per stream type: how many events of each type, and how many distinct streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub total: u64,
    pub streams: u64,
    pub by_event_type: BTreeMap<String, u64>,
}

pub type ActivityState = BTreeMap<String, ActivityCounts>;

/// Store-wide activity counters; interested in every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamActivityProjection;

impl StreamActivityProjection {
    pub const NAME: &'static str = "stream_activity";
}

impl Projection for StreamActivityProjection {
    type State = ActivityState;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn interest(&self) -> EventFilter {
        EventFilter::all()
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn apply(&self, state: &mut Self::State, event: &EventEnvelope) -> Result<(), ProjectionError> {
        let counts = state.entry(event.stream_type().to_string()).or_default();
        counts.total += 1;
        // Version 1 is the first event of its stream.
        if event.stream_version() == 1 {
            counts.streams += 1;
        }
        *counts.by_event_type.entry(event.event_type().to_string()).or_default() += 1;
        Ok(())
    }

    /// `{"stream_type": "..."}` returns that type's counters; `null`/`{}` returns all.
    fn query(&self, state: &Self::State, params: &QueryParams) -> Result<JsonValue, ProjectionError> {
        let value = match params {
            JsonValue::Null => serde_json::to_value(state),
            JsonValue::Object(map) if map.is_empty() => serde_json::to_value(state),
            JsonValue::Object(map) => match map.get("stream_type") {
                Some(JsonValue::String(t)) if map.len() == 1 => {
                    serde_json::to_value(state.get(t).cloned().unwrap_or_default())
                }
                _ => {
                    return Err(ProjectionError::InvalidQuery(format!(
                        "expected {{\"stream_type\": <string>}}, got {params}"
                    )));
                }
            },
            other => {
                return Err(ProjectionError::InvalidQuery(format!(
                    "expected an object or null, got {other}"
                )));
            }
        };
        value.map_err(|e| ProjectionError::Serialize(e.to_string()))
    }
}
