//! Structural checks shared by every store backend and the ingest pipeline.

use stocklens_core::StreamId;
use stocklens_events::NewEvent;

use super::r#trait::EventStoreError;

const MAX_TYPE_LEN: usize = 200;

/// `event_type` / `stream_type` must be short, non-empty and free of whitespace and
/// control characters.
pub fn validate_type_name(kind: &str, value: &str) -> Result<(), EventStoreError> {
    if value.is_empty() {
        return Err(EventStoreError::Validation(format!("{kind} cannot be empty")));
    }
    if value.len() > MAX_TYPE_LEN {
        return Err(EventStoreError::Validation(format!(
            "{kind} exceeds {MAX_TYPE_LEN} bytes"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EventStoreError::Validation(format!(
            "{kind} '{value}' contains whitespace or control characters"
        )));
    }
    Ok(())
}

/// Every event must target `stream_id` and agree on one `stream_type`.
pub fn validate_batch(stream_id: &StreamId, events: &[NewEvent]) -> Result<(), EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    for (idx, e) in events.iter().enumerate() {
        if &e.stream_id != stream_id {
            return Err(EventStoreError::Validation(format!(
                "batch for stream {stream_id} contains an event for {} (index {idx})",
                e.stream_id
            )));
        }
        if e.stream_type != first.stream_type {
            return Err(EventStoreError::StreamTypeMismatch {
                stream_id: stream_id.clone(),
                existing: first.stream_type.clone(),
                attempted: e.stream_type.clone(),
            });
        }
        validate_type_name("stream_type", &e.stream_type)?;
        validate_type_name("event_type", &e.event_type)?;
    }
    Ok(())
}
