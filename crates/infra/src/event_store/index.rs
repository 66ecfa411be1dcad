//! In-memory index of committed events shared by the memory and file backends.

use std::collections::HashMap;

use stocklens_core::{ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{EventEnvelope, NewEvent};

use super::r#trait::EventStoreError;
use super::validation::validate_batch;

#[derive(Debug)]
struct StreamEntry {
    stream_type: String,
    /// `globals[v - 1]` is the global version of stream version `v`.
    globals: Vec<GlobalVersion>,
}

/// Global log plus per-stream positions.
///
/// `events[g - 1]` holds global version `g`; both orders are gap-free by
/// construction because `push` refuses anything but the next position.
#[derive(Debug, Default)]
pub(crate) struct EventLog {
    events: Vec<EventEnvelope>,
    streams: HashMap<StreamId, StreamEntry>,
}

impl EventLog {
    pub(crate) fn head(&self) -> GlobalVersion {
        self.events.len() as GlobalVersion
    }

    pub(crate) fn stream_version(&self, stream_id: &StreamId) -> StreamVersion {
        self.streams
            .get(stream_id)
            .map(|s| s.globals.len() as StreamVersion)
            .unwrap_or(0)
    }

    /// Validate an append and assign its versions without mutating the log.
    pub(crate) fn prepare(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        validate_batch(stream_id, &events)?;
        if events.is_empty() {
            return Ok(vec![]);
        }

        let actual = self.stream_version(stream_id);
        if !expected.matches(actual) {
            return Err(EventStoreError::VersionConflict {
                stream_id: stream_id.clone(),
                expected,
                actual,
            });
        }

        // Enforce stream type stability across the stream.
        if let Some(existing) = self.streams.get(stream_id) {
            if existing.stream_type != events[0].stream_type {
                return Err(EventStoreError::StreamTypeMismatch {
                    stream_id: stream_id.clone(),
                    existing: existing.stream_type.clone(),
                    attempted: events[0].stream_type.clone(),
                });
            }
        }

        let head = self.head();
        Ok(events
            .into_iter()
            .enumerate()
            .map(|(offset, e)| {
                let offset = offset as u64 + 1;
                EventEnvelope::commit(e, actual + offset, head + offset)
            })
            .collect())
    }

    /// Append one committed envelope, verifying it is the next in both orders.
    pub(crate) fn push(&mut self, envelope: EventEnvelope) -> Result<(), EventStoreError> {
        let expected_global = self.head() + 1;
        if envelope.global_version() != expected_global {
            return Err(EventStoreError::Corrupt(format!(
                "expected global_version {expected_global}, found {}",
                envelope.global_version()
            )));
        }

        let expected_stream = self.stream_version(envelope.stream_id()) + 1;
        if envelope.stream_version() != expected_stream {
            return Err(EventStoreError::Corrupt(format!(
                "stream {} expected stream_version {expected_stream}, found {}",
                envelope.stream_id(),
                envelope.stream_version()
            )));
        }

        let entry = self
            .streams
            .entry(envelope.stream_id().clone())
            .or_insert_with(|| StreamEntry {
                stream_type: envelope.stream_type().to_string(),
                globals: Vec::new(),
            });
        if entry.stream_type != envelope.stream_type() {
            return Err(EventStoreError::Corrupt(format!(
                "stream {} changes stream_type at version {}",
                envelope.stream_id(),
                envelope.stream_version()
            )));
        }

        entry.globals.push(envelope.global_version());
        self.events.push(envelope);
        Ok(())
    }

    pub(crate) fn stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Vec<EventEnvelope> {
        let Some(entry) = self.streams.get(stream_id) else {
            return vec![];
        };
        let skip = from_version.max(1) as usize - 1;
        entry
            .globals
            .iter()
            .skip(skip)
            .take(limit)
            .filter_map(|g| self.events.get(*g as usize - 1).cloned())
            .collect()
    }

    pub(crate) fn global_page(&self, from_global_version: GlobalVersion, limit: usize) -> Vec<EventEnvelope> {
        let skip = from_global_version.max(1) as usize - 1;
        self.events.iter().skip(skip).take(limit).cloned().collect()
    }
}
