//! Durable JSON-lines event log.
//!
//! One committed batch per line (a JSON array of envelopes), in global order. An
//! append writes its line with a single `write_all` followed by `fsync`; only then
//! does the batch become visible to readers. A batch is therefore recovered whole
//! or not at all.
//!
//! ## Recovery
//!
//! `open()` replays the file through the same index the in-memory store uses, so a
//! recovered log satisfies the same gap-free invariants. A crash can only leave a
//! torn record at the very end of the file (a line without its newline, or a line
//! that does not parse and has nothing after it); recovery truncates it. Anything
//! else that fails to parse or breaks version continuity is reported as corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, error, info, instrument, warn};

use stocklens_core::{ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{EventEnvelope, NewEvent};

use super::index::EventLog;
use super::r#trait::{EventStore, EventStoreError};

/// File name of the log inside the data directory.
pub const LOG_FILE_NAME: &str = "events.jsonl";

#[derive(Debug)]
struct LogWriter {
    file: File,
    /// Length of the file covering exactly the committed records.
    len: u64,
}

/// What recovery found when opening the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub events: u64,
    /// Bytes dropped from a torn trailing record.
    pub truncated_bytes: u64,
}

/// File-backed append-only event store.
#[derive(Debug)]
pub struct FileEventStore {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    log: RwLock<EventLog>,
    recovery: RecoveryReport,
}

impl FileEventStore {
    /// Open (or create) the log in `data_dir`, recovering its contents.
    #[instrument(skip_all, fields(data_dir = %data_dir.as_ref().display()), err)]
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .map_err(|e| EventStoreError::Durability(format!("create {}: {e}", data_dir.display())))?;
        let path = data_dir.join(LOG_FILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| EventStoreError::Durability(format!("open {}: {e}", path.display())))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| EventStoreError::Durability(format!("read {}: {e}", path.display())))?;

        let (log, valid_len) = recover(&raw)?;
        let truncated_bytes = raw.len() as u64 - valid_len;
        if truncated_bytes > 0 {
            warn!(
                path = %path.display(),
                truncated_bytes,
                "truncating torn trailing record"
            );
            file.set_len(valid_len)
                .and_then(|_| file.sync_all())
                .map_err(|e| EventStoreError::Durability(format!("truncate {}: {e}", path.display())))?;
        }

        let recovery = RecoveryReport {
            events: log.head(),
            truncated_bytes,
        };
        info!(path = %path.display(), head = recovery.events, "event log opened");

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter { file, len: valid_len }),
            log: RwLock::new(log),
            recovery,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }
}

/// Rebuild the index from raw file contents.
///
/// Returns the index and the byte length of the valid prefix.
fn recover(raw: &[u8]) -> Result<(EventLog, u64), EventStoreError> {
    let mut log = EventLog::default();
    let mut offset = 0usize;

    while offset < raw.len() {
        let rest = &raw[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            // Unterminated tail: the last write never completed.
            break;
        };

        let line = &rest[..newline];
        let is_last = offset + newline + 1 == raw.len();
        match serde_json::from_slice::<Vec<EventEnvelope>>(line) {
            Ok(batch) => {
                for env in batch {
                    log.push(env)?;
                }
            }
            Err(_) if is_last => break,
            Err(e) => {
                return Err(EventStoreError::Corrupt(format!(
                    "unreadable record at byte {offset}: {e}"
                )));
            }
        }
        offset += newline + 1;
    }

    Ok((log, offset as u64))
}

impl EventStore for FileEventStore {
    #[instrument(skip(self, events), fields(stream_id = %stream_id, expected = %expected, count = events.len()), err)]
    fn append_batch(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        // Held for the whole append: serializes global version assignment.
        let mut writer = self.writer.lock().map_err(|_| EventStoreError::poisoned("log writer"))?;

        let committed = {
            let log = self.log.read().map_err(|_| EventStoreError::poisoned("event log"))?;
            log.prepare(stream_id, expected, events)?
        };
        if committed.is_empty() {
            return Ok(committed);
        }

        let mut buf = serde_json::to_vec(&committed)
            .map_err(|e| EventStoreError::Validation(format!("envelope serialization failed: {e}")))?;
        buf.push(b'\n');

        let pre_len = writer.len;
        let written = writer.file.write_all(&buf).and_then(|_| writer.file.sync_data());
        if let Err(e) = written {
            error!(stream_id = %stream_id, error = %e, "append failed, rolling back log tail");
            // No partial batch may survive; if even the rollback fails the writer is unusable.
            writer
                .file
                .set_len(pre_len)
                .and_then(|_| writer.file.sync_data())
                .map_err(|e| EventStoreError::Durability(format!("rollback failed: {e}")))?;
            return Err(EventStoreError::Durability(format!(
                "write {}: {e}",
                self.path.display()
            )));
        }
        writer.len = pre_len + buf.len() as u64;

        let mut log = self.log.write().map_err(|_| EventStoreError::poisoned("event log"))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(stream: &str, n: u64) -> NewEvent {
        NewEvent::new(StreamId::new(stream).unwrap(), "portfolio", "CashDeposited", json!({ "n": n }))
    }

    fn append_n(store: &FileEventStore, stream: &str, n: u64) {
        let id = StreamId::new(stream).unwrap();
        for i in 0..n {
            let current = store.stream_version(&id).unwrap();
            store.append(event(stream, i), ExpectedVersion::exact(current)).unwrap();
        }
    }

    #[test]
    fn reopen_restores_every_committed_event() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileEventStore::open(dir.path()).unwrap();
            append_n(&store, "a", 3);
            append_n(&store, "b", 2);
        }

        let store = FileEventStore::open(dir.path()).unwrap();
        assert_eq!(store.head().unwrap(), 5);
        assert_eq!(store.stream_version(&StreamId::new("a").unwrap()).unwrap(), 3);
        assert_eq!(store.recovery(), RecoveryReport { events: 5, truncated_bytes: 0 });

        let env = store.append(event("b", 9), ExpectedVersion::exact(2)).unwrap();
        assert_eq!((env.stream_version(), env.global_version()), (3, 6));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileEventStore::open(dir.path()).unwrap();
            append_n(&store, "a", 2);
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"[{"event_id":"0190"#).unwrap();
        drop(file);

        let store = FileEventStore::open(dir.path()).unwrap();
        assert_eq!(store.head().unwrap(), 2);
        assert!(store.recovery().truncated_bytes > 0);

        let env = store.append(event("a", 3), ExpectedVersion::exact(2)).unwrap();
        assert_eq!(env.global_version(), 3);
        drop(store);
        assert_eq!(FileEventStore::open(dir.path()).unwrap().head().unwrap(), 3);
    }

    #[test]
    fn corruption_in_the_middle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileEventStore::open(dir.path()).unwrap();
            append_n(&store, "a", 1);
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let original = fs::read(&path).unwrap();
        let mut corrupted = b"not json\n".to_vec();
        corrupted.extend_from_slice(&original);
        fs::write(&path, corrupted).unwrap();

        assert!(matches!(FileEventStore::open(dir.path()), Err(EventStoreError::Corrupt(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 16, ..ProptestConfig::default() })]

        /// Global versions stay gap-free across any number of crash/recover cycles.
        #[test]
        fn gap_free_after_crash_and_recover(
            rounds in prop::collection::vec((1u64..5, 0usize..40), 1..5)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut expected_head = 0u64;

            for (appends, torn_len) in rounds {
                {
                    let store = FileEventStore::open(dir.path()).unwrap();
                    prop_assert_eq!(store.head().unwrap(), expected_head);
                    append_n(&store, "s", appends);
                    expected_head += appends;
                }
                // Simulate a crash in the middle of the next write.
                let garbage = "[{\"global_version\":".repeat(torn_len.max(1));
                let mut file = OpenOptions::new().append(true).open(dir.path().join(LOG_FILE_NAME)).unwrap();
                file.write_all(&garbage.as_bytes()[..torn_len.min(garbage.len())]).unwrap();
            }

            let store = FileEventStore::open(dir.path()).unwrap();
            let all = store.read_global(1, usize::MAX).unwrap();
            prop_assert_eq!(all.len() as u64, expected_head);
            for (idx, env) in all.iter().enumerate() {
                prop_assert_eq!(env.global_version(), idx as u64 + 1);
                prop_assert_eq!(env.stream_version(), idx as u64 + 1);
            }
        }
    }
}
