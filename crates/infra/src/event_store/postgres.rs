//! Postgres-backed event store implementation (cargo feature `postgres`).
//!
//! ## Schema
//!
//! - `events` is keyed by `global_version` with `UNIQUE (stream_id, stream_version)`.
//! - `event_sequence` holds one row with the last allocated global version. Every
//!   append locks it `FOR UPDATE` inside the append transaction, which serializes
//!   global allocation and keeps the sequence gap-free (a rolled-back append never
//!   consumes a number, unlike a Postgres `SEQUENCE`).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `VersionConflict` (concurrent append) |
//! | Database (check violation) | `23514` | `Validation` |
//! | Database (other) | Any other | `Durability` |
//! | PoolClosed / Io / other | N/A | `Durability` |

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use stocklens_core::{ExpectedVersion, GlobalVersion, StreamId, StreamVersion};
use stocklens_events::{EventEnvelope, EventMetadata, NewEvent};

use super::r#trait::{EventStore, EventStoreError};
use super::validation::validate_batch;

/// DDL for the tables this store expects.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_sequence (
    id SMALLINT PRIMARY KEY CHECK (id = 1),
    last_global_version BIGINT NOT NULL
);
INSERT INTO event_sequence (id, last_global_version) VALUES (1, 0) ON CONFLICT (id) DO NOTHING;

CREATE TABLE IF NOT EXISTS events (
    global_version BIGINT PRIMARY KEY CHECK (global_version > 0),
    event_id UUID NOT NULL UNIQUE,
    stream_id TEXT NOT NULL,
    stream_type TEXT NOT NULL,
    stream_version BIGINT NOT NULL CHECK (stream_version > 0),
    event_type TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    payload JSONB NOT NULL,
    metadata JSONB NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (stream_id, stream_version)
);
"#;

/// Postgres-backed append-only event store.
///
/// The `EventStore` trait is synchronous; calls must come from inside a
/// multi-threaded tokio runtime, where they run on the current worker via
/// `block_in_place`.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Create tables if missing.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Append one stream batch inside a single transaction.
    #[instrument(
        skip(self, events),
        fields(
            stream_id = %stream_id,
            expected = %expected,
            event_count = events.len(),
            head = tracing::field::Empty
        ),
        err
    )]
    pub async fn append_events(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        validate_batch(stream_id, &events)?;
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Lock the allocation row first: from here on this transaction is the only writer.
        let head = lock_sequence(&mut tx).await?;
        let (actual, existing_type) = check_stream_version(&mut tx, stream_id).await?;

        if let Some(existing) = existing_type {
            if existing != events[0].stream_type {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::StreamTypeMismatch {
                    stream_id: stream_id.clone(),
                    existing,
                    attempted: events[0].stream_type.clone(),
                });
            }
        }

        if !expected.matches(actual) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::VersionConflict {
                stream_id: stream_id.clone(),
                expected,
                actual,
            });
        }

        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let offset = offset as u64 + 1;
            let env = EventEnvelope::commit(event, actual + offset, head + offset);
            let metadata = serde_json::to_value(env.metadata())
                .map_err(|e| EventStoreError::Validation(format!("metadata serialization failed: {e}")))?;

            sqlx::query(
                r#"
                INSERT INTO events (
                    global_version,
                    event_id,
                    stream_id,
                    stream_type,
                    stream_version,
                    event_type,
                    schema_version,
                    payload,
                    metadata,
                    occurred_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(env.global_version() as i64)
            .bind(env.event_id())
            .bind(env.stream_id().as_str())
            .bind(env.stream_type())
            .bind(env.stream_version() as i64)
            .bind(env.event_type())
            .bind(env.schema_version() as i32)
            .bind(env.payload())
            .bind(&metadata)
            .bind(env.occurred_at())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::VersionConflict {
                        stream_id: stream_id.clone(),
                        expected,
                        actual: actual + offset,
                    }
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            committed.push(env);
        }

        let new_head = head + committed.len() as u64;
        sqlx::query("UPDATE event_sequence SET last_global_version = $1 WHERE id = 1")
            .bind(new_head as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_sequence", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("head", new_head);
        Ok(committed)
    }

    pub async fn load_stream_version(&self, stream_id: &StreamId) -> Result<StreamVersion, EventStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(stream_version), 0) AS current_version FROM events WHERE stream_id = $1",
        )
        .bind(stream_id.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_version", e))?;

        let v: i64 = row
            .try_get("current_version")
            .map_err(|e| map_sqlx_error("stream_version", e))?;
        Ok(v as u64)
    }

    pub async fn load_head(&self) -> Result<GlobalVersion, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_version), 0) AS head FROM events")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("head", e))?;

        let v: i64 = row.try_get("head").map_err(|e| map_sqlx_error("head", e))?;
        Ok(v as u64)
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    pub async fn load_stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENTS} WHERE stream_id = $1 AND stream_version >= $2 ORDER BY stream_version ASC LIMIT $3"
        ))
        .bind(stream_id.as_str())
        .bind(from_version.max(1) as i64)
        .bind(clamp_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_stream_page", e))?;

        rows.iter().map(envelope_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn load_global_page(
        &self,
        from_global_version: GlobalVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EVENTS} WHERE global_version >= $1 ORDER BY global_version ASC LIMIT $2"
        ))
        .bind(from_global_version.max(1) as i64)
        .bind(clamp_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_global", e))?;

        rows.iter().map(envelope_from_row).collect()
    }

    /// Run an async store call from the synchronous trait.
    fn block_on<F, T>(&self, fut: F) -> Result<T, EventStoreError>
    where
        F: Future<Output = Result<T, EventStoreError>>,
    {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            EventStoreError::Backend(
                "PostgresEventStore requires a multi-threaded tokio runtime".to_string(),
            )
        })?;
        tokio::task::block_in_place(|| handle.block_on(fut))
    }
}

const SELECT_EVENTS: &str = r#"
    SELECT
        global_version,
        event_id,
        stream_id,
        stream_type,
        stream_version,
        event_type,
        schema_version,
        payload,
        metadata,
        occurred_at
    FROM events
"#;

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

async fn lock_sequence(tx: &mut Transaction<'_, Postgres>) -> Result<GlobalVersion, EventStoreError> {
    let row = sqlx::query("SELECT last_global_version FROM event_sequence WHERE id = 1 FOR UPDATE")
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_sequence", e))?;
    let head: i64 = row
        .try_get("last_global_version")
        .map_err(|e| map_sqlx_error("lock_sequence", e))?;
    Ok(head as u64)
}

/// Returns `(current_version, stream_type)`; `(0, None)` for a new stream.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &StreamId,
) -> Result<(StreamVersion, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(stream_version), 0) AS current_version,
            MAX(stream_type) AS stream_type
        FROM events
        WHERE stream_id = $1
        "#,
    )
    .bind(stream_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    let stream_type: Option<String> = row
        .try_get("stream_type")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    Ok((current as u64, stream_type))
}

fn envelope_from_row(row: &sqlx::postgres::PgRow) -> Result<EventEnvelope, EventStoreError> {
    let read = |e: sqlx::Error| EventStoreError::Corrupt(format!("failed to decode event row: {e}"));

    let stream_id: String = row.try_get("stream_id").map_err(read)?;
    let stream_id = StreamId::new(stream_id)
        .map_err(|e| EventStoreError::Corrupt(format!("stored stream_id is invalid: {e}")))?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(read)?;
    let metadata: EventMetadata = serde_json::from_value(metadata)
        .map_err(|e| EventStoreError::Corrupt(format!("stored metadata is invalid: {e}")))?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at").map_err(read)?;
    let schema_version: i32 = row.try_get("schema_version").map_err(read)?;
    let stream_version: i64 = row.try_get("stream_version").map_err(read)?;
    let global_version: i64 = row.try_get("global_version").map_err(read)?;

    let pending = NewEvent {
        event_id: row.try_get("event_id").map_err(read)?,
        stream_id,
        stream_type: row.try_get("stream_type").map_err(read)?,
        event_type: row.try_get("event_type").map_err(read)?,
        schema_version: schema_version as u32,
        payload: row.try_get("payload").map_err(read)?,
        metadata,
        occurred_at,
    };
    Ok(EventEnvelope::commit(pending, stream_version as u64, global_version as u64))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::Validation(msg),
                _ => EventStoreError::Durability(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Durability(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Durability(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl EventStore for PostgresEventStore {
    fn append_batch(
        &self,
        stream_id: &StreamId,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.block_on(self.append_events(stream_id, expected, events))
    }

    fn stream_version(&self, stream_id: &StreamId) -> Result<StreamVersion, EventStoreError> {
        self.block_on(self.load_stream_version(stream_id))
    }

    fn head(&self) -> Result<GlobalVersion, EventStoreError> {
        self.block_on(self.load_head())
    }

    fn read_stream_page(
        &self,
        stream_id: &StreamId,
        from_version: StreamVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.block_on(self.load_stream_page(stream_id, from_version, limit))
    }

    fn read_global(
        &self,
        from_global_version: GlobalVersion,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        self.block_on(self.load_global_page(from_global_version, limit))
    }
}
