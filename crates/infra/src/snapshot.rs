//! Aggregate snapshots: a shortcut for rehydration, never a source of truth.
//!
//! A snapshot at version *N* must equal replaying the stream's events `1..=N`.
//! Snapshots are only ever added; a newer one supersedes older ones.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use stocklens_core::{Aggregate, StreamId, StreamVersion};
use stocklens_events::{DecodeError, DecodeEvent};

use crate::event_store::read::{DEFAULT_PAGE_SIZE, StreamReader};
use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    pub stream_type: String,
    /// Stream version the state reflects.
    pub version: StreamVersion,
    pub state: JsonValue,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot for {stream_id} at version {attempted} does not supersede version {latest}")]
    NotNewer {
        stream_id: StreamId,
        latest: StreamVersion,
        attempted: StreamVersion,
    },

    #[error("aggregate state (de)serialization failed: {0}")]
    State(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("stream {stream_id} has event type {event_type} at version {stream_version} the aggregate does not know")]
    UnknownEvent {
        stream_id: StreamId,
        event_type: String,
        stream_version: StreamVersion,
    },

    #[error("rehydrated {stream_id} reached version {reached}, stream event was {stream_version}")]
    VersionDrift {
        stream_id: StreamId,
        reached: u64,
        stream_version: StreamVersion,
    },

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("snapshot store lock poisoned")]
    Poisoned,
}

pub trait SnapshotStore: Send + Sync {
    /// Add a snapshot; it must be newer than the latest one for its stream.
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError>;

    fn latest(&self, stream_id: &StreamId) -> Result<Option<Snapshot>, SnapshotError>;
}

/// Keeps every snapshot ever taken, per stream, in version order.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<StreamId, Vec<Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self, stream_id: &StreamId) -> Result<Vec<StreamVersion>, SnapshotError> {
        let snapshots = self.snapshots.read().map_err(|_| SnapshotError::Poisoned)?;
        Ok(snapshots
            .get(stream_id)
            .map(|all| all.iter().map(|s| s.version).collect())
            .unwrap_or_default())
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        let mut snapshots = self.snapshots.write().map_err(|_| SnapshotError::Poisoned)?;
        let history = snapshots.entry(snapshot.stream_id.clone()).or_default();
        if let Some(latest) = history.last() {
            if snapshot.version <= latest.version {
                return Err(SnapshotError::NotNewer {
                    stream_id: snapshot.stream_id,
                    latest: latest.version,
                    attempted: snapshot.version,
                });
            }
        }
        history.push(snapshot);
        Ok(())
    }

    fn latest(&self, stream_id: &StreamId) -> Result<Option<Snapshot>, SnapshotError> {
        let snapshots = self.snapshots.read().map_err(|_| SnapshotError::Poisoned)?;
        Ok(snapshots.get(stream_id).and_then(|all| all.last().cloned()))
    }
}

/// Capture an aggregate's current state.
pub fn take_snapshot<A>(aggregate: &A, stream_id: &StreamId, stream_type: &str) -> Result<Snapshot, SnapshotError>
where
    A: Aggregate + Serialize,
{
    Ok(Snapshot {
        stream_id: stream_id.clone(),
        stream_type: stream_type.to_string(),
        version: aggregate.version(),
        state: serde_json::to_value(aggregate)?,
        taken_at: Utc::now(),
    })
}

/// Rehydrate an aggregate: start from the latest snapshot (or `make()`), then
/// apply the rest of its stream.
pub fn load_aggregate<A, S>(
    store: &S,
    snapshots: &dyn SnapshotStore,
    stream_id: &StreamId,
    make: impl FnOnce() -> A,
) -> Result<A, SnapshotError>
where
    A: Aggregate + DeserializeOwned,
    A::Event: DecodeEvent,
    S: EventStore + ?Sized,
{
    let mut aggregate = match snapshots.latest(stream_id)? {
        Some(snapshot) => {
            debug!(stream_id = %stream_id, version = snapshot.version, "rehydrating from snapshot");
            serde_json::from_value::<A>(snapshot.state)?
        }
        None => make(),
    };

    let from = aggregate.version() + 1;
    for env in StreamReader::new(store, stream_id.clone(), from, DEFAULT_PAGE_SIZE) {
        let env = env?;
        let event = A::Event::decode_envelope(&env)?.ok_or_else(|| SnapshotError::UnknownEvent {
            stream_id: stream_id.clone(),
            event_type: env.event_type().to_string(),
            stream_version: env.stream_version(),
        })?;
        aggregate.apply(&event);
        if aggregate.version() != env.stream_version() {
            return Err(SnapshotError::VersionDrift {
                stream_id: stream_id.clone(),
                reached: aggregate.version(),
                stream_version: env.stream_version(),
            });
        }
    }
    Ok(aggregate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use chrono::TimeZone;
    use serde_json::json;
    use stocklens_core::ExpectedVersion;
    use stocklens_events::NewEvent;
    use stocklens_portfolio::{
        CashDeposited, Portfolio, PortfolioCreated, PortfolioEvent, PortfolioId, STREAM_TYPE, TradeExecuted, TradeSide,
    };

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 14, 30, 0).unwrap()
    }

    fn record(store: &InMemoryEventStore, id: &PortfolioId, events: &[PortfolioEvent]) {
        for e in events {
            let v = store.stream_version(id.stream_id()).unwrap();
            store
                .append(e.to_new_event(id).unwrap(), ExpectedVersion::exact(v))
                .unwrap();
        }
    }

    fn history() -> Vec<PortfolioEvent> {
        vec![
            PortfolioEvent::PortfolioCreated(PortfolioCreated {
                owner: "ana".into(),
                occurred_at: at(),
            }),
            PortfolioEvent::CashDeposited(CashDeposited {
                amount_cents: 50_000,
                occurred_at: at(),
            }),
            PortfolioEvent::TradeExecuted(TradeExecuted {
                symbol: "ACME".into(),
                side: TradeSide::Buy,
                quantity: 4,
                price_cents: 2_500,
                occurred_at: at(),
            }),
        ]
    }

    #[test]
    fn snapshot_plus_tail_equals_full_replay() {
        let store = InMemoryEventStore::new();
        let snapshots = InMemorySnapshotStore::new();
        let id = PortfolioId::parse("portfolio-1").unwrap();
        let events = history();

        record(&store, &id, &events[..2]);
        let mid = load_aggregate(&store, &snapshots, id.stream_id(), || Portfolio::empty(id.clone())).unwrap();
        snapshots.save(take_snapshot(&mid, id.stream_id(), STREAM_TYPE).unwrap()).unwrap();

        record(&store, &id, &events[2..]);
        let from_snapshot =
            load_aggregate(&store, &snapshots, id.stream_id(), || Portfolio::empty(id.clone())).unwrap();
        let from_scratch = load_aggregate(
            &store,
            &InMemorySnapshotStore::new(),
            id.stream_id(),
            || Portfolio::empty(id.clone()),
        )
        .unwrap();

        assert_eq!(from_snapshot, from_scratch);
        assert_eq!(from_snapshot.cash_cents(), 40_000);
        assert_eq!(from_snapshot.position("ACME"), 4);
        assert_eq!(snapshots.versions(id.stream_id()).unwrap(), vec![2]);
    }

    #[test]
    fn older_snapshot_does_not_supersede() {
        let snapshots = InMemorySnapshotStore::new();
        let id = StreamId::new("portfolio-1").unwrap();
        let snap = |version| Snapshot {
            stream_id: id.clone(),
            stream_type: STREAM_TYPE.into(),
            version,
            state: json!({}),
            taken_at: at(),
        };

        snapshots.save(snap(5)).unwrap();
        assert!(matches!(snapshots.save(snap(5)), Err(SnapshotError::NotNewer { latest: 5, .. })));
        assert!(snapshots.save(snap(3)).is_err());
        snapshots.save(snap(8)).unwrap();
        assert_eq!(snapshots.latest(&id).unwrap().map(|s| s.version), Some(8));
    }

    #[test]
    fn unknown_event_in_aggregate_stream_is_an_error() {
        let store = InMemoryEventStore::new();
        let id = PortfolioId::parse("portfolio-1").unwrap();
        record(&store, &id, &history()[..1]);
        let odd = NewEvent::new(id.stream_id().clone(), STREAM_TYPE, "Mystery", json!({}));
        store.append(odd, ExpectedVersion::exact(1)).unwrap();

        let err = load_aggregate(&store, &InMemorySnapshotStore::new(), id.stream_id(), || {
            Portfolio::empty(id.clone())
        })
        .unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownEvent { stream_version: 2, .. }));
    }
}
