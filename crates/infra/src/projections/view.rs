//! Type-erased view cells owned by the engine.
//!
//! A cell pairs one projection with its committed state. Two locks per cell:
//! `apply` is held by whoever is currently feeding the view (rebuild or catch-up)
//! and makes it the sole mutator; `committed` guards the published state and is
//! only write-locked for the instant a finished batch is swapped in.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use stocklens_core::GlobalVersion;
use stocklens_events::{
    EventEnvelope, EventFilter, Projection, ProjectionError, ProjectionRunner, QueryParams, RunnerError,
};

use super::engine::{EngineError, QueryError, QueryResult};
use super::registry::RefreshMode;

/// Projection lifecycle.
///
/// `Uninitialized → Rebuilding → Live ⇄ Stale → Rebuilding`; a Stale view only
/// comes back through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    Uninitialized,
    Rebuilding,
    Live,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ViewMeta {
    pub status: ViewStatus,
    pub checkpoint: GlobalVersion,
    pub last_error: Option<String>,
}

struct Committed<S> {
    state: S,
    meta: ViewMeta,
}

pub(crate) trait ManagedView: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> RefreshMode;

    fn interest(&self) -> &EventFilter;

    /// Exclusive right to mutate the view.
    fn lock_apply(&self) -> Result<MutexGuard<'_, ()>, EngineError>;

    fn meta(&self) -> Result<ViewMeta, EngineError>;

    /// Zero state, checkpoint 0, status `Rebuilding`.
    fn begin_rebuild(&self) -> Result<(), EngineError>;

    fn set_status(&self, status: ViewStatus, error: Option<String>) -> Result<(), EngineError>;

    /// Apply a batch to a working copy and publish it only if every event applied.
    ///
    /// Returns the new checkpoint. Panics inside `apply` are contained and reported
    /// as an apply failure.
    fn apply_batch(&self, batch: &[EventEnvelope]) -> Result<GlobalVersion, EngineError>;

    fn query(&self, params: &QueryParams) -> Result<QueryResult, QueryError>;

    fn state_bytes(&self) -> Result<Vec<u8>, EngineError>;
}

pub(crate) struct ViewCell<P: Projection> {
    name: String,
    projection: P,
    interest: EventFilter,
    mode: RefreshMode,
    apply: Mutex<()>,
    committed: RwLock<Committed<P::State>>,
}

impl<P: Projection> ViewCell<P> {
    pub(crate) fn new(projection: P, mode: RefreshMode) -> Self {
        let state = projection.initial_state();
        Self {
            name: projection.name().to_string(),
            interest: projection.interest(),
            projection,
            mode,
            apply: Mutex::new(()),
            committed: RwLock::new(Committed {
                state,
                meta: ViewMeta {
                    status: ViewStatus::Uninitialized,
                    checkpoint: 0,
                    last_error: None,
                },
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Committed<P::State>>, EngineError> {
        self.committed
            .read()
            .map_err(|_| EngineError::Poisoned(self.name.clone()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Committed<P::State>>, EngineError> {
        self.committed
            .write()
            .map_err(|_| EngineError::Poisoned(self.name.clone()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<P: Projection> ManagedView for ViewCell<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> RefreshMode {
        self.mode
    }

    fn interest(&self) -> &EventFilter {
        &self.interest
    }

    fn lock_apply(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.apply
            .lock()
            .map_err(|_| EngineError::Poisoned(self.name.clone()))
    }

    fn meta(&self) -> Result<ViewMeta, EngineError> {
        Ok(self.read()?.meta.clone())
    }

    fn begin_rebuild(&self) -> Result<(), EngineError> {
        let mut committed = self.write()?;
        committed.state = self.projection.initial_state();
        committed.meta = ViewMeta {
            status: ViewStatus::Rebuilding,
            checkpoint: 0,
            last_error: None,
        };
        Ok(())
    }

    fn set_status(&self, status: ViewStatus, error: Option<String>) -> Result<(), EngineError> {
        let mut committed = self.write()?;
        committed.meta.status = status;
        committed.meta.last_error = error;
        Ok(())
    }

    fn apply_batch(&self, batch: &[EventEnvelope]) -> Result<GlobalVersion, EngineError> {
        let (state, checkpoint) = {
            let committed = self.read()?;
            (committed.state.clone(), committed.meta.checkpoint)
        };
        if batch.is_empty() {
            return Ok(checkpoint);
        }

        let mut runner = ProjectionRunner::resume(&self.projection, state, checkpoint);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(batch)));

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => {
                let reached = runner.checkpoint();
                let global_version = batch
                    .iter()
                    .map(EventEnvelope::global_version)
                    .find(|g| *g > reached)
                    .unwrap_or(reached + 1);
                Some(RunnerError::Apply(ProjectionError::Panicked {
                    global_version,
                    message: panic_message(payload.as_ref()),
                }))
            }
        };
        if let Some(source) = failure {
            return Err(EngineError::Apply {
                view: self.name.clone(),
                source,
            });
        }

        let (state, checkpoint) = runner.into_parts();
        let mut committed = self.write()?;
        committed.state = state;
        committed.meta.checkpoint = checkpoint;
        Ok(checkpoint)
    }

    fn query(&self, params: &QueryParams) -> Result<QueryResult, QueryError> {
        let committed = self
            .committed
            .read()
            .map_err(|_| QueryError::Poisoned(self.name.clone()))?;

        match committed.meta.status {
            ViewStatus::Live => {
                let value = self
                    .projection
                    .query(&committed.state, params)
                    .map_err(|source| QueryError::Projection {
                        view: self.name.clone(),
                        source,
                    })?;
                Ok(QueryResult {
                    value,
                    checkpoint: committed.meta.checkpoint,
                })
            }
            ViewStatus::Stale => Err(QueryError::ViewStale {
                view: self.name.clone(),
                checkpoint: committed.meta.checkpoint,
            }),
            status @ (ViewStatus::Uninitialized | ViewStatus::Rebuilding) => Err(QueryError::ViewNotReady {
                view: self.name.clone(),
                status,
            }),
        }
    }

    fn state_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let committed = self.read()?;
        serde_json::to_vec(&committed.state).map_err(|e| EngineError::State {
            view: self.name.clone(),
            reason: e.to_string(),
        })
    }
}
