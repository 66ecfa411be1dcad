//! Projection engine: rebuild, catch-up, lifecycle and queries for every view.
//!
//! Views are **disposable**; the log is the source of truth. Each view is fed by
//! exactly one caller at a time (its apply lock); different views never share a
//! lock and progress independently, so a failing view cannot hold back the others.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stocklens_core::GlobalVersion;
use stocklens_events::{ProjectionError, QueryParams, RunnerError};

use crate::event_store::{EventStoreError, SharedEventStore};

use super::registry::{ProjectionRegistry, RefreshMode};
use super::view::{ManagedView, ViewStatus};

pub const DEFAULT_BATCH_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("view not found: {0}")]
    ViewNotFound(String),

    #[error("duplicate view name: {0}")]
    DuplicateView(String),

    #[error("view {view} cannot {action} while {status:?}")]
    InvalidTransition {
        view: String,
        status: ViewStatus,
        action: &'static str,
    },

    #[error("view {view} failed to apply events: {source}")]
    Apply {
        view: String,
        #[source]
        source: RunnerError,
    },

    #[error("view {view} state could not be serialized: {reason}")]
    State { view: String, reason: String },

    #[error("view {0} lock poisoned")]
    Poisoned(String),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl EngineError {
    pub fn is_apply(&self) -> bool {
        matches!(self, EngineError::Apply { .. })
    }
}

/// Why a query could not be answered.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("view not found: {0}")]
    ViewNotFound(String),

    #[error("view {view} is stale at checkpoint {checkpoint}")]
    ViewStale { view: String, checkpoint: GlobalVersion },

    #[error("view {view} is not ready ({status:?})")]
    ViewNotReady { view: String, status: ViewStatus },

    #[error("view {view} rejected the query: {source}")]
    Projection {
        view: String,
        #[source]
        source: ProjectionError,
    },

    #[error("view {0} lock poisoned")]
    Poisoned(String),
}

/// A query answer tagged with the checkpoint it was computed at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub value: JsonValue,
    pub checkpoint: GlobalVersion,
}

/// Cooperative cancellation signal, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RebuildOutcome {
    Completed { checkpoint: GlobalVersion },
    /// Progress up to `checkpoint` is kept; the view stays `Rebuilding`.
    Cancelled { checkpoint: GlobalVersion },
}

/// Observer of view progress (the query cache is one).
pub trait CheckpointListener: Send + Sync {
    fn checkpoint_advanced(&self, view: &str, checkpoint: GlobalVersion);

    /// The view's state was discarded (rebuild started).
    fn view_reset(&self, view: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewDescription {
    pub name: String,
    pub mode: RefreshMode,
    pub status: ViewStatus,
    pub checkpoint: GlobalVersion,
    /// `head - checkpoint`.
    pub lag: u64,
    pub last_error: Option<String>,
}

pub struct ProjectionEngine {
    store: SharedEventStore,
    views: Vec<Arc<dyn ManagedView>>,
    batch_size: usize,
    listeners: RwLock<Vec<Arc<dyn CheckpointListener>>>,
    halted: Cancellation,
}

impl ProjectionEngine {
    pub fn new(store: SharedEventStore, registry: ProjectionRegistry, batch_size: usize) -> Self {
        Self {
            store,
            views: registry.into_views(),
            batch_size: batch_size.max(1),
            listeners: RwLock::new(Vec::new()),
            halted: Cancellation::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn add_listener(&self, listener: Arc<dyn CheckpointListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    /// Stop catch-up loops at their next batch boundary.
    pub fn halt(&self) {
        self.halted.cancel();
    }

    pub fn view_names(&self) -> Vec<String> {
        self.views.iter().map(|v| v.name().to_string()).collect()
    }

    pub fn views_with_mode(&self, mode: RefreshMode) -> Vec<String> {
        self.views
            .iter()
            .filter(|v| v.mode() == mode)
            .map(|v| v.name().to_string())
            .collect()
    }

    fn find(&self, view: &str) -> Result<&Arc<dyn ManagedView>, EngineError> {
        self.views
            .iter()
            .find(|v| v.name() == view)
            .ok_or_else(|| EngineError::ViewNotFound(view.to_string()))
    }

    fn notify_advanced(&self, view: &str, checkpoint: GlobalVersion) {
        if let Ok(listeners) = self.listeners.read() {
            for l in listeners.iter() {
                l.checkpoint_advanced(view, checkpoint);
            }
        }
    }

    fn notify_reset(&self, view: &str) {
        if let Ok(listeners) = self.listeners.read() {
            for l in listeners.iter() {
                l.view_reset(view);
            }
        }
    }

    fn mark_stale(&self, cell: &dyn ManagedView, err: &EngineError) {
        error!(view = cell.name(), error = %err, alert = true, "projection apply failed, view marked stale");
        if let Err(e) = cell.set_status(ViewStatus::Stale, Some(err.to_string())) {
            warn!(view = cell.name(), error = %e, "could not record stale status");
        }
    }

    /// Rebuild a view from scratch: zero state, replay up to the head captured now.
    pub fn rebuild(&self, view: &str, cancel: &Cancellation) -> Result<RebuildOutcome, EngineError> {
        let cell = self.find(view)?;
        let _apply = cell.lock_apply()?;

        cell.begin_rebuild()?;
        self.notify_reset(view);
        info!(view, "projection rebuild started");
        self.replay_to_head(cell.as_ref(), cancel)
    }

    /// Continue a cancelled rebuild from its last committed batch.
    pub fn resume_rebuild(&self, view: &str, cancel: &Cancellation) -> Result<RebuildOutcome, EngineError> {
        let cell = self.find(view)?;
        let _apply = cell.lock_apply()?;

        let meta = cell.meta()?;
        if meta.status != ViewStatus::Rebuilding {
            return Err(EngineError::InvalidTransition {
                view: view.to_string(),
                status: meta.status,
                action: "resume rebuild",
            });
        }
        info!(view, checkpoint = meta.checkpoint, "projection rebuild resumed");
        self.replay_to_head(cell.as_ref(), cancel)
    }

    fn replay_to_head(&self, cell: &dyn ManagedView, cancel: &Cancellation) -> Result<RebuildOutcome, EngineError> {
        let target = self.store.head()?;

        loop {
            let checkpoint = cell.meta()?.checkpoint;
            if checkpoint >= target {
                break;
            }
            if cancel.is_cancelled() {
                info!(view = cell.name(), checkpoint, "projection rebuild cancelled");
                return Ok(RebuildOutcome::Cancelled { checkpoint });
            }

            let limit = self.batch_size.min((target - checkpoint) as usize);
            let batch = self.store.read_global(checkpoint + 1, limit)?;
            if batch.is_empty() {
                break;
            }

            match cell.apply_batch(&batch) {
                Ok(advanced) => self.notify_advanced(cell.name(), advanced),
                Err(err) => {
                    self.mark_stale(cell, &err);
                    return Err(err);
                }
            }
        }

        cell.set_status(ViewStatus::Live, None)?;
        let checkpoint = cell.meta()?.checkpoint;
        info!(view = cell.name(), checkpoint, "projection rebuild completed");
        Ok(RebuildOutcome::Completed { checkpoint })
    }

    /// Rebuild every view in registration order.
    ///
    /// A view whose apply fails is left Stale and skipped; store failures abort.
    pub fn rebuild_all(&self, cancel: &Cancellation) -> Result<Vec<(String, RebuildOutcome)>, EngineError> {
        let mut outcomes = Vec::with_capacity(self.views.len());
        for cell in &self.views {
            if cancel.is_cancelled() {
                break;
            }
            match self.rebuild(cell.name(), cancel) {
                Ok(outcome) => outcomes.push((cell.name().to_string(), outcome)),
                Err(err) if err.is_apply() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    /// Bring every `Uninitialized` view up (startup).
    pub fn initialize(&self) -> Result<(), EngineError> {
        for cell in &self.views {
            if cell.meta()?.status != ViewStatus::Uninitialized {
                continue;
            }
            match self.rebuild(cell.name(), &Cancellation::new()) {
                Ok(_) => {}
                Err(err) if err.is_apply() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Consume everything after the view's checkpoint.
    ///
    /// Only `Live` views advance; others return their checkpoint untouched.
    pub fn catch_up(&self, view: &str) -> Result<GlobalVersion, EngineError> {
        let cell = self.find(view)?;
        let _apply = cell.lock_apply()?;

        let meta = cell.meta()?;
        if meta.status != ViewStatus::Live {
            return Ok(meta.checkpoint);
        }

        let mut checkpoint = meta.checkpoint;
        while !self.halted.is_cancelled() {
            let batch = self.store.read_global(checkpoint + 1, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == self.batch_size;

            match cell.apply_batch(&batch) {
                Ok(advanced) => {
                    checkpoint = advanced;
                    self.notify_advanced(view, advanced);
                }
                Err(err) => {
                    self.mark_stale(cell.as_ref(), &err);
                    return Err(err);
                }
            }
            if !full {
                break;
            }
        }

        debug!(view, checkpoint, "projection caught up");
        Ok(checkpoint)
    }

    fn catch_up_mode(&self, mode: RefreshMode) -> Result<(), EngineError> {
        for cell in self.views.iter().filter(|v| v.mode() == mode) {
            match self.catch_up(cell.name()) {
                Ok(_) => {}
                // Already logged and recorded on the view.
                Err(err) if err.is_apply() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn catch_up_synchronous(&self) -> Result<(), EngineError> {
        self.catch_up_mode(RefreshMode::Synchronous)
    }

    pub fn catch_up_asynchronous(&self) -> Result<(), EngineError> {
        self.catch_up_mode(RefreshMode::Asynchronous)
    }

    /// Operator recovery: rebuild a Stale (or Live) view from scratch.
    pub fn reset(&self, view: &str) -> Result<RebuildOutcome, EngineError> {
        let status = self.status(view)?;
        match status {
            ViewStatus::Stale | ViewStatus::Live => {
                warn!(view, ?status, "projection reset requested");
                self.rebuild(view, &Cancellation::new())
            }
            ViewStatus::Uninitialized | ViewStatus::Rebuilding => Err(EngineError::InvalidTransition {
                view: view.to_string(),
                status,
                action: "reset",
            }),
        }
    }

    pub fn status(&self, view: &str) -> Result<ViewStatus, EngineError> {
        Ok(self.find(view)?.meta()?.status)
    }

    pub fn checkpoint(&self, view: &str) -> Result<GlobalVersion, EngineError> {
        Ok(self.find(view)?.meta()?.checkpoint)
    }

    pub fn describe(&self) -> Result<Vec<ViewDescription>, EngineError> {
        let head = self.store.head()?;
        self.views
            .iter()
            .map(|cell| {
                let meta = cell.meta()?;
                Ok(ViewDescription {
                    name: cell.name().to_string(),
                    mode: cell.mode(),
                    status: meta.status,
                    checkpoint: meta.checkpoint,
                    lag: head.saturating_sub(meta.checkpoint),
                    last_error: meta.last_error,
                })
            })
            .collect()
    }

    pub fn query(&self, view: &str, params: &QueryParams) -> Result<QueryResult, QueryError> {
        let cell = self
            .views
            .iter()
            .find(|v| v.name() == view)
            .ok_or_else(|| QueryError::ViewNotFound(view.to_string()))?;
        cell.query(params)
    }

    /// Canonical serialized state, for determinism checks.
    pub fn state_bytes(&self, view: &str) -> Result<Vec<u8>, EngineError> {
        self.find(view)?.state_bytes()
    }
}

impl core::fmt::Debug for ProjectionEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("views", &self.view_names())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
