use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use stocklens_events::{BusSubscription, CommitNotice};

use super::WorkerHandle;
use crate::projections::ProjectionEngine;

/// Catch-up worker for one asynchronous view.
///
/// - Woken by commit notices; queued notices collapse into one catch-up
/// - Also catches up on every tick, so a lost notice only delays the view
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread feeding `view` from the engine's store.
    pub fn spawn(
        engine: Arc<ProjectionEngine>,
        view: String,
        notices: BusSubscription<CommitNotice>,
        tick: Duration,
    ) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("projection-{view}");

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&engine, &view, notices, shutdown_rx, tick))?;

        let stop = move || {
            let _ = shutdown_tx.send(());
        };
        Ok(WorkerHandle::new(name, stop, join))
    }
}

fn worker_loop(
    engine: &ProjectionEngine,
    view: &str,
    notices: BusSubscription<CommitNotice>,
    shutdown_rx: mpsc::Receiver<()>,
    tick: Duration,
) {
    // Initial pass: pick up anything committed before the worker started.
    catch_up(engine, view);

    loop {
        // Shutdown check (non-blocking)
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match notices.recv_timeout(tick) {
            Ok(notice) => {
                let head = notices.drain_latest().unwrap_or(notice).head;
                debug!(view, head, "commit notice received");
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Bus gone: keep polling on the tick until told to stop.
            Err(RecvTimeoutError::Disconnected) => match shutdown_rx.recv_timeout(tick) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            },
        }

        catch_up(engine, view);
    }
}

fn catch_up(engine: &ProjectionEngine, view: &str) {
    if let Err(err) = engine.catch_up(view) {
        // Apply failures are already reported by the engine with the view marked stale.
        if !err.is_apply() {
            warn!(worker = view, error = %err, "projection catch-up failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventStore, InMemoryEventStore, PublishingEventStore};
    use crate::projections::{ProjectionRegistry, RefreshMode, StreamActivityProjection};
    use serde_json::json;
    use std::time::Instant;
    use stocklens_core::{ExpectedVersion, StreamId};
    use stocklens_events::{EventBus, InMemoryEventBus, NewEvent};

    #[test]
    fn worker_catches_up_after_commit_notice() {
        let bus = Arc::new(InMemoryEventBus::<CommitNotice>::new());
        let store = Arc::new(PublishingEventStore::new(InMemoryEventStore::new(), bus.clone()));

        let mut registry = ProjectionRegistry::new();
        registry
            .register_with_mode(StreamActivityProjection, RefreshMode::Asynchronous)
            .unwrap();
        let engine = Arc::new(ProjectionEngine::new(store.clone(), registry, 16));
        engine.initialize().unwrap();

        let worker = ProjectionWorker::spawn(
            engine.clone(),
            StreamActivityProjection::NAME.to_string(),
            bus.subscribe(),
            Duration::from_secs(5),
        )
        .unwrap();

        let id = StreamId::new("p-1").unwrap();
        store
            .append(NewEvent::new(id, "portfolio", "E", json!({})), ExpectedVersion::NEW_STREAM)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.checkpoint(StreamActivityProjection::NAME).unwrap() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.checkpoint(StreamActivityProjection::NAME).unwrap(), 1);

        worker.shutdown();
    }
}
