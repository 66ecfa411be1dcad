//! Background worker threads (projection catch-up, subscription delivery).

pub mod projection_worker;

use std::thread;

pub use projection_worker::ProjectionWorker;

type StopFn = Box<dyn FnOnce() + Send>;

/// Handle to control and join a background worker.
pub struct WorkerHandle {
    name: String,
    stop: Option<StopFn>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// `stop` asks the worker to finish; it runs once, on `shutdown`.
    pub(crate) fn new(
        name: String,
        stop: impl FnOnce() + Send + 'static,
        join: thread::JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            stop: Some(Box::new(stop)),
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl core::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
