//! Infrastructure layer: event store backends, projection engine, router,
//! ingestion, query cache and the assembled [`platform::EventCore`].

pub mod config;
pub mod event_store;
pub mod health;
pub mod ingest;
pub mod platform;
pub mod projections;
pub mod query_cache;
pub mod router;
pub mod snapshot;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, CoreConfig};
pub use platform::{EventCore, PlatformError};
