//! Projection engine and projection implementations (read model builders).
//!
//! Projections consume committed events and build query-optimized views.
//! All projections are:
//! - **Rebuildable**: reconstructed from the global log at any time
//! - **Deterministic**: same history, byte-identical state
//! - **Isolated**: a failing view goes Stale without touching the others

pub mod engine;
pub mod registry;
pub mod view;

// Sample views
pub mod portfolio_holdings;
pub mod stream_activity;

pub use engine::{
    Cancellation, CheckpointListener, DEFAULT_BATCH_SIZE, EngineError, ProjectionEngine, QueryError,
    QueryResult, RebuildOutcome, ViewDescription,
};
pub use registry::{ProjectionRegistry, RefreshMode};
pub use view::ViewStatus;

pub use portfolio_holdings::{HoldingsState, HoldingsView, PortfolioHoldingsProjection};
pub use stream_activity::{ActivityCounts, ActivityState, StreamActivityProjection};
