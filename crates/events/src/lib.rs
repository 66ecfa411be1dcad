//! Event mechanics shared by the store, projections and router.
//!
//! Nothing in here performs IO: envelopes, typed event traits, filters, the
//! projection contract and the notification bus abstraction.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod filter;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::{BusSubscription, CommitNotice, EventBus};
pub use envelope::{EventEnvelope, EventMetadata, NewEvent};
pub use event::{DecodeError, DecodeEvent, Event};
pub use filter::{EventFilter, Pattern};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::{Projection, ProjectionError, QueryParams};
pub use runner::{ProjectionRunner, RunnerError};
