//! Foundation building blocks for the event core.
//!
//! This crate contains **pure** primitives (no storage, no threads, no IO).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{CausationId, ConsumerId, CorrelationId, ProducerId, StreamId};

/// Position of an event inside its own stream (1-based).
pub type StreamVersion = u64;

/// Store-wide position of an event (1-based, gap-free).
pub type GlobalVersion = u64;
