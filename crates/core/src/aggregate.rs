//! Aggregate traits and the optimistic concurrency expectation.

use crate::error::{DomainError, DomainResult};

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of stream events folded into this state (the stream version).
    fn version(&self) -> u64;
}

/// Expected stream version for an append.
///
/// The expectation is always exact: a new stream is expected at version 0, an
/// existing one at its highest `stream_version`. There is no "any version" escape
/// hatch; this comparison is the only optimistic-concurrency gate of the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpectedVersion(u64);

impl ExpectedVersion {
    /// Expect the stream not to exist yet.
    pub const NEW_STREAM: ExpectedVersion = ExpectedVersion(0);

    pub fn exact(version: u64) -> Self {
        Self(version)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Expectation for the `offset`-th event after this one in the same batch.
    ///
    /// `None` when the version would not fit in a `u64`.
    pub fn advanced_by(self, offset: u64) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {}, actual: {actual})",
                self.0
            )))
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single event (+1 version per event).
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_is_exact() {
        assert!(ExpectedVersion::NEW_STREAM.matches(0));
        assert!(!ExpectedVersion::NEW_STREAM.matches(1));
        assert!(ExpectedVersion::exact(3).check(3).is_ok());
        assert!(matches!(
            ExpectedVersion::exact(2).check(3),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn advanced_by_offsets_within_a_batch() {
        let base = ExpectedVersion::exact(4);
        assert_eq!(base.advanced_by(0), Some(base));
        assert_eq!(base.advanced_by(2).map(ExpectedVersion::value), Some(6));
    }

    #[test]
    fn advanced_by_past_u64_max_is_none() {
        assert_eq!(ExpectedVersion::exact(u64::MAX).advanced_by(0), Some(ExpectedVersion::exact(u64::MAX)));
        assert_eq!(ExpectedVersion::exact(u64::MAX).advanced_by(1), None);
    }
}
