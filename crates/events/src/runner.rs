//! Deterministic replay of envelopes through a projection.
//!
//! Views are **disposable**; the log is the source of truth. The runner owns a
//! state and a checkpoint and guarantees that events are applied in strictly
//! increasing global order, each at most once.

use stocklens_core::GlobalVersion;
use thiserror::Error;

use crate::{EventEnvelope, EventFilter, Projection, ProjectionError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("non-monotonic global version (checkpoint={checkpoint}, found={found})")]
    NonMonotonic {
        checkpoint: GlobalVersion,
        found: GlobalVersion,
    },

    #[error(transparent)]
    Apply(#[from] ProjectionError),
}

/// Runs envelopes through a projection and tracks the checkpoint.
pub struct ProjectionRunner<'p, P>
where
    P: Projection,
{
    projection: &'p P,
    interest: EventFilter,
    state: P::State,
    checkpoint: GlobalVersion,
}

impl<'p, P> ProjectionRunner<'p, P>
where
    P: Projection,
{
    /// Start from the projection's zero value at checkpoint 0.
    pub fn new(projection: &'p P) -> Self {
        let state = projection.initial_state();
        Self::resume(projection, state, 0)
    }

    /// Continue from a previously committed state and checkpoint.
    pub fn resume(projection: &'p P, state: P::State, checkpoint: GlobalVersion) -> Self {
        Self {
            projection,
            interest: projection.interest(),
            state,
            checkpoint,
        }
    }

    pub fn state(&self) -> &P::State {
        &self.state
    }

    pub fn checkpoint(&self) -> GlobalVersion {
        self.checkpoint
    }

    pub fn into_parts(self) -> (P::State, GlobalVersion) {
        (self.state, self.checkpoint)
    }

    /// Apply one envelope.
    ///
    /// Non-matching events only move the checkpoint. On error the checkpoint is
    /// left where it was, the state may be partially updated; callers that need
    /// all-or-nothing semantics run the runner on a copy.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), RunnerError> {
        let found = envelope.global_version();
        if found <= self.checkpoint {
            return Err(RunnerError::NonMonotonic {
                checkpoint: self.checkpoint,
                found,
            });
        }

        if self.interest.matches(envelope) {
            self.projection.apply(&mut self.state, envelope)?;
        }
        self.checkpoint = found;
        Ok(())
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<(), RunnerError> {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Rebuild a view from scratch by replaying the full history.
    pub fn rebuild_from_scratch<'a>(
        projection: &'p P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<(P::State, GlobalVersion), RunnerError> {
        let mut runner = ProjectionRunner::new(projection);
        runner.run(envelopes)?;
        Ok(runner.into_parts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewEvent;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use stocklens_core::StreamId;

    /// Sums `amount` per stream for `portfolio` streams.
    struct Totals;

    impl Projection for Totals {
        type State = BTreeMap<String, i64>;

        fn name(&self) -> &str {
            "totals"
        }

        fn interest(&self) -> EventFilter {
            EventFilter::stream_type("portfolio")
        }

        fn initial_state(&self) -> Self::State {
            BTreeMap::new()
        }

        fn apply(&self, state: &mut Self::State, event: &EventEnvelope) -> Result<(), ProjectionError> {
            let amount = event.payload()["amount"]
                .as_i64()
                .ok_or_else(|| ProjectionError::rejected(event, "missing amount"))?;
            *state.entry(event.stream_id().to_string()).or_default() += amount;
            Ok(())
        }
    }

    fn env(global: u64, stream_type: &str, amount: i64) -> EventEnvelope {
        let stream = StreamId::new(format!("s-{}", global % 3)).unwrap();
        EventEnvelope::commit(
            NewEvent::new(stream, stream_type, "Moved", json!({ "amount": amount })),
            global,
            global,
        )
    }

    #[test]
    fn skips_uninteresting_events_but_advances_checkpoint() {
        let history = vec![env(1, "portfolio", 5), env(2, "quote", 100), env(3, "portfolio", 2)];
        let (state, checkpoint) = ProjectionRunner::rebuild_from_scratch(&Totals, &history).unwrap();

        assert_eq!(checkpoint, 3);
        assert_eq!(state.values().sum::<i64>(), 7);
    }

    #[test]
    fn rejects_replayed_or_out_of_order_events() {
        let mut runner = ProjectionRunner::new(&Totals);
        runner.apply(&env(2, "portfolio", 1)).unwrap();

        let err = runner.apply(&env(2, "portfolio", 1)).unwrap_err();
        assert_eq!(err, RunnerError::NonMonotonic { checkpoint: 2, found: 2 });
        assert!(runner.apply(&env(1, "portfolio", 1)).is_err());
        assert_eq!(runner.checkpoint(), 2);
    }

    #[test]
    fn apply_error_keeps_checkpoint() {
        let bad = EventEnvelope::commit(
            NewEvent::new(StreamId::new("s-1").unwrap(), "portfolio", "Moved", json!({})),
            1,
            1,
        );
        let mut runner = ProjectionRunner::new(&Totals);
        assert!(matches!(runner.apply(&bad), Err(RunnerError::Apply(_))));
        assert_eq!(runner.checkpoint(), 0);
    }

    proptest! {
        /// Replaying the same history twice yields byte-identical state.
        #[test]
        fn replay_is_deterministic(amounts in prop::collection::vec(-1_000i64..1_000, 0..64)) {
            let history: Vec<_> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| env(i as u64 + 1, if i % 4 == 0 { "quote" } else { "portfolio" }, *a))
                .collect();

            let (a, ca) = ProjectionRunner::rebuild_from_scratch(&Totals, &history).unwrap();
            let (b, cb) = ProjectionRunner::rebuild_from_scratch(&Totals, &history).unwrap();

            prop_assert_eq!(ca, cb);
            prop_assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
        }
    }
}
