//! Redelivery budget for a subscription and the dead-letter record it leaves behind.
//!
//! A subscription delivers one event at a time, so a failing event blocks its
//! consumer. Each failure doubles the wait before the next delivery of the same
//! event, up to `max_delay`. After `max_attempts` failed deliveries the event is
//! dead-lettered and the subscription stops until it is reset.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocklens_core::{ConsumerId, GlobalVersion};

/// What the delivery worker does after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Deliver the same event again once `after` has passed.
    Redeliver { after: Duration },
    /// Give up: record a dead letter and hold the cursor.
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Deliveries of the same event before it is dead-lettered (at least 1).
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub base_delay: Duration,
    /// Ceiling for the doubled wait.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Decide after `failures` consecutive failed deliveries of one event.
    pub fn after_failure(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_attempts.max(1) {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Redeliver {
            after: self.backoff(failures),
        }
    }

    /// Longest a consumer can spend in backoff on one event before it is dead-lettered.
    pub fn worst_case_stall(&self) -> Duration {
        let waits = self.max_attempts.max(1) - 1;
        let mut total = Duration::ZERO;
        for failures in 1..=waits {
            let wait = self.backoff(failures);
            // Every later wait is the same once the ceiling (or zero) is reached.
            if wait >= self.max_delay || wait.is_zero() {
                return total.saturating_add(wait.saturating_mul(waits - failures + 1));
            }
            total = total.saturating_add(wait);
        }
        total
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1_u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// An event a subscriber could not process within its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub consumer_id: ConsumerId,
    pub global_version: GlobalVersion,
    pub event_type: String,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn each_failure_doubles_the_wait_before_redelivery() {
        let policy = RetryPolicy::new(5, ms(100), ms(10_000));
        let waits: Vec<_> = (1..5).map(|f| policy.after_failure(f)).collect();
        assert_eq!(
            waits,
            vec![
                RetryDecision::Redeliver { after: ms(100) },
                RetryDecision::Redeliver { after: ms(200) },
                RetryDecision::Redeliver { after: ms(400) },
                RetryDecision::Redeliver { after: ms(800) },
            ]
        );
    }

    #[test]
    fn final_failure_dead_letters_instead_of_waiting() {
        let policy = RetryPolicy::new(3, ms(100), ms(10_000));
        assert!(matches!(policy.after_failure(2), RetryDecision::Redeliver { .. }));
        assert_eq!(policy.after_failure(3), RetryDecision::DeadLetter);
        assert_eq!(policy.after_failure(4), RetryDecision::DeadLetter);
    }

    #[test]
    fn zero_attempts_still_allows_one_delivery() {
        let policy = RetryPolicy::new(0, ms(1), ms(1));
        assert_eq!(policy.after_failure(1), RetryDecision::DeadLetter);
        assert_eq!(policy.worst_case_stall(), Duration::ZERO);
    }

    #[test]
    fn wait_is_capped_for_long_outages() {
        let policy = RetryPolicy::new(u32::MAX, ms(250), ms(2_000));
        assert_eq!(policy.after_failure(5), RetryDecision::Redeliver { after: ms(2_000) });
        assert_eq!(policy.after_failure(40), RetryDecision::Redeliver { after: ms(2_000) });
        assert_eq!(policy.after_failure(u32::MAX - 1), RetryDecision::Redeliver { after: ms(2_000) });
    }

    #[test]
    fn ceiling_below_base_is_raised_to_base() {
        let policy = RetryPolicy::new(4, ms(50), ms(10));
        assert_eq!(policy.max_delay, ms(50));
        assert_eq!(policy.after_failure(3), RetryDecision::Redeliver { after: ms(50) });
    }

    #[test]
    fn worst_case_stall_sums_the_waits_before_dead_lettering() {
        // Waits after failures 1..=3; the 4th failure dead-letters.
        let policy = RetryPolicy::new(4, ms(100), ms(300));
        assert_eq!(policy.worst_case_stall(), ms(100 + 200 + 300));
        assert_eq!(
            RetryPolicy::new(u32::MAX, ms(1), ms(2)).worst_case_stall(),
            ms(1).saturating_add(ms(2).saturating_mul(u32::MAX - 2))
        );
    }
}
