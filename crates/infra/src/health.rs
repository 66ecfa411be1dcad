//! Point-in-time health of the event core.
//!
//! `ready` is true once every view is Live. Until then the core reports `Starting`
//! unless something already needs an operator, which reports `Degraded`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use stocklens_core::{ConsumerId, GlobalVersion};

use crate::projections::{ViewDescription, ViewStatus};
use crate::query_cache::CacheStats;
use crate::router::{DeliveryState, SubscriptionInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Some view is still Uninitialized or Rebuilding.
    Starting,
    Healthy,
    /// Some view is Stale or some subscription is dead-lettered; operator action needed.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionHealth {
    pub consumer_id: ConsumerId,
    pub state: DeliveryState,
    pub cursor: GlobalVersion,
    pub lag: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub ready: bool,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub head: GlobalVersion,
    pub projections: Vec<ViewDescription>,
    pub subscriptions: Vec<SubscriptionHealth>,
    pub cache: CacheStats,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn assess(
        head: GlobalVersion,
        projections: Vec<ViewDescription>,
        subscriptions: Vec<SubscriptionInfo>,
        cache: CacheStats,
        uptime: Duration,
    ) -> Self {
        let subscriptions: Vec<SubscriptionHealth> = subscriptions
            .into_iter()
            .map(|s| SubscriptionHealth {
                lag: head.saturating_sub(s.cursor),
                consumer_id: s.consumer_id,
                state: s.state,
                cursor: s.cursor,
                last_error: s.last_error,
            })
            .collect();

        let degraded = projections.iter().any(|p| p.status == ViewStatus::Stale)
            || subscriptions.iter().any(|s| s.state == DeliveryState::DeadLettered);

        let ready = projections.iter().all(|p| p.status == ViewStatus::Live);
        let status = if degraded {
            HealthStatus::Degraded
        } else if !ready {
            HealthStatus::Starting
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            ready,
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: uptime.as_secs(),
            head,
            projections,
            subscriptions,
            cache,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
