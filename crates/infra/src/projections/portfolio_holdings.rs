use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stocklens_core::GlobalVersion;
use stocklens_events::{
    DecodeEvent, EventEnvelope, EventFilter, Projection, ProjectionError, QueryParams,
};
use stocklens_portfolio::{PortfolioEvent, STREAM_TYPE};

fn to_json<T: Serialize>(value: &T) -> Result<JsonValue, ProjectionError> {
    serde_json::to_value(value).map_err(|e| ProjectionError::Serialize(e.to_string()))
}

/// Queryable portfolio read model: cash and open positions per portfolio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingsView {
    pub owner: String,
    pub cash_cents: i64,
    pub positions: BTreeMap<String, i64>,
    pub closed: bool,
    pub event_count: u64,
    pub last_global_version: GlobalVersion,
}

pub type HoldingsState = BTreeMap<String, HoldingsView>;

/// Portfolio holdings projection.
///
/// Consumes `portfolio` streams only; read models are disposable and rebuildable
/// from the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortfolioHoldingsProjection;

impl PortfolioHoldingsProjection {
    pub const NAME: &'static str = "portfolio_holdings";
}

impl Projection for PortfolioHoldingsProjection {
    type State = HoldingsState;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn interest(&self) -> EventFilter {
        EventFilter::stream_type(STREAM_TYPE)
    }

    fn initial_state(&self) -> Self::State {
        BTreeMap::new()
    }

    fn apply(&self, state: &mut Self::State, event: &EventEnvelope) -> Result<(), ProjectionError> {
        let Some(decoded) =
            PortfolioEvent::decode_envelope(event).map_err(|e| ProjectionError::decode(event, e))?
        else {
            return Ok(());
        };

        let overflow = |what: &str| ProjectionError::rejected(event, format!("{what} overflows i64"));
        let view = state.entry(event.stream_id().to_string()).or_default();
        match decoded {
            PortfolioEvent::PortfolioCreated(e) => view.owner = e.owner,
            PortfolioEvent::CashDeposited(e) => {
                view.cash_cents = view
                    .cash_cents
                    .checked_add(e.amount_cents)
                    .ok_or_else(|| overflow("cash balance"))?;
            }
            PortfolioEvent::TradeExecuted(e) => {
                let cash = e
                    .cash_delta()
                    .and_then(|delta| view.cash_cents.checked_add(delta))
                    .ok_or_else(|| overflow("cash balance"))?;
                let held = view.positions.get(&e.symbol).copied().unwrap_or(0);
                let qty = e
                    .side
                    .signed(e.quantity)
                    .and_then(|delta| held.checked_add(delta))
                    .ok_or_else(|| overflow("position"))?;
                view.cash_cents = cash;
                if qty == 0 {
                    view.positions.remove(&e.symbol);
                } else {
                    view.positions.insert(e.symbol, qty);
                }
            }
            PortfolioEvent::PortfolioClosed(_) => view.closed = true,
        }
        view.event_count += 1;
        view.last_global_version = event.global_version();
        Ok(())
    }

    /// `{"portfolio_id": "..."}` returns one view (or `null`); `null`/`{}` returns all.
    fn query(&self, state: &Self::State, params: &QueryParams) -> Result<JsonValue, ProjectionError> {
        match params {
            JsonValue::Null => to_json(state),
            JsonValue::Object(map) if map.is_empty() => to_json(state),
            JsonValue::Object(map) => match map.get("portfolio_id") {
                Some(JsonValue::String(id)) if map.len() == 1 => match state.get(id) {
                    Some(view) => to_json(view),
                    None => Ok(JsonValue::Null),
                },
                _ => Err(ProjectionError::InvalidQuery(format!(
                    "expected {{\"portfolio_id\": <string>}}, got {params}"
                ))),
            },
            other => Err(ProjectionError::InvalidQuery(format!(
                "expected an object or null, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stocklens_core::StreamId;
    use stocklens_events::{NewEvent, ProjectionRunner};

    fn env(stream: &str, event_type: &str, payload: JsonValue, gv: u64) -> EventEnvelope {
        let e = NewEvent::new(StreamId::new(stream).unwrap(), STREAM_TYPE, event_type, payload);
        EventEnvelope::commit(e, gv, gv)
    }

    fn history() -> Vec<EventEnvelope> {
        let at = "2026-01-05T14:30:00Z";
        vec![
            env("portfolio-1", PortfolioEvent::CREATED, json!({ "owner": "ana", "occurred_at": at }), 1),
            env("portfolio-1", PortfolioEvent::CASH_DEPOSITED, json!({ "amount_cents": 100_000, "occurred_at": at }), 2),
            env(
                "portfolio-1",
                PortfolioEvent::TRADE_EXECUTED,
                json!({ "symbol": "ACME", "side": "buy", "quantity": 10, "price_cents": 1_500, "occurred_at": at }),
                3,
            ),
            env("portfolio-1", "NoteAdded", json!({ "text": "ignored" }), 4),
        ]
    }

    #[test]
    fn tracks_cash_positions_and_ignores_unknown_types() {
        let p = PortfolioHoldingsProjection;
        let mut runner = ProjectionRunner::new(&p);
        runner.run(&history()).unwrap();

        let view = &runner.state()["portfolio-1"];
        assert_eq!(view.owner, "ana");
        assert_eq!(view.cash_cents, 100_000 - 15_000);
        assert_eq!(view.positions.get("ACME"), Some(&10));
        assert_eq!(view.event_count, 3);
        assert_eq!(view.last_global_version, 3);
        assert_eq!(runner.checkpoint(), 4);
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let p = PortfolioHoldingsProjection;
        let mut state = p.initial_state();
        let bad = env("portfolio-1", PortfolioEvent::CASH_DEPOSITED, json!({ "amount_cents": "lots" }), 1);
        assert!(matches!(
            p.apply(&mut state, &bad),
            Err(ProjectionError::Decode { global_version: 1, .. })
        ));
    }

    #[test]
    fn overflowing_balance_is_rejected_not_wrapped() {
        let p = PortfolioHoldingsProjection;
        let mut state = p.initial_state();
        let at = "2026-01-05T14:30:00Z";
        let max = env("portfolio-1", PortfolioEvent::CASH_DEPOSITED, json!({ "amount_cents": i64::MAX, "occurred_at": at }), 1);
        p.apply(&mut state, &max).unwrap();

        let more = env("portfolio-1", PortfolioEvent::CASH_DEPOSITED, json!({ "amount_cents": 1, "occurred_at": at }), 2);
        assert!(matches!(
            p.apply(&mut state, &more),
            Err(ProjectionError::Rejected { global_version: 2, .. })
        ));
        assert_eq!(state["portfolio-1"].cash_cents, i64::MAX);
        assert_eq!(state["portfolio-1"].event_count, 1);

        let sell_min = env(
            "portfolio-2",
            PortfolioEvent::TRADE_EXECUTED,
            json!({ "symbol": "ACME", "side": "sell", "quantity": i64::MIN, "price_cents": 0, "occurred_at": at }),
            3,
        );
        assert!(matches!(p.apply(&mut state, &sell_min), Err(ProjectionError::Rejected { .. })));
    }

    #[test]
    fn query_by_portfolio_or_all() {
        let p = PortfolioHoldingsProjection;
        let mut runner = ProjectionRunner::new(&p);
        runner.run(&history()).unwrap();
        let state = runner.state();

        let one = p.query(state, &json!({ "portfolio_id": "portfolio-1" })).unwrap();
        assert_eq!(one["owner"], json!("ana"));
        assert_eq!(p.query(state, &json!({ "portfolio_id": "nope" })).unwrap(), JsonValue::Null);
        assert!(p.query(state, &json!(null)).unwrap().get("portfolio-1").is_some());
        assert!(matches!(p.query(state, &json!([1])), Err(ProjectionError::InvalidQuery(_))));
        assert!(matches!(p.query(state, &json!({ "owner": "ana" })), Err(ProjectionError::InvalidQuery(_))));
    }
}
