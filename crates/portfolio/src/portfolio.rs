use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stocklens_core::{Aggregate, AggregateRoot, DomainError, StreamId};
use stocklens_events::{DecodeError, DecodeEvent, Event, NewEvent};

/// `stream_type` of every portfolio stream.
pub const STREAM_TYPE: &str = "portfolio";

/// Portfolio identifier; doubles as the stream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortfolioId(pub StreamId);

impl PortfolioId {
    pub fn new(id: StreamId) -> Self {
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        StreamId::new(raw).map(Self)
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.0
    }
}

impl core::fmt::Display for PortfolioId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioStatus {
    Open,
    Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Signed position change for `quantity` units; `None` if it cannot be negated.
    pub fn signed(self, quantity: i64) -> Option<i64> {
        match self {
            TradeSide::Buy => Some(quantity),
            TradeSide::Sell => quantity.checked_neg(),
        }
    }
}

/// Aggregate root: Portfolio.
///
/// Serializable so it can be snapshotted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    id: PortfolioId,
    owner: String,
    cash_cents: i64,
    positions: BTreeMap<String, i64>,
    status: Option<PortfolioStatus>,
    version: u64,
}

impl Portfolio {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PortfolioId) -> Self {
        Self {
            id,
            owner: String::new(),
            cash_cents: 0,
            positions: BTreeMap::new(),
            status: None,
            version: 0,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn cash_cents(&self) -> i64 {
        self.cash_cents
    }

    pub fn position(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).copied().unwrap_or(0)
    }

    pub fn positions(&self) -> &BTreeMap<String, i64> {
        &self.positions
    }

    pub fn status(&self) -> Option<PortfolioStatus> {
        self.status
    }
}

impl AggregateRoot for Portfolio {
    type Id = PortfolioId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePortfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePortfolio {
    pub portfolio_id: PortfolioId,
    pub owner: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DepositCash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositCash {
    pub portfolio_id: PortfolioId,
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ExecuteTrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTrade {
    pub portfolio_id: PortfolioId,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: i64,
    pub price_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ClosePortfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePortfolio {
    pub portfolio_id: PortfolioId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioCommand {
    CreatePortfolio(CreatePortfolio),
    DepositCash(DepositCash),
    ExecuteTrade(ExecuteTrade),
    ClosePortfolio(ClosePortfolio),
}

/// Event: PortfolioCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioCreated {
    pub owner: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CashDeposited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashDeposited {
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TradeExecuted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeExecuted {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: i64,
    pub price_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

impl TradeExecuted {
    /// Cash effect of the trade (negative for buys); `None` on i64 overflow.
    pub fn cash_delta(&self) -> Option<i64> {
        self.side
            .signed(self.quantity)?
            .checked_mul(self.price_cents)?
            .checked_neg()
    }
}

/// Event: PortfolioClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioClosed {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioEvent {
    PortfolioCreated(PortfolioCreated),
    CashDeposited(CashDeposited),
    TradeExecuted(TradeExecuted),
    PortfolioClosed(PortfolioClosed),
}

impl PortfolioEvent {
    pub const CREATED: &'static str = "PortfolioCreated";
    pub const CASH_DEPOSITED: &'static str = "CashDeposited";
    pub const TRADE_EXECUTED: &'static str = "TradeExecuted";
    pub const CLOSED: &'static str = "PortfolioClosed";

    /// Pending store event for this portfolio's stream.
    pub fn to_new_event(&self, portfolio_id: &PortfolioId) -> Result<NewEvent, serde_json::Error> {
        NewEvent::from_typed(portfolio_id.stream_id().clone(), STREAM_TYPE, self)
    }
}

impl Event for PortfolioEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PortfolioEvent::PortfolioCreated(_) => Self::CREATED,
            PortfolioEvent::CashDeposited(_) => Self::CASH_DEPOSITED,
            PortfolioEvent::TradeExecuted(_) => Self::TRADE_EXECUTED,
            PortfolioEvent::PortfolioClosed(_) => Self::CLOSED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PortfolioEvent::PortfolioCreated(e) => e.occurred_at,
            PortfolioEvent::CashDeposited(e) => e.occurred_at,
            PortfolioEvent::TradeExecuted(e) => e.occurred_at,
            PortfolioEvent::PortfolioClosed(e) => e.occurred_at,
        }
    }

    fn payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            PortfolioEvent::PortfolioCreated(e) => serde_json::to_value(e),
            PortfolioEvent::CashDeposited(e) => serde_json::to_value(e),
            PortfolioEvent::TradeExecuted(e) => serde_json::to_value(e),
            PortfolioEvent::PortfolioClosed(e) => serde_json::to_value(e),
        }
    }
}

impl DecodeEvent for PortfolioEvent {
    fn decode(event_type: &str, payload: &JsonValue) -> Result<Option<Self>, DecodeError> {
        fn parse<T: serde::de::DeserializeOwned>(
            event_type: &str,
            payload: &JsonValue,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(payload.clone()).map_err(|e| DecodeError::new(event_type, e))
        }

        let event = match event_type {
            Self::CREATED => PortfolioEvent::PortfolioCreated(parse(event_type, payload)?),
            Self::CASH_DEPOSITED => PortfolioEvent::CashDeposited(parse(event_type, payload)?),
            Self::TRADE_EXECUTED => PortfolioEvent::TradeExecuted(parse(event_type, payload)?),
            Self::CLOSED => PortfolioEvent::PortfolioClosed(parse(event_type, payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

impl Aggregate for Portfolio {
    type Command = PortfolioCommand;
    type Event = PortfolioEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PortfolioEvent::PortfolioCreated(e) => {
                self.owner = e.owner.clone();
                self.cash_cents = 0;
                self.positions.clear();
                self.status = Some(PortfolioStatus::Open);
            }
            PortfolioEvent::CashDeposited(e) => {
                self.cash_cents = self.cash_cents.saturating_add(e.amount_cents);
            }
            // `handle` never emits a trade that overflows; one found in the log leaves balances untouched.
            PortfolioEvent::TradeExecuted(e) => {
                if let Some((position, cash)) = self.after_trade(e) {
                    if position == 0 {
                        self.positions.remove(&e.symbol);
                    } else {
                        self.positions.insert(e.symbol.clone(), position);
                    }
                    self.cash_cents = cash;
                }
            }
            PortfolioEvent::PortfolioClosed(_) => {
                self.status = Some(PortfolioStatus::Closed);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PortfolioCommand::CreatePortfolio(cmd) => self.handle_create(cmd),
            PortfolioCommand::DepositCash(cmd) => self.handle_deposit(cmd),
            PortfolioCommand::ExecuteTrade(cmd) => self.handle_trade(cmd),
            PortfolioCommand::ClosePortfolio(cmd) => self.handle_close(cmd),
        }
    }
}

impl Portfolio {
    /// Position in the traded symbol and cash balance after `trade`, if both fit in an i64.
    fn after_trade(&self, trade: &TradeExecuted) -> Option<(i64, i64)> {
        let position = self.position(&trade.symbol).checked_add(trade.side.signed(trade.quantity)?)?;
        let cash = self.cash_cents.checked_add(trade.cash_delta()?)?;
        Some((position, cash))
    }

    fn ensure_portfolio_id(&self, portfolio_id: &PortfolioId) -> Result<(), DomainError> {
        if &self.id != portfolio_id {
            return Err(DomainError::invariant("portfolio_id mismatch"));
        }
        Ok(())
    }

    fn ensure_open(&self, portfolio_id: &PortfolioId) -> Result<(), DomainError> {
        self.ensure_portfolio_id(portfolio_id)?;
        match self.status {
            None => Err(DomainError::not_found()),
            Some(PortfolioStatus::Closed) => Err(DomainError::invariant("portfolio is closed")),
            Some(PortfolioStatus::Open) => Ok(()),
        }
    }

    fn handle_create(&self, cmd: &CreatePortfolio) -> Result<Vec<PortfolioEvent>, DomainError> {
        if self.status.is_some() {
            return Err(DomainError::conflict("portfolio already exists"));
        }
        self.ensure_portfolio_id(&cmd.portfolio_id)?;
        if cmd.owner.trim().is_empty() {
            return Err(DomainError::validation("owner cannot be empty"));
        }
        Ok(vec![PortfolioEvent::PortfolioCreated(PortfolioCreated {
            owner: cmd.owner.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deposit(&self, cmd: &DepositCash) -> Result<Vec<PortfolioEvent>, DomainError> {
        self.ensure_open(&cmd.portfolio_id)?;
        if cmd.amount_cents <= 0 {
            return Err(DomainError::validation("deposit must be positive"));
        }
        if self.cash_cents.checked_add(cmd.amount_cents).is_none() {
            return Err(DomainError::validation("deposit would overflow the cash balance"));
        }
        Ok(vec![PortfolioEvent::CashDeposited(CashDeposited {
            amount_cents: cmd.amount_cents,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_trade(&self, cmd: &ExecuteTrade) -> Result<Vec<PortfolioEvent>, DomainError> {
        self.ensure_open(&cmd.portfolio_id)?;
        if cmd.symbol.trim().is_empty() {
            return Err(DomainError::validation("symbol cannot be empty"));
        }
        if cmd.quantity <= 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.price_cents < 0 {
            return Err(DomainError::validation("price cannot be negative"));
        }
        let trade = TradeExecuted {
            symbol: cmd.symbol.clone(),
            side: cmd.side,
            quantity: cmd.quantity,
            price_cents: cmd.price_cents,
            occurred_at: cmd.occurred_at,
        };
        if self.after_trade(&trade).is_none() {
            return Err(DomainError::validation("trade would overflow the cash balance or position"));
        }
        Ok(vec![PortfolioEvent::TradeExecuted(trade)])
    }

    fn handle_close(&self, cmd: &ClosePortfolio) -> Result<Vec<PortfolioEvent>, DomainError> {
        self.ensure_open(&cmd.portfolio_id)?;
        Ok(vec![PortfolioEvent::PortfolioClosed(PortfolioClosed {
            occurred_at: cmd.occurred_at,
        })])
    }
}
