//! Portfolio domain module (event-sourced).
//!
//! A small sample domain used to drive the event core in tests, benches and the
//! bundled projections. Pure deterministic logic: no IO, no storage.

pub mod portfolio;

pub use portfolio::{
    CashDeposited, ClosePortfolio, CreatePortfolio, DepositCash, ExecuteTrade, Portfolio,
    PortfolioClosed, PortfolioCommand, PortfolioCreated, PortfolioEvent, PortfolioId,
    PortfolioStatus, STREAM_TYPE, TradeExecuted, TradeSide,
};
