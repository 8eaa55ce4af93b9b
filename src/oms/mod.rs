//! Order Management System (OMS)
//!
//! - Limit and market orders with an explicit status state machine
//! - Resting book per market with price-time priority
//! - Pure matching that proposes fills without touching balances

pub mod matching;
pub mod orderbook;
pub mod types;

// Re-export core types
pub use matching::{match_incoming, Fill, MatchResult, RestingMatch};
pub use orderbook::{OrderBook, OrderBookSnapshot, PriceLevel};
pub use types::{
    Liquidity, Order, OrderId, OrderRequest, OrderStatus, OrderType, Trade, TradeId,
};
