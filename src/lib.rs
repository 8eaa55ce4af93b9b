//! Competition Exchange
//!
//! Order matching and settlement engine for a simulated equities trading
//! competition: order admission, price-time priority matching, atomic
//! settlement into portfolios and holdings, cash reservations for open buys,
//! order expiry, and outbound trade events.

pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod oms;
pub mod pricing;
pub mod reservation;
pub mod session;
pub mod settlement;
pub mod state_manager;
pub mod types;

pub use config::Config;
pub use engine::{Exchange, Execution};
pub use error::{EngineError, EngineResult};
pub use types::*;
