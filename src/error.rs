//! Error taxonomy for the matching and settlement engine
//!
//! - [`AdmissionError`]: the order was not admitted; nothing was mutated.
//! - [`OrderError`]: cancel/amend requests that cannot be honoured.
//! - [`SettlementError`]: an invariant broke while applying a fill. These are
//!   programming defects, never user error.
//! - [`PricingError`]: the reference price provider failed.

use crate::oms::types::{OrderId, OrderStatus};
use crate::types::{Money, Quantity, SessionId, Side, Symbol, UserId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdmissionError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("unknown instrument {0}")]
    UnknownInstrument(Symbol),

    #[error("user {user} has not joined session {session}")]
    NotParticipant { session: SessionId, user: UserId },

    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    #[error("session {0} is outside its trading window")]
    OutsideTradingWindow(SessionId),

    #[error("rate limit exceeded: {limit} submissions per {window_secs}s")]
    RateLimited { limit: u32, window_secs: u64 },

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("limit orders require a positive limit price")]
    MissingLimitPrice,

    #[error("limit price {price} outside band [{lower}, {upper}]")]
    PriceOutOfBand {
        price: Money,
        lower: Money,
        upper: Money,
    },

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },

    #[error("position limit exceeded: prospective {prospective}, cap {cap}")]
    PositionLimitExceeded { prospective: i64, cap: Quantity },

    #[error("insufficient shares: requested {requested}, available {available}")]
    InsufficientShares { requested: Quantity, available: i64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    #[error("order {0} not found")]
    NotFound(OrderId),

    #[error("order {0} belongs to another user")]
    NotOwner(OrderId),

    #[error("order {id} is already {status}")]
    AlreadyTerminal { id: OrderId, status: OrderStatus },

    #[error("order {0} is not an amendable limit order")]
    NotAmendable(OrderId),

    #[error("invalid amendment: {0}")]
    InvalidAmendment(String),

    #[error("amendment needs {required} more cash, available {available}")]
    InsufficientFundsForAmend { required: Money, available: Money },

    #[error("amendment rejected: {0}")]
    Rejected(#[from] AdmissionError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettlementError {
    #[error("settlement would leave {user} with negative cash ({balance})")]
    InsufficientCash { user: UserId, balance: Money },

    #[error("settlement would leave {user} short {quantity} {symbol}")]
    NegativeHolding {
        user: UserId,
        symbol: Symbol,
        quantity: i64,
    },

    #[error("fill {0} was already settled")]
    DuplicateFill(u64),

    #[error("order {order_id} cannot absorb {fill} (remaining {remaining})")]
    NegativeRemaining {
        order_id: OrderId,
        remaining: Quantity,
        fill: Quantity,
    },

    #[error("no portfolio for {user} in session {session}")]
    MissingPortfolio { session: SessionId, user: UserId },

    #[error("{side} leg priced at {price} is not settleable")]
    InvalidPrice { side: Side, price: Money },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PricingError {
    #[error("no reference price for {0}")]
    UnknownInstrument(Symbol),

    #[error("price provider unavailable: {0}")]
    Unavailable(String),

    #[error("circuit breaker is open, impact report dropped")]
    CircuitOpen,
}

/// Umbrella error returned by the public [`crate::Exchange`] API
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("order rejected: {0}")]
    Rejected(#[from] AdmissionError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("matching invariant violated: {0}")]
    InvariantViolation(#[from] SettlementError),

    #[error("reference price unavailable: {0}")]
    Pricing(#[from] PricingError),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// True for failures reported synchronously to the participant
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, EngineError::Rejected(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
