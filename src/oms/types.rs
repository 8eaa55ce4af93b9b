//! Core OMS types
//!
//! Defines orders, trades, and the order state machine.
//! Uses Money type for all monetary values to prevent floating-point drift.

use crate::error::SettlementError;
use crate::{Money, Quantity, SessionId, Side, Symbol, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Order ID type - u64 for performance
pub type OrderId = u64;
pub type TradeId = u64;
pub type FillId = u64;

static ORDER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static TRADE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static FILL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static PRIORITY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate next order ID (thread-safe, lock-free)
pub fn next_order_id() -> OrderId {
    ORDER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub fn next_trade_id() -> TradeId {
    TRADE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub fn next_fill_id() -> FillId {
    FILL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Next priority stamp. Strictly increasing across the process, so it orders
/// orders admitted within the same clock tick.
pub fn next_priority() -> u64 {
    PRIORITY_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Move every generator past the highest ids found in recovered state.
pub fn ensure_ids_above(order_id: OrderId, trade_id: TradeId, fill_id: FillId, priority: u64) {
    ORDER_ID_COUNTER.fetch_max(order_id + 1, Ordering::Relaxed);
    TRADE_ID_COUNTER.fetch_max(trade_id + 1, Ordering::Relaxed);
    FILL_ID_COUNTER.fetch_max(fill_id + 1, Ordering::Relaxed);
    PRIORITY_COUNTER.fetch_max(priority + 1, Ordering::SeqCst);
}

/// Order type - determines execution logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Walks the book, remainder fills at the reference price
    Market,

    /// Buy limit: crosses asks ≤ limit price
    /// Sell limit: crosses bids ≥ limit price
    Limit,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Order state machine
///
/// ```text
/// pending → open → { filled | partial → filled | cancelled | expired }
/// pending → rejected
/// ```
/// Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, admission not yet decided
    Pending,

    /// Admitted, nothing filled yet
    Open,

    /// Some quantity filled, remainder live
    PartiallyFilled,

    Filled,
    Cancelled,

    /// Refused at admission, never entered the book
    Rejected,

    /// Swept after its time-to-live elapsed
    Expired,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Open) | (Pending, Rejected) => true,
            (Open, PartiallyFilled) | (Open, Filled) | (Open, Cancelled) | (Open, Expired) => {
                true
            }
            (PartiallyFilled, PartiallyFilled)
            | (PartiallyFilled, Filled)
            | (PartiallyFilled, Cancelled)
            | (PartiallyFilled, Expired) => true,
            (Pending, _) | (Open, _) | (PartiallyFilled, _) => false,
            (Filled, _) | (Cancelled, _) | (Rejected, _) | (Expired, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => OrderStatus::Pending,
            "open" => OrderStatus::Open,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "cancelled" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            other => return Err(format!("unknown order status: {other}")),
        })
    }
}

/// Incoming order as submitted by a participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub user: UserId,
    pub session: SessionId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    #[serde(default)]
    pub limit_price: Option<Money>,
}

impl OrderRequest {
    pub fn limit(
        user: impl Into<UserId>,
        session: impl Into<SessionId>,
        symbol: impl Into<Symbol>,
        side: Side,
        quantity: Quantity,
        price: Money,
    ) -> Self {
        Self {
            user: user.into(),
            session: session.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(price),
        }
    }

    pub fn market(
        user: impl Into<UserId>,
        session: impl Into<SessionId>,
        symbol: impl Into<Symbol>,
        side: Side,
        quantity: Quantity,
    ) -> Self {
        Self {
            user: user.into(),
            session: session.into(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
        }
    }
}

/// Core order structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user: UserId,
    pub session: SessionId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub limit_price: Option<Money>,
    pub quantity: Quantity,
    pub filled_quantity: Quantity,
    pub remaining_quantity: Quantity,
    pub average_fill_price: Money,
    pub status: OrderStatus,
    pub commission: Money,
    /// Cash currently held back for this order (buy side only)
    pub reserved_cash: Money,
    /// Price-time tie breaker, reset on amendment
    pub priority: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn from_request(request: &OrderRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: next_order_id(),
            user: request.user.clone(),
            session: request.session.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            limit_price: request.limit_price,
            quantity: request.quantity,
            filled_quantity: 0,
            remaining_quantity: request.quantity,
            average_fill_price: Money::ZERO,
            status: OrderStatus::Pending,
            commission: Money::ZERO,
            reserved_cash: Money::ZERO,
            priority: next_priority(),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Move to `next`, refusing transitions the state machine forbids.
    pub fn transition(&mut self, next: OrderStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Record a fill of `quantity` at `price`.
    ///
    /// Status follows from the quantities: `Filled` when nothing remains,
    /// `PartiallyFilled` otherwise.
    pub fn apply_fill(
        &mut self,
        quantity: Quantity,
        price: Money,
        commission: Money,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        if quantity == 0 || quantity > self.remaining_quantity || !self.is_active() {
            return Err(SettlementError::NegativeRemaining {
                order_id: self.id,
                remaining: self.remaining_quantity,
                fill: quantity,
            });
        }

        // Weighted average fill price
        let prev_value = self.average_fill_price.notional(self.filled_quantity);
        let new_filled = self.filled_quantity + quantity;
        self.average_fill_price =
            (prev_value + price.notional(quantity)) / Money::from_qty(new_filled);

        self.filled_quantity = new_filled;
        self.remaining_quantity -= quantity;
        self.commission += commission;

        let next = if self.remaining_quantity == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next, now);
        debug_assert!(self.quantities_consistent());
        Ok(())
    }

    pub fn quantities_consistent(&self) -> bool {
        self.filled_quantity + self.remaining_quantity == self.quantity
    }
}

/// Why a trade was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity {
    /// Incoming order that crossed the book
    Taker,
    /// Resting order that was crossed
    Maker,
    /// Market-order remainder filled at the reference price
    Reference,
}

impl Liquidity {
    pub fn as_str(self) -> &'static str {
        match self {
            Liquidity::Taker => "taker",
            Liquidity::Maker => "maker",
            Liquidity::Reference => "reference",
        }
    }
}

impl std::str::FromStr for Liquidity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "taker" => Ok(Liquidity::Taker),
            "maker" => Ok(Liquidity::Maker),
            "reference" => Ok(Liquidity::Reference),
            other => Err(format!("unknown liquidity flag: {other}")),
        }
    }
}

/// One side of an executed fill. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub user: UserId,
    pub session: SessionId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Money,
    pub value: Money,
    pub commission: Money,
    pub liquidity: Liquidity,
    pub counterparty_order: Option<OrderId>,
    pub executed_at: DateTime<Utc>,
}

impl Trade {
    /// Signed cash effect on the owner: buys pay value plus commission,
    /// sells receive value minus commission.
    pub fn cash_delta(&self) -> Money {
        match self.side {
            Side::Buy => -(self.value + self.commission),
            Side::Sell => self.value - self.commission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_order(qty: Quantity, price: i64) -> Order {
        let request =
            OrderRequest::limit("alice", "s1", "ACME", Side::Buy, qty, Money::from_i64(price));
        let mut order = Order::from_request(&request, Utc::now());
        assert!(order.transition(OrderStatus::Open, Utc::now()));
        order
    }

    #[test]
    fn test_order_id_generation() {
        let id1 = next_order_id();
        let id2 = next_order_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_priority_strictly_increases() {
        let a = limit_order(1, 100);
        let b = limit_order(1, 100);
        assert!(b.priority > a.priority);
    }

    #[test]
    fn test_partial_then_full_fill() {
        let mut order = limit_order(10, 100);
        let now = Utc::now();

        order.apply_fill(3, Money::from_i64(100), Money::from_f64(0.3), now).unwrap();
        assert_eq!(order.filled_quantity, 3);
        assert_eq!(order.remaining_quantity, 7);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        order.apply_fill(7, Money::from_i64(90), Money::from_f64(0.63), now).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.remaining_quantity, 0);
        assert!(order.quantities_consistent());

        // (3×100 + 7×90) / 10 = 93
        assert_eq!(order.average_fill_price, Money::from_i64(93));
        assert_eq!(order.commission, Money::from_f64(0.93));
    }

    #[test]
    fn test_overfill_is_rejected() {
        let mut order = limit_order(5, 100);
        let err = order
            .apply_fill(6, Money::from_i64(100), Money::ZERO, Utc::now())
            .unwrap_err();
        assert!(matches!(err, SettlementError::NegativeRemaining { .. }));
        assert_eq!(order.remaining_quantity, 5);
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for terminal in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            for next in [
                OrderStatus::Pending,
                OrderStatus::Open,
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::Cancelled,
                OrderStatus::Expired,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!OrderStatus::Open.can_transition_to(OrderStatus::Rejected));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Rejected));
    }

    #[test]
    fn test_trade_cash_delta() {
        let trade = Trade {
            id: 1,
            fill_id: 1,
            order_id: 1,
            user: UserId::new("alice"),
            session: SessionId::new("s1"),
            symbol: Symbol::new("ACME"),
            side: Side::Buy,
            quantity: 100,
            price: Money::from_i64(105),
            value: Money::from_i64(10_500),
            commission: Money::from_f64(10.5),
            liquidity: Liquidity::Taker,
            counterparty_order: Some(2),
            executed_at: Utc::now(),
        };
        assert_eq!(trade.cash_delta(), Money::from_f64(-10_510.5));
    }
}
