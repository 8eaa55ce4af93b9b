//! Resting order book with price-time priority
//!
//! Uses BTreeMap for price-sorted levels and VecDeque for FIFO ordering within
//! a level. One book per (session, instrument) market; only open or partially
//! filled limit orders live here.

use crate::oms::types::{Order, OrderId, OrderType};
use crate::{Money, Quantity, Side, Symbol, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Aggregated depth at one price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Money,
    pub quantity: Quantity,
    pub order_count: usize,
}

/// Aggregated view of a market for display and subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: Symbol,
    /// Best (highest) bid first
    pub bids: Vec<PriceLevel>,
    /// Best (lowest) ask first
    pub asks: Vec<PriceLevel>,
    pub last_trade_price: Option<Money>,
    pub spread: Option<Money>,
}

#[derive(Default)]
pub struct OrderBook {
    /// Buy orders keyed by price; best bid is the last key
    buy_orders: BTreeMap<Money, VecDeque<OrderId>>,

    /// Sell orders keyed by price; best ask is the first key
    sell_orders: BTreeMap<Money, VecDeque<OrderId>>,

    /// Fast lookup: OrderId → Order
    orders: HashMap<OrderId, Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resting limit order behind everything already queued at its price.
    ///
    /// Orders without a limit price never rest; they are handed back.
    pub fn add_order(&mut self, order: Order) -> Result<(), Order> {
        let price = match (order.order_type, order.limit_price) {
            (OrderType::Limit, Some(price)) if order.is_active() => price,
            _ => return Err(order),
        };

        let order_id = order.id;
        self.side_mut(order.side)
            .entry(price)
            .or_default()
            .push_back(order_id);
        self.orders.insert(order_id, order);
        Ok(())
    }

    /// Remove an order from the book, returning it unchanged
    pub fn remove_order(&mut self, order_id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&order_id)?;
        if let Some(price) = order.limit_price {
            let levels = self.side_mut(order.side);
            if let Some(queue) = levels.get_mut(&price) {
                queue.retain(|&id| id != order_id);
                if queue.is_empty() {
                    levels.remove(&price);
                }
            }
        }
        Some(order)
    }

    /// Resting orders an incoming order on `incoming_side` could trade with,
    /// in the order they must be consumed.
    ///
    /// Buys walk asks cheapest-first, sells walk bids richest-first; within a
    /// level the oldest priority stamp comes first. `limit` bounds the prices
    /// the incoming order is willing to cross; `None` accepts any price.
    pub fn candidates(
        &self,
        incoming_side: Side,
        limit: Option<Money>,
    ) -> impl Iterator<Item = &Order> + '_ {
        type Levels<'a> = Box<dyn Iterator<Item = (&'a Money, &'a VecDeque<OrderId>)> + 'a>;
        let levels: Levels<'_> = match incoming_side {
            Side::Buy => Box::new(
                self.sell_orders
                    .iter()
                    .take_while(move |(price, _)| limit.map_or(true, |l| **price <= l)),
            ),
            Side::Sell => Box::new(
                self.buy_orders
                    .iter()
                    .rev()
                    .take_while(move |(price, _)| limit.map_or(true, |l| **price >= l)),
            ),
        };

        levels.flat_map(move |(_, queue)| {
            let mut level: Vec<&Order> =
                queue.iter().filter_map(|id| self.orders.get(id)).collect();
            level.sort_by_key(|order| order.priority);
            level
        })
    }

    pub fn best_bid(&self) -> Option<Money> {
        self.buy_orders.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Money> {
        self.sell_orders.keys().next().copied()
    }

    pub fn spread(&self) -> Option<Money> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// Aggregate depth, best levels first, at most `depth` levels per side
    pub fn snapshot(
        &self,
        symbol: &Symbol,
        depth: usize,
        last_trade_price: Option<Money>,
    ) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.clone(),
            bids: self.levels(self.buy_orders.iter().rev(), depth),
            asks: self.levels(self.sell_orders.iter(), depth),
            last_trade_price,
            spread: self.spread(),
        }
    }

    fn levels<'a>(
        &self,
        iter: impl Iterator<Item = (&'a Money, &'a VecDeque<OrderId>)>,
        depth: usize,
    ) -> Vec<PriceLevel> {
        iter.take(depth)
            .map(|(price, queue)| PriceLevel {
                price: *price,
                quantity: queue
                    .iter()
                    .filter_map(|id| self.orders.get(id))
                    .map(|o| o.remaining_quantity)
                    .sum(),
                order_count: queue.len(),
            })
            .collect()
    }

    pub fn get_order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    /// Mutable access for fills. Price and side must not change through this
    /// handle; amendments go through remove + add.
    pub fn get_order_mut(&mut self, order_id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&order_id)
    }

    pub fn orders_for_user<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a Order> + 'a {
        self.orders.values().filter(move |o| &o.user == user)
    }

    /// Shares committed to the user's resting sells, optionally ignoring one order
    pub fn open_sell_quantity(&self, user: &UserId, excluding: Option<OrderId>) -> Quantity {
        self.open_quantity(user, Side::Sell, excluding)
    }

    pub fn open_buy_quantity(&self, user: &UserId, excluding: Option<OrderId>) -> Quantity {
        self.open_quantity(user, Side::Buy, excluding)
    }

    fn open_quantity(&self, user: &UserId, side: Side, excluding: Option<OrderId>) -> Quantity {
        self.orders_for_user(user)
            .filter(|o| o.side == side && Some(o.id) != excluding)
            .map(|o| o.remaining_quantity)
            .sum()
    }

    /// Ids of resting orders whose expiry is at or before `now`
    pub fn expired_order_ids(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self
            .orders
            .values()
            .filter(|o| o.is_expired_at(now))
            .map(|o| o.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn all_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Money, VecDeque<OrderId>> {
        match side {
            Side::Buy => &mut self.buy_orders,
            Side::Sell => &mut self.sell_orders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::types::{OrderRequest, OrderStatus};

    fn resting(user: &str, side: Side, qty: Quantity, price: i64) -> Order {
        let request = OrderRequest::limit(user, "s1", "ACME", side, qty, Money::from_i64(price));
        let mut order = Order::from_request(&request, Utc::now());
        order.transition(OrderStatus::Open, Utc::now());
        order
    }

    #[test]
    fn test_add_and_remove_order() {
        let mut book = OrderBook::new();
        let order = resting("alice", Side::Buy, 10, 100);
        let id = order.id;
        book.add_order(order).unwrap();

        assert_eq!(book.len(), 1);
        assert_eq!(book.best_bid(), Some(Money::from_i64(100)));

        let removed = book.remove_order(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(book.is_empty());
        assert_eq!(book.best_bid(), None);
    }

    #[test]
    fn test_market_orders_never_rest() {
        let mut book = OrderBook::new();
        let request = OrderRequest::market("alice", "s1", "ACME", Side::Buy, 5);
        let mut order = Order::from_request(&request, Utc::now());
        order.transition(OrderStatus::Open, Utc::now());
        assert!(book.add_order(order).is_err());
        assert!(book.is_empty());
    }

    #[test]
    fn test_buy_candidates_cheapest_then_oldest() {
        let mut book = OrderBook::new();
        let first_at_101 = resting("s1", Side::Sell, 5, 101);
        let at_100 = resting("s2", Side::Sell, 5, 100);
        let second_at_101 = resting("s3", Side::Sell, 5, 101);
        let too_rich = resting("s4", Side::Sell, 5, 110);
        let ids = [at_100.id, first_at_101.id, second_at_101.id];

        for order in [first_at_101, at_100, second_at_101, too_rich] {
            book.add_order(order).unwrap();
        }

        let walked: Vec<OrderId> = book
            .candidates(Side::Buy, Some(Money::from_i64(105)))
            .map(|o| o.id)
            .collect();
        assert_eq!(walked, ids);

        // market buy sees every ask
        assert_eq!(book.candidates(Side::Buy, None).count(), 4);
    }

    #[test]
    fn test_sell_candidates_richest_first() {
        let mut book = OrderBook::new();
        let low = resting("b1", Side::Buy, 5, 95);
        let high = resting("b2", Side::Buy, 5, 99);
        let (low_id, high_id) = (low.id, high.id);
        book.add_order(low).unwrap();
        book.add_order(high).unwrap();

        let walked: Vec<OrderId> = book.candidates(Side::Sell, None).map(|o| o.id).collect();
        assert_eq!(walked, vec![high_id, low_id]);

        let walked: Vec<OrderId> = book
            .candidates(Side::Sell, Some(Money::from_i64(97)))
            .map(|o| o.id)
            .collect();
        assert_eq!(walked, vec![high_id]);
    }

    #[test]
    fn test_snapshot_aggregates_levels() {
        let mut book = OrderBook::new();
        book.add_order(resting("b1", Side::Buy, 10, 99)).unwrap();
        book.add_order(resting("b2", Side::Buy, 15, 99)).unwrap();
        book.add_order(resting("b3", Side::Buy, 5, 98)).unwrap();
        book.add_order(resting("s1", Side::Sell, 7, 101)).unwrap();

        let snap = book.snapshot(&Symbol::new("ACME"), 10, Some(Money::from_i64(100)));
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(
            snap.bids[0],
            PriceLevel {
                price: Money::from_i64(99),
                quantity: 25,
                order_count: 2
            }
        );
        assert_eq!(snap.asks[0].quantity, 7);
        assert_eq!(snap.spread, Some(Money::from_i64(2)));
        assert_eq!(snap.last_trade_price, Some(Money::from_i64(100)));

        let shallow = book.snapshot(&Symbol::new("ACME"), 1, None);
        assert_eq!(shallow.bids.len(), 1);
    }

    #[test]
    fn test_open_sell_quantity_excludes_order() {
        let mut book = OrderBook::new();
        let a = resting("alice", Side::Sell, 10, 101);
        let a_id = a.id;
        book.add_order(a).unwrap();
        book.add_order(resting("alice", Side::Sell, 4, 102)).unwrap();
        book.add_order(resting("bob", Side::Sell, 50, 101)).unwrap();

        let alice = UserId::new("alice");
        assert_eq!(book.open_sell_quantity(&alice, None), 14);
        assert_eq!(book.open_sell_quantity(&alice, Some(a_id)), 4);
        assert_eq!(book.open_buy_quantity(&alice, None), 0);
    }

    #[test]
    fn test_expired_order_ids() {
        let mut book = OrderBook::new();
        let now = Utc::now();
        let mut stale = resting("alice", Side::Buy, 1, 100);
        stale.expires_at = Some(now - chrono::Duration::seconds(1));
        let stale_id = stale.id;
        let mut fresh = resting("bob", Side::Buy, 1, 100);
        fresh.expires_at = Some(now + chrono::Duration::hours(1));

        book.add_order(stale).unwrap();
        book.add_order(fresh).unwrap();
        assert_eq!(book.expired_order_ids(now), vec![stale_id]);
    }
}
