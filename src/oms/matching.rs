//! Price-time priority matching
//!
//! Walks the opposite side of a book and produces fill records. Nothing here
//! touches balances or the book itself; the engine settles each fill and then
//! applies it to the book, so matching can be reasoned about on its own.

use crate::oms::orderbook::OrderBook;
use crate::oms::types::OrderId;
use crate::{Money, Quantity, Side, UserId};
use serde::{Deserialize, Serialize};

/// The resting order on the other side of a fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestingMatch {
    pub order_id: OrderId,
    pub user: UserId,
}

/// One proposed execution for the incoming order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// `None` when the fill comes from the reference-price fallback
    pub resting: Option<RestingMatch>,
    pub price: Money,
    pub quantity: Quantity,
}

impl Fill {
    pub fn value(&self) -> Money {
        self.price.notional(self.quantity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub fills: Vec<Fill>,
    pub unmatched: Quantity,
}

impl MatchResult {
    pub fn matched_quantity(&self) -> Quantity {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// Total value of every fill, before commission
    pub fn gross_value(&self) -> Money {
        self.fills.iter().map(Fill::value).sum()
    }

    /// Fill whatever the book could not absorb at `reference_price`.
    ///
    /// Market orders only: the remainder trades against the house at the
    /// current reference price instead of being rejected.
    pub fn fill_remainder_at(&mut self, reference_price: Money) {
        if self.unmatched > 0 {
            self.fills.push(Fill {
                resting: None,
                price: reference_price,
                quantity: self.unmatched,
            });
            self.unmatched = 0;
        }
    }
}

/// Match an incoming order of `quantity` on `side` against `book`.
///
/// Each candidate yields `min(incoming remaining, candidate remaining)` at the
/// candidate's resting price, so any price improvement goes to the incoming
/// order. `limit` of `None` marks a market order that accepts any price.
pub fn match_incoming(
    book: &OrderBook,
    side: Side,
    quantity: Quantity,
    limit: Option<Money>,
) -> MatchResult {
    let mut remaining = quantity;
    let mut fills = Vec::new();

    for candidate in book.candidates(side, limit) {
        if remaining == 0 {
            break;
        }
        // candidates() only yields limit orders
        let Some(price) = candidate.limit_price else {
            continue;
        };
        let quantity = remaining.min(candidate.remaining_quantity);
        if quantity == 0 {
            continue;
        }

        fills.push(Fill {
            resting: Some(RestingMatch {
                order_id: candidate.id,
                user: candidate.user.clone(),
            }),
            price,
            quantity,
        });
        remaining -= quantity;
    }

    MatchResult {
        fills,
        unmatched: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::types::{Order, OrderRequest, OrderStatus};
    use chrono::Utc;

    fn rest(book: &mut OrderBook, user: &str, side: Side, qty: Quantity, price: i64) -> OrderId {
        let request = OrderRequest::limit(user, "s1", "ACME", side, qty, Money::from_i64(price));
        let mut order = Order::from_request(&request, Utc::now());
        order.transition(OrderStatus::Open, Utc::now());
        let id = order.id;
        book.add_order(order).unwrap();
        id
    }

    #[test]
    fn test_full_match_at_resting_price() {
        let mut book = OrderBook::new();
        let ask = rest(&mut book, "bob", Side::Sell, 100, 104);

        let result = match_incoming(&book, Side::Buy, 100, Some(Money::from_i64(105)));
        assert_eq!(result.unmatched, 0);
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].price, Money::from_i64(104)); // price improvement
        assert_eq!(result.fills[0].resting.as_ref().unwrap().order_id, ask);

        // matching never mutates the book
        assert_eq!(book.get_order(ask).unwrap().remaining_quantity, 100);
    }

    #[test]
    fn test_partial_fill_prefers_earlier_order_at_same_price() {
        let mut book = OrderBook::new();
        let early = rest(&mut book, "s1", Side::Sell, 50, 100);
        let late = rest(&mut book, "s2", Side::Sell, 50, 100);

        let result = match_incoming(&book, Side::Buy, 30, Some(Money::from_i64(100)));
        assert_eq!(result.fills.len(), 1);
        assert_eq!(result.fills[0].resting.as_ref().unwrap().order_id, early);
        assert_eq!(result.fills[0].quantity, 30);
        assert!(result.fills.iter().all(|f| f.resting.as_ref().unwrap().order_id != late));
    }

    #[test]
    fn test_sell_walks_bids_best_first_and_stops_at_limit() {
        let mut book = OrderBook::new();
        let best = rest(&mut book, "b1", Side::Buy, 10, 99);
        let next = rest(&mut book, "b2", Side::Buy, 10, 98);
        rest(&mut book, "b3", Side::Buy, 10, 90);

        let result = match_incoming(&book, Side::Sell, 25, Some(Money::from_i64(95)));
        let ids: Vec<OrderId> = result
            .fills
            .iter()
            .map(|f| f.resting.as_ref().unwrap().order_id)
            .collect();
        assert_eq!(ids, vec![best, next]);
        assert_eq!(result.matched_quantity(), 20);
        assert_eq!(result.unmatched, 5);
    }

    #[test]
    fn test_market_remainder_falls_back_to_reference() {
        let book = OrderBook::new();
        let mut result = match_incoming(&book, Side::Sell, 50, None);
        assert!(result.fills.is_empty());
        assert_eq!(result.unmatched, 50);

        result.fill_remainder_at(Money::from_i64(100));
        assert_eq!(result.unmatched, 0);
        assert_eq!(result.fills.len(), 1);
        assert!(result.fills[0].resting.is_none());
        assert_eq!(result.gross_value(), Money::from_i64(5_000));
    }

    #[test]
    fn test_no_cross_leaves_everything_unmatched() {
        let mut book = OrderBook::new();
        rest(&mut book, "s1", Side::Sell, 10, 101);
        let result = match_incoming(&book, Side::Buy, 10, Some(Money::from_i64(100)));
        assert!(result.fills.is_empty());
        assert_eq!(result.unmatched, 10);
    }
}
