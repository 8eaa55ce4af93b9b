//! Read-side views over books, orders, trades and portfolios

use super::{Exchange, MarketKey};
use crate::error::{AdmissionError, EngineResult};
use crate::oms::{Order, OrderBook, OrderBookSnapshot, OrderId, OrderStatus, Trade};
use crate::pricing::ReferencePriceProvider;
use crate::reservation::{available_shares, Availability};
use crate::settlement::{AccountKey, Holding, LedgerEntry, Portfolio};
use crate::{Money, Quantity, SessionId, Side, Symbol, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub session: Option<SessionId>,
    pub symbol: Option<Symbol>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
}

impl OrderFilter {
    fn matches(&self, order: &Order) -> bool {
        self.session.as_ref().map_or(true, |s| &order.session == s)
            && self.symbol.as_ref().map_or(true, |s| &order.symbol == s)
            && self.status.map_or(true, |s| order.status == s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeFilter {
    pub session: Option<SessionId>,
    pub symbol: Option<Symbol>,
    pub side: Option<Side>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TradeFilter {
    fn matches(&self, trade: &Trade) -> bool {
        self.session.as_ref().map_or(true, |s| &trade.session == s)
            && self.symbol.as_ref().map_or(true, |s| &trade.symbol == s)
            && self.side.map_or(true, |s| trade.side == s)
            && self.since.map_or(true, |t| trade.executed_at >= t)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingValuation {
    pub symbol: Symbol,
    pub quantity: i64,
    pub average_cost: Money,
    pub reference_price: Money,
    pub market_value: Money,
    pub unrealized_pnl: Money,
}

/// Portfolio marked to the current reference prices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub session: SessionId,
    pub user: UserId,
    pub cash: Money,
    pub reserved_cash: Money,
    pub available_cash: Money,
    pub holdings: Vec<HoldingValuation>,
    pub holdings_value: Money,
    pub total_value: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub trade_count: u64,
}

impl Exchange {
    /// Aggregated depth for one market, best levels first
    pub async fn get_order_book(
        &self,
        session: &SessionId,
        symbol: &Symbol,
        depth: usize,
    ) -> EngineResult<OrderBookSnapshot> {
        if !self.is_instrument(symbol) {
            return Err(AdmissionError::UnknownInstrument(symbol.clone()).into());
        }
        let key = MarketKey::new(session.clone(), symbol.clone());
        match self.existing_market(&key) {
            Some(market) => Ok(market.lock().await.snapshot(depth)),
            None => Ok(OrderBook::new().snapshot(symbol, depth, None)),
        }
    }

    pub async fn order(&self, order_id: OrderId) -> Option<Order> {
        let key = self.market_of(order_id)?;
        let market = self.existing_market(&key)?;
        let market = market.lock().await;
        market.find(order_id).cloned()
    }

    /// The user's resting orders across every market, oldest first
    pub async fn open_orders(&self, user: &UserId) -> Vec<Order> {
        let mut orders = Vec::new();
        for market in self.all_markets() {
            let market = market.lock().await;
            orders.extend(market.book.orders_for_user(user).cloned());
        }
        orders.sort_by_key(|o| (o.created_at, o.id));
        orders
    }

    /// Every order the user placed that was admitted, newest first
    pub async fn order_history(&self, user: &UserId, filter: &OrderFilter) -> Vec<Order> {
        let mut orders = Vec::new();
        for market in self.all_markets() {
            let market = market.lock().await;
            orders.extend(
                market
                    .book
                    .orders_for_user(user)
                    .chain(market.closed.values().filter(|o| &o.user == user))
                    .filter(|o| filter.matches(o))
                    .cloned(),
            );
        }
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            orders.truncate(limit);
        }
        orders
    }

    /// The user's executions, newest first
    pub async fn trade_history(&self, user: &UserId, filter: &TradeFilter) -> Vec<Trade> {
        let mut trades = Vec::new();
        for market in self.all_markets() {
            let market = market.lock().await;
            trades.extend(
                market
                    .trades
                    .iter()
                    .filter(|t| &t.user == user && filter.matches(t))
                    .cloned(),
            );
        }
        trades.sort_by(|a, b| b.executed_at.cmp(&a.executed_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            trades.truncate(limit);
        }
        trades
    }

    pub fn portfolio(&self, session: &SessionId, user: &UserId) -> Option<Portfolio> {
        let accounts = self.lock_accounts();
        accounts
            .settlement
            .portfolio(&AccountKey::new(session.clone(), user.clone()))
            .cloned()
    }

    pub fn holdings(&self, session: &SessionId, user: &UserId) -> Vec<Holding> {
        let accounts = self.lock_accounts();
        accounts
            .settlement
            .holdings_for(&AccountKey::new(session.clone(), user.clone()))
    }

    pub fn ledger(&self, session: &SessionId, user: &UserId) -> Vec<LedgerEntry> {
        let accounts = self.lock_accounts();
        accounts
            .settlement
            .ledger_for(&AccountKey::new(session.clone(), user.clone()))
    }

    pub fn reserved_cash(&self, session: &SessionId, user: &UserId) -> Money {
        let accounts = self.lock_accounts();
        accounts
            .reservations
            .total_reserved(&AccountKey::new(session.clone(), user.clone()))
    }

    /// What the user can still commit: spendable cash for buys, unclaimed
    /// shares for sells
    pub async fn available(
        &self,
        session: &SessionId,
        user: &UserId,
        symbol: &Symbol,
        side: Side,
    ) -> Availability {
        let account = AccountKey::new(session.clone(), user.clone());
        match side {
            Side::Buy => {
                let accounts = self.lock_accounts();
                Availability::Cash(
                    accounts
                        .reservations
                        .available_cash(&account, accounts.settlement.cash(&account)),
                )
            }
            Side::Sell => {
                let key = MarketKey::new(session.clone(), symbol.clone());
                let open_sells: Quantity = match self.existing_market(&key) {
                    Some(market) => market.lock().await.book.open_sell_quantity(user, None),
                    None => 0,
                };
                let holding = self.lock_accounts().settlement.holding_quantity(&account, symbol);
                Availability::Shares(available_shares(holding, open_sells))
            }
        }
    }

    /// Cash, reservations and holdings marked at the current reference prices.
    ///
    /// A holding whose reference price cannot be fetched is valued at its
    /// average cost.
    pub async fn portfolio_summary(
        &self,
        session: &SessionId,
        user: &UserId,
    ) -> Option<PortfolioSummary> {
        let account = AccountKey::new(session.clone(), user.clone());
        let (portfolio, holdings, reserved_cash) = {
            let accounts = self.lock_accounts();
            let portfolio = accounts.settlement.portfolio(&account)?.clone();
            (
                portfolio,
                accounts.settlement.holdings_for(&account),
                accounts.reservations.total_reserved(&account),
            )
        };

        let mut valuations = Vec::with_capacity(holdings.len());
        for holding in holdings {
            let reference_price = match self.prices.reference_price(&holding.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!("Valuing {} at cost: {}", holding.symbol, e);
                    holding.average_cost
                }
            };
            valuations.push(HoldingValuation {
                market_value: holding.market_value(reference_price),
                unrealized_pnl: holding.unrealized_pnl(reference_price),
                symbol: holding.symbol,
                quantity: holding.quantity,
                average_cost: holding.average_cost,
                reference_price,
            });
        }

        let holdings_value: Money = valuations.iter().map(|v| v.market_value).sum();
        let unrealized_pnl: Money = valuations.iter().map(|v| v.unrealized_pnl).sum();
        Some(PortfolioSummary {
            session: portfolio.session,
            user: portfolio.user,
            cash: portfolio.cash,
            reserved_cash,
            available_cash: portfolio.cash - reserved_cash,
            holdings: valuations,
            holdings_value,
            total_value: portfolio.cash + holdings_value,
            realized_pnl: portfolio.realized_pnl,
            unrealized_pnl,
            trade_count: portfolio.trade_count,
        })
    }
}
