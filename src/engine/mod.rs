//! Order lifecycle controller
//!
//! [`Exchange`] admits orders, hands them to the matcher, settles each fill and
//! keeps books, reservations and the order state machine consistent.
//!
//! Locking: one async mutex per (session, instrument) market serializes
//! matching within an instrument. Inside it the account state (portfolios,
//! holdings, ledger, reservations) is taken as a short synchronous critical
//! section. Neither is held across a reference-price call.

mod admin;
mod queries;

pub use admin::RecoveryReport;
pub use queries::{HoldingValuation, OrderFilter, PortfolioSummary, TradeFilter};

use crate::common::RateLimiter;
use crate::config::Config;
use crate::error::{AdmissionError, EngineError, EngineResult, OrderError, SettlementError};
use crate::events::{EngineEvent, EventPublisher};
use crate::oms::types::{next_fill_id, next_priority};
use crate::oms::{
    match_incoming, Fill, Liquidity, MatchResult, Order, OrderBook, OrderBookSnapshot, OrderId,
    OrderRequest, OrderStatus, OrderType, Trade,
};
use crate::pricing::{ImpactReporter, InMemoryPriceProvider, ReferencePriceProvider, TradeImpact};
use crate::reservation::{available_shares, ReservationLedger};
use crate::session::{Session, SessionRules};
use crate::settlement::{AccountKey, LedgerEntry, LedgerKind, SettlementLeg, SettlementProcessor};
use crate::state_manager::{create_state_manager, SqliteStateManager};
use crate::{Money, Quantity, SessionId, Side, Symbol, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

/// Depth of the snapshot attached to book-changed events
const EVENT_BOOK_DEPTH: usize = 10;

/// One order book: a single instrument inside a single session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketKey {
    pub session: SessionId,
    pub symbol: Symbol,
}

impl MarketKey {
    pub fn new(session: impl Into<SessionId>, symbol: impl Into<Symbol>) -> Self {
        Self {
            session: session.into(),
            symbol: symbol.into(),
        }
    }
}

struct Market {
    key: MarketKey,
    book: OrderBook,
    last_trade_price: Option<Money>,
    /// Orders that left the book in a terminal state
    closed: HashMap<OrderId, Order>,
    trades: Vec<Trade>,
}

impl Market {
    fn new(key: MarketKey) -> Self {
        Self {
            key,
            book: OrderBook::new(),
            last_trade_price: None,
            closed: HashMap::new(),
            trades: Vec::new(),
        }
    }

    fn snapshot(&self, depth: usize) -> OrderBookSnapshot {
        self.book
            .snapshot(&self.key.symbol, depth, self.last_trade_price)
    }

    fn book_event(&self) -> EngineEvent {
        EngineEvent::OrderBookChanged {
            session: self.key.session.clone(),
            book: self.snapshot(EVENT_BOOK_DEPTH),
        }
    }

    fn find(&self, order_id: OrderId) -> Option<&Order> {
        self.book
            .get_order(order_id)
            .or_else(|| self.closed.get(&order_id))
    }

    /// The caller's live order, or why it cannot be touched
    fn owned_active(&self, user: &UserId, order_id: OrderId) -> Result<&Order, OrderError> {
        match self.book.get_order(order_id) {
            Some(order) if &order.user != user => Err(OrderError::NotOwner(order_id)),
            Some(order) => Ok(order),
            None => match self.closed.get(&order_id) {
                Some(order) if &order.user != user => Err(OrderError::NotOwner(order_id)),
                Some(order) => Err(OrderError::AlreadyTerminal {
                    id: order_id,
                    status: order.status,
                }),
                None => Err(OrderError::NotFound(order_id)),
            },
        }
    }
}

struct AccountState {
    settlement: SettlementProcessor,
    reservations: ReservationLedger,
}

/// Result of a submission or amendment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub order: Order,
    /// The incoming order's side of every fill
    pub trades: Vec<Trade>,
}

impl Execution {
    pub fn filled_quantity(&self) -> Quantity {
        self.trades.iter().map(|t| t.quantity).sum()
    }
}

/// Side effects gathered under the market lock and released after it
#[derive(Default)]
struct Outcome {
    trades: Vec<Trade>,
    events: Vec<EngineEvent>,
    ledger: Vec<LedgerEntry>,
}

pub struct Exchange {
    config: Config,
    sessions: RwLock<HashMap<SessionId, Session>>,
    instruments: RwLock<HashSet<Symbol>>,
    markets: RwLock<HashMap<MarketKey, Arc<AsyncMutex<Market>>>>,
    order_index: Mutex<HashMap<OrderId, MarketKey>>,
    accounts: Mutex<AccountState>,
    rate_limiter: RateLimiter,
    prices: Arc<dyn ReferencePriceProvider>,
    impact: ImpactReporter,
    events: EventPublisher,
    store: Option<Arc<SqliteStateManager>>,
}

impl Exchange {
    pub fn new(config: Config, prices: Arc<dyn ReferencePriceProvider>) -> Self {
        let impact = ImpactReporter::new(prices.clone(), config.engine.impact_max_retries)
            .with_base_delay(Duration::from_millis(config.engine.impact_retry_base_ms));

        Self {
            sessions: RwLock::new(HashMap::new()),
            instruments: RwLock::new(config.symbols().into_iter().collect()),
            markets: RwLock::new(HashMap::new()),
            order_index: Mutex::new(HashMap::new()),
            accounts: Mutex::new(AccountState {
                settlement: SettlementProcessor::new(),
                reservations: ReservationLedger::new(config.trading.reservation_buffer),
            }),
            rate_limiter: RateLimiter::new(config.rate_limit.limiter_config()),
            impact,
            events: EventPublisher::new(config.engine.event_channel_capacity),
            store: None,
            prices,
            config,
        }
    }

    /// Exchange backed by in-memory reference prices seeded from the
    /// configured instruments, persisting to `storage.state_dir` when set
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let provider = config
            .instruments
            .iter()
            .fold(InMemoryPriceProvider::new(config.engine.impact_factor), |p, i| {
                p.with_price(i.symbol.clone(), i.reference_price)
            });

        let store = match &config.storage.state_dir {
            Some(dir) => Some(Arc::new(create_state_manager(dir)?)),
            None => None,
        };

        let mut exchange = Self::new(config, Arc::new(provider));
        exchange.store = store;
        Ok(exchange)
    }

    pub fn with_store(mut self, store: Arc<SqliteStateManager>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn register_instrument(&self, symbol: impl Into<Symbol>) {
        let mut instruments = self.instruments.write().unwrap_or_else(|e| e.into_inner());
        instruments.insert(symbol.into());
    }

    // -------------------------------------------------------------------------
    // Order entry
    // -------------------------------------------------------------------------

    /// Admit, match and settle one order.
    ///
    /// Admission failures are returned as [`EngineError::Rejected`] and leave
    /// balances, reservations and books untouched.
    pub async fn submit_order(&self, request: OrderRequest) -> EngineResult<Execution> {
        let now = Utc::now();
        let mut order = Order::from_request(&request, now);
        if order.order_type == OrderType::Market {
            order.limit_price = None;
        }

        let (session, reference) = match self.pre_admission(&request, now).await {
            Ok(admitted) => admitted,
            Err(EngineError::Rejected(reason)) => return Err(self.reject(&mut order, reason, now)),
            Err(e) => return Err(e),
        };

        let key = MarketKey::new(request.session.clone(), request.symbol.clone());
        let market = self.market(&key);
        let executed = {
            let mut market = market.lock().await;
            self.admit_and_execute(&mut market, &mut order, &session.rules, reference, now)
        };

        match executed {
            Ok(outcome) => {
                self.events.publish_all(outcome.events);
                self.report_impact(&order, &outcome.trades).await;
                Ok(Execution {
                    order,
                    trades: outcome.trades,
                })
            }
            Err(EngineError::Rejected(reason)) => Err(self.reject(&mut order, reason, now)),
            Err(e) => Err(e),
        }
    }

    /// Checks that need no market state: session, participant, rate limit,
    /// order shape and the price band
    async fn pre_admission(
        &self,
        request: &OrderRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<(Session, Money)> {
        let session = self.session(&request.session)?;
        session.check_trading(now)?;

        if !self.is_instrument(&request.symbol) {
            return Err(AdmissionError::UnknownInstrument(request.symbol.clone()).into());
        }
        let joined = self
            .lock_accounts()
            .settlement
            .has_account(&AccountKey::new(request.session.clone(), request.user.clone()));
        if !joined {
            return Err(AdmissionError::NotParticipant {
                session: request.session.clone(),
                user: request.user.clone(),
            }
            .into());
        }

        if !self.rate_limiter.try_acquire(&request.user) {
            let limits = self.rate_limiter.config();
            return Err(AdmissionError::RateLimited {
                limit: limits.max_submissions,
                window_secs: limits.window.as_secs(),
            }
            .into());
        }

        // Positions are signed, so a quantity must also fit in an i64
        if request.quantity == 0 || i64::try_from(request.quantity).is_err() {
            return Err(AdmissionError::InvalidQuantity.into());
        }
        let limit_price = match request.order_type {
            OrderType::Limit => match request.limit_price {
                Some(price) if price.is_positive() => Some(price),
                _ => return Err(AdmissionError::MissingLimitPrice.into()),
            },
            OrderType::Market => None,
        };

        let reference = self.prices.reference_price(&request.symbol).await?;
        if let Some(price) = limit_price {
            check_band(&session.rules, price, reference)?;
        }
        Ok((session, reference))
    }

    fn admit_and_execute(
        &self,
        market: &mut Market,
        order: &mut Order,
        rules: &SessionRules,
        reference: Money,
        now: DateTime<Utc>,
    ) -> EngineResult<Outcome> {
        let fallback = (order.order_type == OrderType::Market).then_some(reference);
        let mut result =
            match_incoming(&market.book, order.side, order.quantity, order.limit_price);
        if let Some(price) = fallback {
            result.fill_remainder_at(price);
        }

        let mut guard = self.lock_accounts();
        let accounts = &mut *guard;
        let required = check_capacity(accounts, &market.book, order, rules, Some(&result))?;

        order.transition(OrderStatus::Open, now);
        let mut outcome = Outcome::default();
        let previous = order.reserved_cash;
        order.reserved_cash = required;
        outcome
            .ledger
            .extend(sync_reservation(accounts, order, previous, now));
        debug!(
            "Admitted order {}: {} {} {} {} @ {:?}",
            order.id,
            order.user,
            order.side,
            order.quantity,
            order.symbol,
            order.limit_price
        );

        let executed = self.settle_fills(
            market,
            accounts,
            order,
            result.fills,
            rules,
            fallback,
            now,
            &mut outcome,
        );
        if let Err(e) = &executed {
            error!("Execution of order {} aborted: {}", order.id, e);
            if order.is_active() {
                order.transition(OrderStatus::Cancelled, now);
            }
        }
        self.finish_order(market, accounts, order, rules, now, &mut outcome);
        executed?;
        Ok(outcome)
    }

    /// Settle `fills`, then re-match for as long as a resting order turns out
    /// to be unsettleable. Each such order is cancelled out of the book so it
    /// cannot block the market. `fallback` prices any unmatched remainder.
    #[allow(clippy::too_many_arguments)]
    fn settle_fills(
        &self,
        market: &mut Market,
        accounts: &mut AccountState,
        order: &mut Order,
        mut fills: Vec<Fill>,
        rules: &SessionRules,
        fallback: Option<Money>,
        now: DateTime<Utc>,
        outcome: &mut Outcome,
    ) -> EngineResult<()> {
        while let Some(stale) =
            self.execute_fills(market, accounts, order, &fills, rules, now, outcome)?
        {
            self.retire(market, accounts, stale, OrderStatus::Cancelled, now, outcome);
            if !order.is_active() {
                break;
            }
            let mut result = match_incoming(
                &market.book,
                order.side,
                order.remaining_quantity,
                order.limit_price,
            );
            if let Some(price) = fallback {
                result.fill_remainder_at(price);
            }
            fills = result.fills;
        }
        Ok(())
    }

    /// Settle `fills` for `order` one at a time. Each fill is prepared,
    /// persisted and committed as a unit; a failure stops at the failing fill.
    ///
    /// Returns the id of a resting order whose own side of a fill cannot
    /// settle. Fills before it stand; nothing of its fill was applied.
    #[allow(clippy::too_many_arguments)]
    fn execute_fills(
        &self,
        market: &mut Market,
        accounts: &mut AccountState,
        order: &mut Order,
        fills: &[Fill],
        rules: &SessionRules,
        now: DateTime<Utc>,
        outcome: &mut Outcome,
    ) -> EngineResult<Option<OrderId>> {
        let settlement_rules = rules.settlement_rules();

        for fill in fills {
            let commission = settlement_rules.commission(fill.value());

            let mut taker = order.clone();
            taker.apply_fill(fill.quantity, fill.price, commission, now)?;
            taker.reserved_cash = reservation_target(&accounts.reservations, &taker);

            let mut legs = vec![SettlementLeg {
                account: account_of(order),
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity: fill.quantity,
                price: fill.price,
                liquidity: if fill.resting.is_some() {
                    Liquidity::Taker
                } else {
                    Liquidity::Reference
                },
                counterparty_order: fill.resting.as_ref().map(|r| r.order_id),
            }];

            let maker = match &fill.resting {
                Some(resting) => {
                    let mut maker = market.book.get_order(resting.order_id).cloned().ok_or(
                        SettlementError::NegativeRemaining {
                            order_id: resting.order_id,
                            remaining: 0,
                            fill: fill.quantity,
                        },
                    )?;
                    if let Err(e) = maker.apply_fill(fill.quantity, fill.price, commission, now) {
                        error!("Resting order {} cannot take fill: {}", maker.id, e);
                        return Ok(Some(maker.id));
                    }
                    maker.reserved_cash = reservation_target(&accounts.reservations, &maker);
                    legs.push(SettlementLeg {
                        account: account_of(&maker),
                        order_id: maker.id,
                        symbol: maker.symbol.clone(),
                        side: maker.side,
                        quantity: fill.quantity,
                        price: fill.price,
                        liquidity: Liquidity::Maker,
                        counterparty_order: Some(order.id),
                    });
                    Some(maker)
                }
                None => None,
            };

            let fill_id = next_fill_id();
            let prepared = match accounts
                .settlement
                .prepare(fill_id, &legs, &settlement_rules, now)
            {
                Ok(prepared) => prepared,
                Err(e) => match &maker {
                    Some(maker) if maker_at_fault(&e, maker, order) => {
                        error!(
                            "Resting order {} cannot settle against {}: {}",
                            maker.id, order.id, e
                        );
                        return Ok(Some(maker.id));
                    }
                    _ => return Err(e.into()),
                },
            };

            if let Some(store) = &self.store {
                let mut touched = vec![&taker];
                touched.extend(maker.as_ref());
                store.persist_settlement(&prepared, &touched)?;
            }
            let settled = accounts.settlement.commit(prepared);

            info!(
                "Fill {}: {} {} {} @ {} (order {}{})",
                fill_id,
                order.side,
                fill.quantity,
                order.symbol,
                fill.price,
                order.id,
                maker
                    .as_ref()
                    .map(|m| format!(" vs {}", m.id))
                    .unwrap_or_else(|| " vs reference".to_string())
            );

            outcome
                .ledger
                .extend(sync_reservation(accounts, &taker, order.reserved_cash, now));
            *order = taker;

            if let Some(maker) = maker {
                let previous = market
                    .book
                    .get_order(maker.id)
                    .map_or(Money::ZERO, |o| o.reserved_cash);
                outcome
                    .ledger
                    .extend(sync_reservation(accounts, &maker, previous, now));
                outcome.events.push(status_event(&maker));

                if maker.is_active() {
                    if let Some(slot) = market.book.get_order_mut(maker.id) {
                        *slot = maker;
                    }
                } else {
                    market.book.remove_order(maker.id);
                    market.closed.insert(maker.id, maker);
                }
            }

            for leg in settled {
                if leg.trade.order_id == order.id {
                    outcome.trades.push(leg.trade.clone());
                }
                outcome.events.push(EngineEvent::TradeExecuted(leg.trade.clone()));
                market.trades.push(leg.trade);
            }
            market.last_trade_price = Some(fill.price);
        }
        Ok(None)
    }

    /// Rest a live limit order or close out a finished one, then persist it.
    fn finish_order(
        &self,
        market: &mut Market,
        accounts: &mut AccountState,
        order: &mut Order,
        rules: &SessionRules,
        now: DateTime<Utc>,
        outcome: &mut Outcome,
    ) {
        if order.is_active() && order.order_type == OrderType::Limit {
            if order.expires_at.is_none() {
                order.expires_at = Some(order.created_at + rules.order_ttl());
            }
            if let Err(rejected) = market.book.add_order(order.clone()) {
                error!("Order {} could not rest in the book", rejected.id);
            }
        } else {
            if order.is_active() {
                order.transition(OrderStatus::Cancelled, now);
            }
            let previous = order.reserved_cash;
            order.reserved_cash = Money::ZERO;
            outcome
                .ledger
                .extend(sync_reservation(accounts, order, previous, now));
            market.closed.insert(order.id, order.clone());
        }

        self.index_order(order.id, &market.key);
        self.persist(format_args!("order {}", order.id), |s| s.save_order(order));
        for entry in &outcome.ledger {
            self.persist(format_args!("ledger entry {}", entry.id), |s| s.append_ledger(entry));
        }
        outcome.ledger.clear();

        outcome.events.push(status_event(order));
        outcome.events.push(market.book_event());
    }

    fn reject(&self, order: &mut Order, reason: AdmissionError, now: DateTime<Utc>) -> EngineError {
        order.transition(OrderStatus::Rejected, now);
        warn!(
            "Order rejected for {} ({} {} {}): {}",
            order.user, order.side, order.quantity, order.symbol, reason
        );
        self.events.publish(status_event(order));
        EngineError::Rejected(reason)
    }

    async fn report_impact(&self, order: &Order, trades: &[Trade]) {
        let quantity: Quantity = trades.iter().map(|t| t.quantity).sum();
        if quantity == 0 {
            return;
        }
        let value: Money = trades.iter().map(|t| t.value).sum();
        let impact = TradeImpact {
            symbol: order.symbol.clone(),
            side: order.side,
            quantity,
            value,
            execution_price: value / Money::from_qty(quantity),
        };
        if let Err(e) = self.impact.report(&impact).await {
            warn!("Dropped impact report for {}: {}", impact.symbol, e);
        }
    }

    /// Cancel a live order. Fills that already happened stand; only the
    /// remainder is cancelled and its reservation released.
    pub async fn cancel_order(&self, user: &UserId, order_id: OrderId) -> EngineResult<Order> {
        let market = self.market_for_order(order_id)?;
        let (order, events) = {
            let mut market = market.lock().await;
            self.cancel_locked(&mut market, user, order_id)?
        };
        self.events.publish_all(events);
        Ok(order)
    }

    fn cancel_locked(
        &self,
        market: &mut Market,
        user: &UserId,
        order_id: OrderId,
    ) -> Result<(Order, Vec<EngineEvent>), OrderError> {
        market.owned_active(user, order_id)?;

        let mut guard = self.lock_accounts();
        let mut outcome = Outcome::default();
        let order = self
            .retire(market, &mut guard, order_id, OrderStatus::Cancelled, Utc::now(), &mut outcome)
            .ok_or(OrderError::NotFound(order_id))?;
        outcome.events.push(market.book_event());
        info!("Cancelled order {} for {}", order.id, order.user);
        Ok((order, outcome.events))
    }

    /// Take a resting order out of the book into a terminal `status`,
    /// releasing whatever cash it still holds.
    fn retire(
        &self,
        market: &mut Market,
        accounts: &mut AccountState,
        order_id: OrderId,
        status: OrderStatus,
        now: DateTime<Utc>,
        outcome: &mut Outcome,
    ) -> Option<Order> {
        let mut order = market.book.remove_order(order_id)?;
        if !order.transition(status, now) {
            warn!("Order {} cannot move from {} to {}", order.id, order.status, status);
        }

        let previous = order.reserved_cash;
        order.reserved_cash = Money::ZERO;
        if let Some(entry) = sync_reservation(accounts, &order, previous, now) {
            self.persist(format_args!("ledger entry {}", entry.id), |s| s.append_ledger(&entry));
        }
        self.persist(format_args!("order {}", order.id), |s| s.save_order(&order));

        outcome.events.push(status_event(&order));
        market.closed.insert(order.id, order.clone());
        Some(order)
    }

    /// Change price and/or total quantity of a live limit order.
    ///
    /// `new_quantity` is the new total and must exceed what is already
    /// filled. The order loses its time priority and is re-matched at the new
    /// price.
    pub async fn amend_order(
        &self,
        user: &UserId,
        order_id: OrderId,
        new_price: Option<Money>,
        new_quantity: Option<Quantity>,
    ) -> EngineResult<Execution> {
        let now = Utc::now();
        if new_price.is_none() && new_quantity.is_none() {
            return Err(OrderError::InvalidAmendment("nothing to change".into()).into());
        }
        if new_price.is_some_and(|p| !p.is_positive()) {
            return Err(OrderError::InvalidAmendment("price must be positive".into()).into());
        }

        let key = self.market_of(order_id).ok_or(OrderError::NotFound(order_id))?;
        let session = self.session(&key.session).map_err(OrderError::Rejected)?;
        session.check_trading(now).map_err(OrderError::Rejected)?;
        let reference = self.prices.reference_price(&key.symbol).await?;

        let market = self.market_for_order(order_id)?;
        let (order, outcome) = {
            let mut market = market.lock().await;
            self.amend_locked(
                &mut market,
                user,
                order_id,
                new_price,
                new_quantity,
                &session.rules,
                reference,
                now,
            )?
        };

        self.events.publish_all(outcome.events);
        self.report_impact(&order, &outcome.trades).await;
        Ok(Execution {
            order,
            trades: outcome.trades,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn amend_locked(
        &self,
        market: &mut Market,
        user: &UserId,
        order_id: OrderId,
        new_price: Option<Money>,
        new_quantity: Option<Quantity>,
        rules: &SessionRules,
        reference: Money,
        now: DateTime<Utc>,
    ) -> EngineResult<(Order, Outcome)> {
        let current = market.owned_active(user, order_id)?.clone();
        if current.order_type != OrderType::Limit {
            return Err(OrderError::NotAmendable(order_id).into());
        }
        let price = new_price
            .or(current.limit_price)
            .ok_or(OrderError::NotAmendable(order_id))?;
        let total = new_quantity.unwrap_or(current.quantity);
        if total <= current.filled_quantity {
            return Err(OrderError::InvalidAmendment(format!(
                "quantity {} must exceed the {} already filled",
                total, current.filled_quantity
            ))
            .into());
        }
        check_band(rules, price, reference).map_err(OrderError::Rejected)?;

        let mut amended = current.clone();
        amended.limit_price = Some(price);
        amended.quantity = total;
        amended.remaining_quantity = total - current.filled_quantity;

        let mut guard = self.lock_accounts();
        let accounts = &mut *guard;
        let required = match check_capacity(accounts, &market.book, &amended, rules, None) {
            Ok(required) => required,
            Err(AdmissionError::InsufficientFunds { required, available }) => {
                return Err(OrderError::InsufficientFundsForAmend {
                    required: required - current.reserved_cash,
                    available: available - current.reserved_cash,
                }
                .into());
            }
            Err(e) => return Err(OrderError::Rejected(e).into()),
        };

        market.book.remove_order(order_id);
        amended.priority = next_priority();
        amended.updated_at = now;
        amended.reserved_cash = required;

        let mut outcome = Outcome::default();
        outcome
            .ledger
            .extend(sync_reservation(accounts, &amended, current.reserved_cash, now));
        info!(
            "Amended order {}: {} @ {} -> {} @ {}",
            order_id,
            current.quantity,
            current.limit_price.unwrap_or(Money::ZERO),
            total,
            price
        );

        let result: MatchResult =
            match_incoming(&market.book, amended.side, amended.remaining_quantity, Some(price));
        let executed = self.settle_fills(
            market,
            accounts,
            &mut amended,
            result.fills,
            rules,
            None,
            now,
            &mut outcome,
        );
        if let Err(e) = &executed {
            error!("Re-matching of amended order {} aborted: {}", order_id, e);
            if amended.is_active() {
                amended.transition(OrderStatus::Cancelled, now);
            }
        }
        self.finish_order(market, accounts, &mut amended, rules, now, &mut outcome);
        executed?;
        Ok((amended, outcome))
    }

    // -------------------------------------------------------------------------
    // Expiry
    // -------------------------------------------------------------------------

    pub async fn sweep_expired(&self) -> Vec<Order> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expire every resting order whose expiry is at or before `now`.
    /// Running it twice for the same instant changes nothing the second time.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Vec<Order> {
        let mut expired = Vec::new();
        for market in self.all_markets() {
            let events = {
                let mut market = market.lock().await;
                self.sweep_market(&mut market, now, &mut expired)
            };
            self.events.publish_all(events);
        }

        if expired.is_empty() {
            debug!("Expiry sweep found nothing to expire");
        } else {
            info!("Expiry sweep expired {} orders", expired.len());
        }
        expired
    }

    fn sweep_market(
        &self,
        market: &mut Market,
        now: DateTime<Utc>,
        expired: &mut Vec<Order>,
    ) -> Vec<EngineEvent> {
        let ids = market.book.expired_order_ids(now);
        if ids.is_empty() {
            return Vec::new();
        }

        let mut guard = self.lock_accounts();
        let mut outcome = Outcome::default();
        for id in ids {
            let retired =
                self.retire(market, &mut guard, id, OrderStatus::Expired, now, &mut outcome);
            if let Some(order) = retired {
                debug!("Order {} for {} expired", order.id, order.user);
                expired.push(order);
            }
        }
        outcome.events.push(market.book_event());
        outcome.events
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn lock_accounts(&self) -> MutexGuard<'_, AccountState> {
        self.accounts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self, id: &SessionId) -> Result<Session, AdmissionError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| AdmissionError::UnknownSession(id.clone()))
    }

    fn is_instrument(&self, symbol: &Symbol) -> bool {
        let instruments = self.instruments.read().unwrap_or_else(|e| e.into_inner());
        instruments.contains(symbol)
    }

    fn market(&self, key: &MarketKey) -> Arc<AsyncMutex<Market>> {
        if let Some(market) = self.existing_market(key) {
            return market;
        }
        let mut markets = self.markets.write().unwrap_or_else(|e| e.into_inner());
        markets
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(Market::new(key.clone()))))
            .clone()
    }

    fn existing_market(&self, key: &MarketKey) -> Option<Arc<AsyncMutex<Market>>> {
        let markets = self.markets.read().unwrap_or_else(|e| e.into_inner());
        markets.get(key).cloned()
    }

    fn all_markets(&self) -> Vec<Arc<AsyncMutex<Market>>> {
        let markets = self.markets.read().unwrap_or_else(|e| e.into_inner());
        markets.values().cloned().collect()
    }

    fn session_markets(&self, session: &SessionId) -> Vec<Arc<AsyncMutex<Market>>> {
        let markets = self.markets.read().unwrap_or_else(|e| e.into_inner());
        markets
            .iter()
            .filter(|(key, _)| &key.session == session)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn index_order(&self, order_id: OrderId, key: &MarketKey) {
        let mut index = self.order_index.lock().unwrap_or_else(|e| e.into_inner());
        index.entry(order_id).or_insert_with(|| key.clone());
    }

    fn market_of(&self, order_id: OrderId) -> Option<MarketKey> {
        let index = self.order_index.lock().unwrap_or_else(|e| e.into_inner());
        index.get(&order_id).cloned()
    }

    fn market_for_order(&self, order_id: OrderId) -> Result<Arc<AsyncMutex<Market>>, OrderError> {
        self.market_of(order_id)
            .and_then(|key| self.existing_market(&key))
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Run a storage write if a store is attached. Failures are logged; the
    /// in-memory state stays authoritative.
    fn persist(
        &self,
        what: impl Display,
        op: impl FnOnce(&SqliteStateManager) -> anyhow::Result<()>,
    ) {
        if let Some(store) = &self.store {
            if let Err(e) = op(store) {
                error!("Failed to persist {}: {:#}", what, e);
            }
        }
    }
}

fn account_of(order: &Order) -> AccountKey {
    AccountKey::new(order.session.clone(), order.user.clone())
}

fn status_event(order: &Order) -> EngineEvent {
    EngineEvent::OrderStatusChanged {
        order_id: order.id,
        user: order.user.clone(),
        session: order.session.clone(),
        status: order.status,
    }
}

fn check_band(rules: &SessionRules, price: Money, reference: Money) -> Result<(), AdmissionError> {
    let (lower, upper) = rules.price_band(reference);
    if price < lower || price > upper {
        return Err(AdmissionError::PriceOutOfBand { price, lower, upper });
    }
    Ok(())
}

/// True when a settlement failure lies with the resting order's account alone
fn maker_at_fault(error: &SettlementError, maker: &Order, taker: &Order) -> bool {
    let user = match error {
        SettlementError::InsufficientCash { user, .. }
        | SettlementError::NegativeHolding { user, .. }
        | SettlementError::MissingPortfolio { user, .. } => user,
        _ => return false,
    };
    *user == maker.user && maker.user != taker.user
}

/// Funds, position-cap and share checks for `order`'s remaining quantity.
/// Returns the cash the order must hold once admitted (zero for sells).
///
/// The order's own current reservation counts as available, so the same
/// check serves fresh submissions and amendments.
fn check_capacity(
    accounts: &AccountState,
    book: &OrderBook,
    order: &Order,
    rules: &SessionRules,
    estimate: Option<&MatchResult>,
) -> Result<Money, AdmissionError> {
    let account = account_of(order);
    let holding = accounts.settlement.holding_quantity(&account, &order.symbol);
    let remaining =
        i64::try_from(order.remaining_quantity).map_err(|_| AdmissionError::InvalidQuantity)?;

    match order.side {
        Side::Buy => {
            let required = match (order.limit_price, estimate) {
                (Some(price), _) => {
                    accounts.reservations.requirement(price, order.remaining_quantity)
                }
                (None, Some(result)) => accounts.reservations.buffered(result.gross_value()),
                (None, None) => Money::ZERO,
            };
            let available = accounts
                .reservations
                .available_cash(&account, accounts.settlement.cash(&account))
                + order.reserved_cash;
            if required > available {
                return Err(AdmissionError::InsufficientFunds { required, available });
            }

            if let Some(cap) = rules.max_position_size {
                let open_buys = book.open_buy_quantity(&order.user, Some(order.id));
                let prospective = holding
                    .saturating_add(i64::try_from(open_buys).unwrap_or(i64::MAX))
                    .saturating_add(remaining);
                if prospective > i64::try_from(cap).unwrap_or(i64::MAX) {
                    return Err(AdmissionError::PositionLimitExceeded { prospective, cap });
                }
            }
            Ok(required)
        }
        Side::Sell => {
            let open_sells = book.open_sell_quantity(&order.user, Some(order.id));
            let available = available_shares(holding, open_sells);
            if !rules.allow_short_selling {
                if remaining > available {
                    return Err(AdmissionError::InsufficientShares {
                        requested: order.remaining_quantity,
                        available: available.max(0),
                    });
                }
            } else if let Some(cap) = rules.max_position_size {
                let prospective = available.saturating_sub(remaining);
                if prospective.saturating_neg() > i64::try_from(cap).unwrap_or(i64::MAX) {
                    return Err(AdmissionError::PositionLimitExceeded { prospective, cap });
                }
            }
            Ok(Money::ZERO)
        }
    }
}

/// Cash a buy order should hold right now: the full requirement on the
/// remainder for a live limit order, nothing once it is terminal. A live
/// market buy keeps its estimate until it finishes.
fn reservation_target(reservations: &ReservationLedger, order: &Order) -> Money {
    if order.side == Side::Sell || !order.is_active() {
        return Money::ZERO;
    }
    match (order.order_type, order.limit_price) {
        (OrderType::Limit, Some(price)) => {
            reservations.requirement(price, order.remaining_quantity)
        }
        _ => order.reserved_cash,
    }
}

/// Move the reservation ledger from `previous` to `order.reserved_cash`,
/// recording a freeze or refund entry for the difference.
fn sync_reservation(
    accounts: &mut AccountState,
    order: &Order,
    previous: Money,
    now: DateTime<Utc>,
) -> Option<LedgerEntry> {
    let account = account_of(order);
    let target = order.reserved_cash;

    if target > previous {
        let delta = target - previous;
        accounts
            .reservations
            .reserve(&account, &order.symbol, order.side, delta);
        Some(
            accounts
                .settlement
                .record_cash_event(&account, LedgerKind::BidFreeze, -delta, order.id, now),
        )
    } else if target < previous {
        let released = accounts.reservations.release(
            &account,
            &order.symbol,
            order.side,
            previous - target,
        );
        Some(
            accounts
                .settlement
                .record_cash_event(&account, LedgerKind::Refund, released, order.id, now),
        )
    } else {
        None
    }
}
