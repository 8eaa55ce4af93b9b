//! Session administration, recovery and background expiry

use super::{AccountState, Exchange, MarketKey, Outcome};
use crate::error::{AdmissionError, EngineResult};
use crate::oms::types::ensure_ids_above;
use crate::oms::{Order, OrderStatus};
use crate::session::{Session, SessionRules};
use crate::settlement::{AccountKey, Portfolio};
use crate::{SessionId, Side, UserId};
use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What [`Exchange::recover`] rebuilt from storage
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub sessions: usize,
    pub portfolios: usize,
    pub holdings: usize,
    pub resting_orders: usize,
    pub closed_orders: usize,
    pub trades: usize,
    pub ledger_entries: usize,
}

impl Exchange {
    /// Register a session with the configured default rules. It starts closed.
    pub fn create_session(&self, id: impl Into<SessionId>, name: impl Into<String>) -> Session {
        let session = Session::new(id, name, SessionRules::from_config(&self.config.trading));
        self.insert_session(session.clone());
        session
    }

    /// Register or replace a session
    pub fn insert_session(&self, session: Session) {
        self.persist(format_args!("session {}", session.id), |s| s.save_session(&session));
        info!("Session {} ({}) registered, open={}", session.id, session.name, session.is_open);
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.id.clone(), session);
    }

    pub fn session_info(&self, id: &SessionId) -> Option<Session> {
        self.session(id).ok()
    }

    pub fn open_session(&self, id: &SessionId) -> EngineResult<Session> {
        let session = self.set_open(id, true)?;
        info!("Session {} opened", id);
        Ok(session)
    }

    /// Close a session to new orders and cancel everything still resting in it
    pub async fn close_session(&self, id: &SessionId) -> EngineResult<Vec<Order>> {
        self.set_open(id, false)?;

        let mut cancelled = Vec::new();
        for market in self.session_markets(id) {
            let events = {
                let mut market = market.lock().await;
                let ids: Vec<_> = market.book.all_orders().map(|o| o.id).collect();
                if ids.is_empty() {
                    continue;
                }
                let mut guard = self.lock_accounts();
                let mut outcome = Outcome::default();
                for order_id in ids {
                    cancelled.extend(self.retire(
                        &mut market,
                        &mut guard,
                        order_id,
                        OrderStatus::Cancelled,
                        Utc::now(),
                        &mut outcome,
                    ));
                }
                outcome.events.push(market.book_event());
                outcome.events
            };
            self.events.publish_all(events);
        }

        info!("Session {} closed, {} resting orders cancelled", id, cancelled.len());
        Ok(cancelled)
    }

    fn set_open(&self, id: &SessionId, open: bool) -> Result<Session, AdmissionError> {
        let session = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| AdmissionError::UnknownSession(id.clone()))?;
            session.is_open = open;
            session.clone()
        };
        self.persist(format_args!("session {}", id), |s| s.save_session(&session));
        Ok(session)
    }

    /// Give `user` a funded portfolio in `session`. Joining twice returns the
    /// existing portfolio unchanged.
    pub fn join_session(&self, session: &SessionId, user: &UserId) -> EngineResult<Portfolio> {
        let rules = self.session(session)?.rules;
        let account = AccountKey::new(session.clone(), user.clone());

        let mut accounts = self.lock_accounts();
        match accounts
            .settlement
            .open_account(&account, rules.starting_cash, Utc::now())
        {
            Some((portfolio, deposit)) => {
                self.persist(format_args!("portfolio {}", account), |s| {
                    s.save_portfolio(&portfolio)?;
                    s.append_ledger(&deposit)
                });
                info!("{} joined session {} with {}", user, session, rules.starting_cash);
                Ok(portfolio)
            }
            None => {
                debug!("{} already joined session {}", user, session);
                accounts
                    .settlement
                    .portfolio(&account)
                    .cloned()
                    .ok_or_else(|| AdmissionError::NotParticipant {
                        session: session.clone(),
                        user: user.clone(),
                    }
                    .into())
            }
        }
    }

    /// Rebuild sessions, balances, books and reservations from the attached
    /// store. Call once, before accepting orders.
    pub async fn recover(&self) -> anyhow::Result<RecoveryReport> {
        let Some(store) = self.store.clone() else {
            warn!("No state store attached, nothing to recover");
            return Ok(RecoveryReport::default());
        };

        let sessions = store.load_sessions().context("Failed to load sessions")?;
        let portfolios = store.load_portfolios().context("Failed to load portfolios")?;
        let holdings = store.load_holdings().context("Failed to load holdings")?;
        let ledger = store.load_ledger().context("Failed to load ledger")?;
        let orders = store.load_orders(false).context("Failed to load orders")?;
        let trades = store.load_trades().context("Failed to load trades")?;

        let mut report = RecoveryReport {
            sessions: sessions.len(),
            portfolios: portfolios.len(),
            holdings: holdings.len(),
            trades: trades.len(),
            ledger_entries: ledger.len(),
            ..Default::default()
        };

        {
            let mut map = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            for session in sessions {
                map.insert(session.id.clone(), session);
            }
        }

        let fills: HashSet<u64> = trades.iter().map(|t| t.fill_id).collect();
        {
            let mut accounts = self.lock_accounts();
            let AccountState {
                settlement,
                reservations,
            } = &mut *accounts;
            reservations.clear();
            for portfolio in portfolios {
                settlement.restore_portfolio(portfolio);
            }
            for holding in holdings {
                settlement.restore_holding(holding);
            }
            settlement.restore_ledger(ledger);
            for fill_id in &fills {
                settlement.restore_settled_fill(*fill_id);
            }
            for order in orders.iter().filter(|o| o.is_active() && o.side == Side::Buy) {
                let account = AccountKey::new(order.session.clone(), order.user.clone());
                reservations.reserve(&account, &order.symbol, order.side, order.reserved_cash);
            }
        }

        let max_order = orders.iter().map(|o| o.id).max().unwrap_or(0);
        let max_priority = orders.iter().map(|o| o.priority).max().unwrap_or(0);
        let max_trade = trades.iter().map(|t| t.id).max().unwrap_or(0);
        let max_fill = fills.iter().copied().max().unwrap_or(0);

        for order in orders {
            self.register_instrument(order.symbol.clone());
            let key = MarketKey::new(order.session.clone(), order.symbol.clone());
            let market = self.market(&key);
            let mut market = market.lock().await;
            self.index_order(order.id, &key);

            if order.is_active() {
                if let Err(order) = market.book.add_order(order) {
                    error!("Recovered order {} cannot rest, keeping it closed", order.id);
                    market.closed.insert(order.id, order);
                } else {
                    report.resting_orders += 1;
                }
            } else {
                report.closed_orders += 1;
                market.closed.insert(order.id, order);
            }
        }

        for trade in trades {
            let key = MarketKey::new(trade.session.clone(), trade.symbol.clone());
            let market = self.market(&key);
            let mut market = market.lock().await;
            market.last_trade_price = Some(trade.price);
            market.trades.push(trade);
        }

        ensure_ids_above(max_order, max_trade, max_fill, max_priority);
        info!(
            "Recovered {} sessions, {} portfolios, {} resting orders, {} trades",
            report.sessions, report.portfolios, report.resting_orders, report.trades
        );
        Ok(report)
    }

    /// Sweep expired orders every `interval` until `shutdown` flips to true
    pub fn spawn_expiry_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Expiry sweeper started (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_expired().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Expiry sweeper stopped");
        })
    }
}
