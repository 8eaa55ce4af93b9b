//! Settlement of fills into cash, holdings, and the ledger
//!
//! Every fill settles in two steps:
//! 1. [`SettlementProcessor::prepare`] applies each leg to staged copies of the
//!    affected portfolios and holdings and validates the result.
//! 2. [`SettlementProcessor::commit`] swaps the staged state in.
//!
//! Between the two the engine persists the prepared unit, so both sides of a
//! matched pair land together or not at all.

use crate::error::SettlementError;
use crate::oms::types::{next_trade_id, FillId, Liquidity, OrderId, Trade, TradeId};
use crate::{Money, Quantity, SessionId, Side, Symbol, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// A participant inside one competition session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub session: SessionId,
    pub user: UserId,
}

impl AccountKey {
    pub fn new(session: impl Into<SessionId>, user: impl Into<UserId>) -> Self {
        Self {
            session: session.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HoldingKey {
    account: AccountKey,
    symbol: Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub session: SessionId,
    pub user: UserId,
    pub cash: Money,
    pub realized_pnl: Money,
    pub trade_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.session.clone(), self.user.clone())
    }
}

/// Position in one instrument. Negative quantity is a short position and only
/// appears when the session permits short selling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub session: SessionId,
    pub user: UserId,
    pub symbol: Symbol,
    pub quantity: i64,
    pub average_cost: Money,
    pub cost_basis: Money,
    pub updated_at: DateTime<Utc>,
}

impl Holding {
    fn empty(account: &AccountKey, symbol: &Symbol, now: DateTime<Utc>) -> Self {
        Self {
            session: account.session.clone(),
            user: account.user.clone(),
            symbol: symbol.clone(),
            quantity: 0,
            average_cost: Money::ZERO,
            cost_basis: Money::ZERO,
            updated_at: now,
        }
    }

    pub fn market_value(&self, price: Money) -> Money {
        price * Money::from_i64(self.quantity)
    }

    pub fn unrealized_pnl(&self, price: Money) -> Money {
        (price - self.average_cost) * Money::from_i64(self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Starting cash credited on joining a session
    Deposit,
    Trade,
    /// Cash set aside for an open buy order
    BidFreeze,
    /// Reserved cash handed back
    Refund,
}

impl LedgerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerKind::Deposit => "deposit",
            LedgerKind::Trade => "trade",
            LedgerKind::BidFreeze => "bid_freeze",
            LedgerKind::Refund => "refund",
        }
    }
}

impl std::str::FromStr for LedgerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(LedgerKind::Deposit),
            "trade" => Ok(LedgerKind::Trade),
            "bid_freeze" => Ok(LedgerKind::BidFreeze),
            "refund" => Ok(LedgerKind::Refund),
            other => Err(format!("unknown ledger kind: {other}")),
        }
    }
}

/// Append-only audit record.
///
/// `amount` is signed from the participant's point of view: trades carry the
/// cash delta, a freeze is negative and a refund positive (both against
/// available cash; the cash balance itself is unchanged). `balance_after` is
/// the cash balance once the event is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub session: SessionId,
    pub user: UserId,
    pub kind: LedgerKind,
    pub amount: Money,
    pub balance_after: Money,
    pub order_id: Option<OrderId>,
    pub trade_id: Option<TradeId>,
    pub created_at: DateTime<Utc>,
}

/// Per-session settlement parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettlementRules {
    pub commission_rate: Money,
    pub allow_short_selling: bool,
}

impl SettlementRules {
    pub fn commission(&self, value: Money) -> Money {
        value * self.commission_rate
    }
}

/// One side of a fill, owned by a single account
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementLeg {
    pub account: AccountKey,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Money,
    pub liquidity: Liquidity,
    pub counterparty_order: Option<OrderId>,
}

/// Result of settling one leg
#[derive(Debug, Clone, PartialEq)]
pub struct SettledLeg {
    pub trade: Trade,
    pub ledger_entry: LedgerEntry,
    /// `None` once the holding is flat and removed
    pub holding: Option<Holding>,
    pub portfolio: Portfolio,
}

/// Fully validated settlement waiting to be committed
#[derive(Debug, Clone)]
pub struct PreparedSettlement {
    pub fill_id: FillId,
    pub legs: Vec<SettledLeg>,
    portfolios: HashMap<AccountKey, Portfolio>,
    holdings: HashMap<HoldingKey, Option<Holding>>,
}

impl PreparedSettlement {
    pub fn portfolios(&self) -> impl Iterator<Item = &Portfolio> {
        self.portfolios.values()
    }

    /// Holdings touched by this settlement: `(session, user, symbol, state)`,
    /// with `None` meaning the holding is deleted
    pub fn holdings(
        &self,
    ) -> impl Iterator<Item = (&SessionId, &UserId, &Symbol, Option<&Holding>)> {
        self.holdings.iter().map(|(key, holding)| {
            (
                &key.account.session,
                &key.account.user,
                &key.symbol,
                holding.as_ref(),
            )
        })
    }

    pub fn trades(&self) -> impl Iterator<Item = &Trade> {
        self.legs.iter().map(|leg| &leg.trade)
    }

    pub fn ledger_entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.legs.iter().map(|leg| &leg.ledger_entry)
    }
}

/// Owner of every portfolio, holding and ledger entry
#[derive(Debug, Default)]
pub struct SettlementProcessor {
    portfolios: HashMap<AccountKey, Portfolio>,
    holdings: HashMap<HoldingKey, Holding>,
    ledger: Vec<LedgerEntry>,
    settled_fills: HashSet<FillId>,
    next_ledger_id: u64,
}

impl SettlementProcessor {
    pub fn new() -> Self {
        Self {
            next_ledger_id: 1,
            ..Default::default()
        }
    }

    /// Create a funded portfolio. Returns `None` if the account already exists.
    pub fn open_account(
        &mut self,
        account: &AccountKey,
        starting_cash: Money,
        now: DateTime<Utc>,
    ) -> Option<(Portfolio, LedgerEntry)> {
        if self.portfolios.contains_key(account) {
            return None;
        }
        let portfolio = Portfolio {
            session: account.session.clone(),
            user: account.user.clone(),
            cash: starting_cash,
            realized_pnl: Money::ZERO,
            trade_count: 0,
            updated_at: now,
        };
        self.portfolios.insert(account.clone(), portfolio.clone());
        let entry = self.append_entry(account, LedgerKind::Deposit, starting_cash, None, now);
        Some((portfolio, entry))
    }

    /// Record a reservation movement against available cash
    pub fn record_cash_event(
        &mut self,
        account: &AccountKey,
        kind: LedgerKind,
        amount: Money,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> LedgerEntry {
        self.append_entry(account, kind, amount, Some(order_id), now)
    }

    fn append_entry(
        &mut self,
        account: &AccountKey,
        kind: LedgerKind,
        amount: Money,
        order_id: Option<OrderId>,
        now: DateTime<Utc>,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: self.next_ledger_id,
            session: account.session.clone(),
            user: account.user.clone(),
            kind,
            amount,
            balance_after: self.cash(account),
            order_id,
            trade_id: None,
            created_at: now,
        };
        self.next_ledger_id += 1;
        self.ledger.push(entry.clone());
        entry
    }

    /// Stage every leg of one fill and validate the outcome.
    ///
    /// Legs are applied in order against shared staged state, so a fill where
    /// both legs belong to the same account nets out correctly.
    pub fn prepare(
        &self,
        fill_id: FillId,
        legs: &[SettlementLeg],
        rules: &SettlementRules,
        now: DateTime<Utc>,
    ) -> Result<PreparedSettlement, SettlementError> {
        if self.settled_fills.contains(&fill_id) {
            return Err(SettlementError::DuplicateFill(fill_id));
        }

        let mut portfolios: HashMap<AccountKey, Portfolio> = HashMap::new();
        let mut holdings: HashMap<HoldingKey, Option<Holding>> = HashMap::new();
        let mut settled = Vec::with_capacity(legs.len());
        let mut ledger_id = self.next_ledger_id;

        for leg in legs {
            if !leg.price.is_positive() || leg.quantity == 0 {
                return Err(SettlementError::InvalidPrice {
                    side: leg.side,
                    price: leg.price,
                });
            }

            let portfolio = match portfolios.entry(leg.account.clone()) {
                Entry::Occupied(staged) => staged.into_mut(),
                Entry::Vacant(slot) => {
                    let current = self.portfolios.get(&leg.account).cloned().ok_or_else(|| {
                        SettlementError::MissingPortfolio {
                            session: leg.account.session.clone(),
                            user: leg.account.user.clone(),
                        }
                    })?;
                    slot.insert(current)
                }
            };

            let holding_key = HoldingKey {
                account: leg.account.clone(),
                symbol: leg.symbol.clone(),
            };
            let holding = holdings
                .entry(holding_key.clone())
                .or_insert_with(|| self.holdings.get(&holding_key).cloned())
                .take()
                .unwrap_or_else(|| Holding::empty(&leg.account, &leg.symbol, now));

            let (trade, holding) = apply_leg(portfolio, holding, leg, fill_id, rules, now);

            if portfolio.cash.is_negative() {
                return Err(SettlementError::InsufficientCash {
                    user: leg.account.user.clone(),
                    balance: portfolio.cash,
                });
            }
            if holding.quantity < 0 && !rules.allow_short_selling {
                return Err(SettlementError::NegativeHolding {
                    user: leg.account.user.clone(),
                    symbol: leg.symbol.clone(),
                    quantity: holding.quantity,
                });
            }

            let holding = (holding.quantity != 0).then_some(holding);
            holdings.insert(holding_key, holding.clone());

            let ledger_entry = LedgerEntry {
                id: ledger_id,
                session: leg.account.session.clone(),
                user: leg.account.user.clone(),
                kind: LedgerKind::Trade,
                amount: trade.cash_delta(),
                balance_after: portfolio.cash,
                order_id: Some(leg.order_id),
                trade_id: Some(trade.id),
                created_at: now,
            };
            ledger_id += 1;

            settled.push(SettledLeg {
                trade,
                ledger_entry,
                holding,
                portfolio: portfolio.clone(),
            });
        }

        Ok(PreparedSettlement {
            fill_id,
            legs: settled,
            portfolios,
            holdings,
        })
    }

    /// Swap a prepared settlement into the live state
    pub fn commit(&mut self, prepared: PreparedSettlement) -> Vec<SettledLeg> {
        for (key, portfolio) in prepared.portfolios {
            self.portfolios.insert(key, portfolio);
        }
        for (key, holding) in prepared.holdings {
            match holding {
                Some(holding) => {
                    self.holdings.insert(key, holding);
                }
                None => {
                    if self.holdings.remove(&key).is_some() {
                        debug!("Holding {} {} closed", key.account, key.symbol);
                    }
                }
            }
        }
        for leg in &prepared.legs {
            self.next_ledger_id = self.next_ledger_id.max(leg.ledger_entry.id + 1);
            self.ledger.push(leg.ledger_entry.clone());
        }
        self.settled_fills.insert(prepared.fill_id);
        prepared.legs
    }

    pub fn portfolio(&self, account: &AccountKey) -> Option<&Portfolio> {
        self.portfolios.get(account)
    }

    pub fn cash(&self, account: &AccountKey) -> Money {
        self.portfolios
            .get(account)
            .map(|p| p.cash)
            .unwrap_or(Money::ZERO)
    }

    pub fn holding(&self, account: &AccountKey, symbol: &Symbol) -> Option<&Holding> {
        self.holdings.get(&HoldingKey {
            account: account.clone(),
            symbol: symbol.clone(),
        })
    }

    pub fn holding_quantity(&self, account: &AccountKey, symbol: &Symbol) -> i64 {
        self.holding(account, symbol).map_or(0, |h| h.quantity)
    }

    pub fn holdings_for(&self, account: &AccountKey) -> Vec<Holding> {
        let mut holdings: Vec<Holding> = self
            .holdings
            .iter()
            .filter(|(key, _)| &key.account == account)
            .map(|(_, h)| h.clone())
            .collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        holdings
    }

    pub fn ledger_for(&self, account: &AccountKey) -> Vec<LedgerEntry> {
        self.ledger
            .iter()
            .filter(|e| e.session == account.session && e.user == account.user)
            .cloned()
            .collect()
    }

    pub fn portfolios(&self) -> impl Iterator<Item = &Portfolio> {
        self.portfolios.values()
    }

    pub fn has_account(&self, account: &AccountKey) -> bool {
        self.portfolios.contains_key(account)
    }

    // Recovery hooks: rebuild state loaded from storage

    pub fn restore_portfolio(&mut self, portfolio: Portfolio) {
        self.portfolios.insert(portfolio.key(), portfolio);
    }

    pub fn restore_holding(&mut self, holding: Holding) {
        let key = HoldingKey {
            account: AccountKey::new(holding.session.clone(), holding.user.clone()),
            symbol: holding.symbol.clone(),
        };
        self.holdings.insert(key, holding);
    }

    pub fn restore_ledger(&mut self, entries: Vec<LedgerEntry>) {
        for entry in entries {
            self.next_ledger_id = self.next_ledger_id.max(entry.id + 1);
            self.ledger.push(entry);
        }
    }

    pub fn restore_settled_fill(&mut self, fill_id: FillId) {
        self.settled_fills.insert(fill_id);
    }
}

/// Apply one leg to a portfolio and holding.
///
/// Buys extend a long at weighted-average cost or cover a short; sells reduce
/// a long (realizing `(price − avg) × qty − commission`) or extend a short.
fn apply_leg(
    portfolio: &mut Portfolio,
    mut holding: Holding,
    leg: &SettlementLeg,
    fill_id: FillId,
    rules: &SettlementRules,
    now: DateTime<Utc>,
) -> (Trade, Holding) {
    let value = leg.price.notional(leg.quantity);
    let commission = rules.commission(value);
    let qty = leg.quantity as i64;

    match leg.side {
        Side::Buy => {
            portfolio.cash -= value + commission;

            let covered = if holding.quantity < 0 {
                qty.min(-holding.quantity)
            } else {
                0
            };
            if covered > 0 {
                let pnl = (holding.average_cost - leg.price) * Money::from_i64(covered);
                portfolio.realized_pnl += pnl - commission;
                holding.quantity += covered;
                holding.cost_basis = holding.average_cost * Money::from_i64(holding.quantity);
            }

            let opened = qty - covered;
            if opened > 0 {
                holding.cost_basis += leg.price * Money::from_i64(opened);
                holding.quantity += opened;
                holding.average_cost = holding.cost_basis / Money::from_i64(holding.quantity);
            }
        }
        Side::Sell => {
            portfolio.cash += value - commission;

            let closed = if holding.quantity > 0 {
                qty.min(holding.quantity)
            } else {
                0
            };
            if closed > 0 {
                let pnl = (leg.price - holding.average_cost) * Money::from_i64(closed);
                portfolio.realized_pnl += pnl - commission;
                holding.quantity -= closed;
                holding.cost_basis = holding.average_cost * Money::from_i64(holding.quantity);
            }

            let shorted = qty - closed;
            if shorted > 0 {
                holding.cost_basis -= leg.price * Money::from_i64(shorted);
                holding.quantity -= shorted;
                holding.average_cost = holding.cost_basis / Money::from_i64(holding.quantity);
            }
        }
    }

    if holding.quantity == 0 {
        holding.average_cost = Money::ZERO;
        holding.cost_basis = Money::ZERO;
    }
    holding.updated_at = now;
    portfolio.trade_count += 1;
    portfolio.updated_at = now;

    let trade = Trade {
        id: next_trade_id(),
        fill_id,
        order_id: leg.order_id,
        user: leg.account.user.clone(),
        session: leg.account.session.clone(),
        symbol: leg.symbol.clone(),
        side: leg.side,
        quantity: leg.quantity,
        price: leg.price,
        value,
        commission,
        liquidity: leg.liquidity,
        counterparty_order: leg.counterparty_order,
        executed_at: now,
    };
    (trade, holding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> SettlementRules {
        SettlementRules {
            commission_rate: Money::new(dec!(0.001)),
            allow_short_selling: false,
        }
    }

    fn funded(processor: &mut SettlementProcessor, user: &str, cash: i64) -> AccountKey {
        let key = AccountKey::new("s1", user);
        processor.open_account(&key, Money::from_i64(cash), Utc::now());
        key
    }

    fn leg(
        account: &AccountKey,
        order_id: OrderId,
        side: Side,
        qty: Quantity,
        price: Money,
    ) -> SettlementLeg {
        SettlementLeg {
            account: account.clone(),
            order_id,
            symbol: Symbol::new("ACME"),
            side,
            quantity: qty,
            price,
            liquidity: Liquidity::Taker,
            counterparty_order: None,
        }
    }

    fn settle(
        processor: &mut SettlementProcessor,
        legs: &[SettlementLeg],
        rules: &SettlementRules,
    ) -> Vec<SettledLeg> {
        let fill_id = crate::oms::types::next_fill_id();
        let prepared = processor.prepare(fill_id, legs, rules, Utc::now()).unwrap();
        processor.commit(prepared)
    }

    fn give_shares(
        processor: &mut SettlementProcessor,
        account: &AccountKey,
        qty: i64,
        avg: Money,
    ) {
        processor.restore_holding(Holding {
            session: account.session.clone(),
            user: account.user.clone(),
            symbol: Symbol::new("ACME"),
            quantity: qty,
            average_cost: avg,
            cost_basis: avg * Money::from_i64(qty),
            updated_at: Utc::now(),
        });
    }

    #[test]
    fn test_pair_settlement_conserves_cash_and_shares() {
        let mut p = SettlementProcessor::new();
        let buyer = funded(&mut p, "alice", 100_000);
        let seller = funded(&mut p, "bob", 100_000);
        give_shares(&mut p, &seller, 100, Money::from_i64(90));

        let price = Money::from_i64(105);
        let legs = settle(
            &mut p,
            &[leg(&buyer, 1, Side::Buy, 100, price), leg(&seller, 2, Side::Sell, 100, price)],
            &rules(),
        );
        assert_eq!(legs.len(), 2);

        let buyer_cash = p.cash(&buyer);
        let seller_cash = p.cash(&seller);
        assert_eq!(buyer_cash, Money::new(dec!(89489.5))); // 100000 − 10500 × 1.001
        assert_eq!(seller_cash, Money::new(dec!(110489.5))); // 100000 + 10500 × 0.999

        let buyer_decrease = Money::from_i64(100_000) - buyer_cash;
        let seller_increase = seller_cash - Money::from_i64(100_000);
        let commissions: Money = legs.iter().map(|l| l.trade.commission).sum();
        assert_eq!(buyer_decrease, seller_increase + commissions);

        assert_eq!(p.holding_quantity(&buyer, &Symbol::new("ACME")), 100);
        assert!(p.holding(&seller, &Symbol::new("ACME")).is_none());

        // realized = (105 − 90) × 100 − 10.5
        assert_eq!(p.portfolio(&seller).unwrap().realized_pnl, Money::new(dec!(1489.5)));
        assert_eq!(p.portfolio(&buyer).unwrap().trade_count, 1);
    }

    #[test]
    fn test_weighted_average_cost_on_buys() {
        let mut p = SettlementProcessor::new();
        let alice = funded(&mut p, "alice", 100_000);
        let zero = SettlementRules {
            commission_rate: Money::ZERO,
            allow_short_selling: false,
        };

        settle(&mut p, &[leg(&alice, 1, Side::Buy, 10, Money::from_i64(100))], &zero);
        settle(&mut p, &[leg(&alice, 2, Side::Buy, 30, Money::from_i64(120))], &zero);

        let holding = p.holding(&alice, &Symbol::new("ACME")).unwrap();
        assert_eq!(holding.quantity, 40);
        assert_eq!(holding.average_cost, Money::from_i64(115)); // (1000 + 3600) / 40
        assert_eq!(holding.cost_basis, Money::from_i64(4_600));

        settle(&mut p, &[leg(&alice, 3, Side::Sell, 10, Money::from_i64(125))], &zero);
        let holding = p.holding(&alice, &Symbol::new("ACME")).unwrap();
        assert_eq!(holding.quantity, 30);
        assert_eq!(holding.cost_basis, Money::from_i64(3_450));
        assert_eq!(p.portfolio(&alice).unwrap().realized_pnl, Money::from_i64(100));
    }

    #[test]
    fn test_failed_leg_leaves_both_sides_untouched() {
        let mut p = SettlementProcessor::new();
        let buyer = funded(&mut p, "alice", 1_000);
        let seller = funded(&mut p, "bob", 0);
        give_shares(&mut p, &seller, 100, Money::from_i64(90));

        let price = Money::from_i64(105);
        let err = p
            .prepare(
                7,
                &[leg(&buyer, 1, Side::Buy, 100, price), leg(&seller, 2, Side::Sell, 100, price)],
                &rules(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, SettlementError::InsufficientCash { .. }));
        assert_eq!(p.cash(&buyer), Money::from_i64(1_000));
        assert_eq!(p.holding_quantity(&seller, &Symbol::new("ACME")), 100);
    }

    #[test]
    fn test_short_sale_needs_permission() {
        let mut p = SettlementProcessor::new();
        let alice = funded(&mut p, "alice", 10_000);
        let sell = [leg(&alice, 1, Side::Sell, 5, Money::from_i64(100))];

        let err = p.prepare(11, &sell, &rules(), Utc::now()).unwrap_err();
        assert!(matches!(err, SettlementError::NegativeHolding { quantity: -5, .. }));

        let permissive = SettlementRules {
            allow_short_selling: true,
            ..rules()
        };
        settle(&mut p, &sell, &permissive);
        let holding = p.holding(&alice, &Symbol::new("ACME")).unwrap();
        assert_eq!(holding.quantity, -5);
        assert_eq!(holding.average_cost, Money::from_i64(100));

        // cover at 90: (100 − 90) × 5 − 0.45
        settle(&mut p, &[leg(&alice, 2, Side::Buy, 5, Money::from_i64(90))], &permissive);
        assert!(p.holding(&alice, &Symbol::new("ACME")).is_none());
        assert_eq!(p.portfolio(&alice).unwrap().realized_pnl, Money::new(dec!(49.55)));
    }

    #[test]
    fn test_duplicate_fill_is_refused() {
        let mut p = SettlementProcessor::new();
        let alice = funded(&mut p, "alice", 10_000);
        let legs = [leg(&alice, 1, Side::Buy, 1, Money::from_i64(100))];

        let prepared = p.prepare(42, &legs, &rules(), Utc::now()).unwrap();
        p.commit(prepared);
        let err = p.prepare(42, &legs, &rules(), Utc::now()).unwrap_err();
        assert_eq!(err, SettlementError::DuplicateFill(42));
    }

    #[test]
    fn test_each_leg_writes_one_ledger_entry() {
        let mut p = SettlementProcessor::new();
        let alice = funded(&mut p, "alice", 10_000);
        let legs = settle(&mut p, &[leg(&alice, 1, Side::Buy, 10, Money::from_i64(100))], &rules());

        let ledger = p.ledger_for(&alice);
        assert_eq!(ledger.len(), 2); // deposit + trade
        assert_eq!(ledger[0].kind, LedgerKind::Deposit);
        assert_eq!(ledger[1].kind, LedgerKind::Trade);
        assert_eq!(ledger[1].balance_after, Money::from_i64(8_999));
        assert_eq!(ledger[1].trade_id, Some(legs[0].trade.id));
        assert!(ledger[1].id > ledger[0].id);
    }

    #[test]
    fn test_self_match_nets_on_one_account() {
        let mut p = SettlementProcessor::new();
        let alice = funded(&mut p, "alice", 10_000);
        give_shares(&mut p, &alice, 10, Money::from_i64(100));

        let price = Money::from_i64(100);
        settle(
            &mut p,
            &[leg(&alice, 1, Side::Buy, 10, price), leg(&alice, 2, Side::Sell, 10, price)],
            &rules(),
        );
        assert_eq!(p.holding_quantity(&alice, &Symbol::new("ACME")), 10);
        assert_eq!(p.cash(&alice), Money::from_i64(9_998)); // two 1.0 commissions
    }
}
