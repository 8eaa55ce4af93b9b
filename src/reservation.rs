//! Reservation ledger
//!
//! Cash set aside for open buy orders, keyed by participant and instrument.
//! Share availability for sells is not stored: it is derived on demand from
//! the holding minus the remaining quantity of the user's other open sells.

use crate::settlement::AccountKey;
use crate::{Money, Quantity, Side, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReservationKey {
    account: AccountKey,
    symbol: Symbol,
}

/// What a participant can still commit on one side of one instrument
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "amount", rename_all = "lowercase")]
pub enum Availability {
    Cash(Money),
    Shares(i64),
}

#[derive(Debug)]
pub struct ReservationLedger {
    /// Safety margin on top of notional; must cover the commission rate
    buffer: Money,
    cash: HashMap<ReservationKey, Money>,
}

impl ReservationLedger {
    pub fn new(buffer: Money) -> Self {
        Self {
            buffer,
            cash: HashMap::new(),
        }
    }

    pub fn buffer(&self) -> Money {
        self.buffer
    }

    /// Cash needed to back `quantity` at `price`: `price × quantity × (1 + buffer)`.
    ///
    /// Releases go through the same function, so a full round trip returns
    /// exactly what was reserved.
    pub fn requirement(&self, price: Money, quantity: Quantity) -> Money {
        self.buffered(price.notional(quantity))
    }

    /// `value × (1 + buffer)`, used directly for market buys whose cost is
    /// estimated from the book
    pub fn buffered(&self, value: Money) -> Money {
        value * (Money::ONE + self.buffer)
    }

    pub fn reserve(&mut self, account: &AccountKey, symbol: &Symbol, side: Side, amount: Money) {
        if side == Side::Sell || !amount.is_positive() {
            return;
        }
        *self.cash.entry(Self::key(account, symbol)).or_default() += amount;
    }

    /// Release up to `amount`. Releasing more than is outstanding clamps to
    /// zero and logs the mismatch. Returns what was actually released.
    pub fn release(
        &mut self,
        account: &AccountKey,
        symbol: &Symbol,
        side: Side,
        amount: Money,
    ) -> Money {
        if side == Side::Sell || !amount.is_positive() {
            return Money::ZERO;
        }
        let key = Self::key(account, symbol);
        let outstanding = self.cash.get(&key).copied().unwrap_or(Money::ZERO);

        let released = if amount > outstanding {
            warn!(
                "Reservation mismatch for {} {}: releasing {} but only {} outstanding",
                account, symbol, amount, outstanding
            );
            outstanding
        } else {
            amount
        };

        let left = outstanding - released;
        if left.is_zero() {
            self.cash.remove(&key);
        } else {
            self.cash.insert(key, left);
        }
        released
    }

    pub fn reserved(&self, account: &AccountKey, symbol: &Symbol) -> Money {
        self.cash
            .get(&Self::key(account, symbol))
            .copied()
            .unwrap_or(Money::ZERO)
    }

    /// Reserved cash across every instrument in the account's session
    pub fn total_reserved(&self, account: &AccountKey) -> Money {
        self.cash
            .iter()
            .filter(|(key, _)| &key.account == account)
            .map(|(_, amount)| *amount)
            .sum()
    }

    pub fn available_cash(&self, account: &AccountKey, cash: Money) -> Money {
        cash - self.total_reserved(account)
    }

    pub fn clear(&mut self) {
        self.cash.clear();
    }

    fn key(account: &AccountKey, symbol: &Symbol) -> ReservationKey {
        ReservationKey {
            account: account.clone(),
            symbol: symbol.clone(),
        }
    }
}

/// Shares a user can still sell: holding minus what their other open sells
/// already claim
pub fn available_shares(holding: i64, open_sells: Quantity) -> i64 {
    holding.saturating_sub(i64::try_from(open_sells).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> ReservationLedger {
        ReservationLedger::new(Money::new(dec!(0.01)))
    }

    #[test]
    fn test_requirement_includes_buffer() {
        let ledger = ledger();
        assert_eq!(
            ledger.requirement(Money::from_i64(105), 100),
            Money::from_i64(10_605)
        );
    }

    #[test]
    fn test_round_trip_restores_available_cash() {
        let mut ledger = ledger();
        let alice = AccountKey::new("s1", "alice");
        let acme = Symbol::new("ACME");
        let cash = Money::from_i64(50_000);
        let before = ledger.available_cash(&alice, cash);

        let amount = ledger.requirement(Money::from_i64(105), 100);
        ledger.reserve(&alice, &acme, Side::Buy, amount);
        assert_eq!(ledger.available_cash(&alice, cash), cash - amount);

        // partial fill of 40, then cancel of the remaining 60
        let first = ledger.requirement(Money::from_i64(105), 40);
        let rest = ledger.requirement(Money::from_i64(105), 60);
        ledger.release(&alice, &acme, Side::Buy, first);
        ledger.release(&alice, &acme, Side::Buy, rest);

        assert_eq!(ledger.available_cash(&alice, cash), before);
        assert_eq!(ledger.reserved(&alice, &acme), Money::ZERO);
    }

    #[test]
    fn test_over_release_clamps_to_zero() {
        let mut ledger = ledger();
        let alice = AccountKey::new("s1", "alice");
        let acme = Symbol::new("ACME");
        ledger.reserve(&alice, &acme, Side::Buy, Money::from_i64(100));

        let released = ledger.release(&alice, &acme, Side::Buy, Money::from_i64(150));
        assert_eq!(released, Money::from_i64(100));
        assert_eq!(ledger.reserved(&alice, &acme), Money::ZERO);
    }

    #[test]
    fn test_sell_side_is_not_stored() {
        let mut ledger = ledger();
        let alice = AccountKey::new("s1", "alice");
        let acme = Symbol::new("ACME");
        ledger.reserve(&alice, &acme, Side::Sell, Money::from_i64(100));
        assert_eq!(ledger.total_reserved(&alice), Money::ZERO);
    }

    #[test]
    fn test_total_spans_instruments_within_session() {
        let mut ledger = ledger();
        let alice = AccountKey::new("s1", "alice");
        let other_session = AccountKey::new("s2", "alice");
        ledger.reserve(&alice, &Symbol::new("ACME"), Side::Buy, Money::from_i64(100));
        ledger.reserve(&alice, &Symbol::new("INIT"), Side::Buy, Money::from_i64(50));
        ledger.reserve(&other_session, &Symbol::new("ACME"), Side::Buy, Money::from_i64(999));

        assert_eq!(ledger.total_reserved(&alice), Money::from_i64(150));
    }

    #[test]
    fn test_available_shares() {
        assert_eq!(available_shares(100, 30), 70);
        assert_eq!(available_shares(10, 30), -20);
    }
}
