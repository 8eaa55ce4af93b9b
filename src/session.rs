//! Competition sessions
//!
//! A session scopes orders, books and portfolios, and carries the trading
//! rules every order in it is checked against.

use crate::config::TradingConfig;
use crate::error::AdmissionError;
use crate::settlement::SettlementRules;
use crate::{Money, Quantity, SessionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRules {
    pub commission_rate: Money,
    /// Allowed distance of a limit price from the reference, as a fraction
    pub price_band_pct: Money,
    pub order_ttl_secs: i64,
    pub allow_short_selling: bool,
    pub max_position_size: Option<Quantity>,
    pub starting_cash: Money,
}

impl SessionRules {
    pub fn from_config(trading: &TradingConfig) -> Self {
        Self {
            commission_rate: trading.commission_rate,
            price_band_pct: trading.price_band_pct,
            order_ttl_secs: trading.order_ttl_hours * 3600,
            allow_short_selling: trading.allow_short_selling,
            max_position_size: trading.max_position_size,
            starting_cash: trading.starting_cash,
        }
    }

    pub fn order_ttl(&self) -> Duration {
        Duration::seconds(self.order_ttl_secs)
    }

    /// Inclusive `[lower, upper]` limit-price band around `reference`
    pub fn price_band(&self, reference: Money) -> (Money, Money) {
        let width = reference * self.price_band_pct;
        (reference - width, reference + width)
    }

    pub fn settlement_rules(&self) -> SettlementRules {
        SettlementRules {
            commission_rate: self.commission_rate,
            allow_short_selling: self.allow_short_selling,
        }
    }
}

impl Default for SessionRules {
    fn default() -> Self {
        Self::from_config(&TradingConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub is_open: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub rules: SessionRules,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, name: impl Into<String>, rules: SessionRules) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_open: false,
            starts_at: None,
            ends_at: None,
            rules,
        }
    }

    pub fn with_window(mut self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self.ends_at = Some(ends_at);
        self
    }

    pub fn within_window(&self, now: DateTime<Utc>) -> bool {
        self.starts_at.map_or(true, |start| now >= start)
            && self.ends_at.map_or(true, |end| now < end)
    }

    /// Both halves of the first admission check: open, and inside the window
    pub fn check_trading(&self, now: DateTime<Utc>) -> Result<(), AdmissionError> {
        if !self.is_open {
            return Err(AdmissionError::SessionClosed(self.id.clone()));
        }
        if !self.within_window(now) {
            return Err(AdmissionError::OutsideTradingWindow(self.id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_band_is_ten_percent_by_default() {
        let rules = SessionRules::default();
        let (lower, upper) = rules.price_band(Money::from_i64(100));
        assert_eq!(lower, Money::from_i64(90));
        assert_eq!(upper, Money::from_i64(110));
        assert_eq!(rules.commission_rate, Money::new(dec!(0.001)));
        assert_eq!(rules.order_ttl(), Duration::hours(24));
    }

    #[test]
    fn test_check_trading() {
        let now = Utc::now();
        let mut session = Session::new("s1", "Spring Cup", SessionRules::default());
        assert_eq!(
            session.check_trading(now),
            Err(AdmissionError::SessionClosed(SessionId::new("s1")))
        );

        session.is_open = true;
        assert!(session.check_trading(now).is_ok());

        let session = session.with_window(now + Duration::hours(1), now + Duration::hours(2));
        assert_eq!(
            session.check_trading(now),
            Err(AdmissionError::OutsideTradingWindow(SessionId::new("s1")))
        );
        assert!(session.check_trading(now + Duration::minutes(90)).is_ok());
        assert!(session.check_trading(now + Duration::hours(2)).is_err());
    }
}
