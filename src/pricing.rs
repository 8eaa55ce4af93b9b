//! Reference prices and post-trade impact reporting
//!
//! The engine never forms prices itself. It reads the current reference price
//! for band checks and market-order fallback, and after each execution reports
//! the traded volume back so the provider can move its price.

use crate::common::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::PricingError;
use crate::{Money, Quantity, Side, Symbol};
use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Volume traded by one incoming order, reported after it executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeImpact {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub value: Money,
    pub execution_price: Money,
}

#[async_trait]
pub trait ReferencePriceProvider: Send + Sync {
    async fn reference_price(&self, symbol: &Symbol) -> Result<Money, PricingError>;

    async fn report_trade_impact(&self, impact: &TradeImpact) -> Result<(), PricingError>;
}

/// Reference prices held in memory, moved by reported volume.
///
/// Each report shifts the price by `factor × signed quantity` as a fraction,
/// clamped to `±max_impact`. Buys push the price up, sells push it down.
#[derive(Debug)]
pub struct InMemoryPriceProvider {
    prices: RwLock<HashMap<Symbol, Money>>,
    impact_factor: Money,
    max_impact: Money,
}

impl InMemoryPriceProvider {
    pub fn new(impact_factor: Money) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            impact_factor,
            max_impact: Money::new(dec!(0.05)),
        }
    }

    pub fn with_max_impact(mut self, max_impact: Money) -> Self {
        self.max_impact = max_impact;
        self
    }

    pub fn with_price(self, symbol: impl Into<Symbol>, price: Money) -> Self {
        self.set_reference_price(symbol.into(), price);
        self
    }

    pub fn set_reference_price(&self, symbol: Symbol, price: Money) {
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        prices.insert(symbol, price);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Money> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        prices.get(symbol).copied()
    }

    fn impact_fraction(&self, side: Side, quantity: Quantity) -> Money {
        let signed = match side {
            Side::Buy => Money::from_qty(quantity),
            Side::Sell => -Money::from_qty(quantity),
        };
        (self.impact_factor * signed)
            .max(-self.max_impact)
            .min(self.max_impact)
    }
}

#[async_trait]
impl ReferencePriceProvider for InMemoryPriceProvider {
    async fn reference_price(&self, symbol: &Symbol) -> Result<Money, PricingError> {
        self.get(symbol)
            .ok_or_else(|| PricingError::UnknownInstrument(symbol.clone()))
    }

    async fn report_trade_impact(&self, impact: &TradeImpact) -> Result<(), PricingError> {
        let fraction = self.impact_fraction(impact.side, impact.quantity);
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        let price = prices
            .get_mut(&impact.symbol)
            .ok_or_else(|| PricingError::UnknownInstrument(impact.symbol.clone()))?;

        let moved = (*price * (Money::ONE + fraction)).round_dp(4);
        debug!(
            "{} reference {} -> {} after {} {} @ {}",
            impact.symbol, price, moved, impact.side, impact.quantity, impact.execution_price
        );
        *price = moved;
        Ok(())
    }
}

/// Delivers impact reports with retry and exponential backoff, behind a
/// circuit breaker so a dead provider is not hammered on every trade.
pub struct ImpactReporter {
    provider: Arc<dyn ReferencePriceProvider>,
    circuit_breaker: Mutex<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl ImpactReporter {
    pub fn new(provider: Arc<dyn ReferencePriceProvider>, max_retries: u32) -> Self {
        Self {
            provider,
            circuit_breaker: Mutex::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            max_retries,
            base_delay: Duration::from_millis(100),
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Mutex::new(CircuitBreaker::new(config));
        self
    }

    pub async fn report(&self, impact: &TradeImpact) -> Result<(), PricingError> {
        {
            let mut cb = self.circuit_breaker.lock().await;
            if !cb.allow() {
                return Err(PricingError::CircuitOpen);
            }
        }

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1x, 2x, 4x the base delay...
                let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
                debug!("Retrying impact report after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            match self.provider.report_trade_impact(impact).await {
                Ok(()) => {
                    self.circuit_breaker.lock().await.on_success();
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Impact report for {} failed (attempt {}/{}): {}",
                        impact.symbol,
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.circuit_breaker.lock().await.on_failure();
        Err(last_error.unwrap_or_else(|| PricingError::Unavailable("impact report failed".into())))
    }

    pub async fn circuit_open(&self) -> bool {
        self.circuit_breaker.lock().await.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReferencePriceProvider for FlakyProvider {
        async fn reference_price(&self, _symbol: &Symbol) -> Result<Money, PricingError> {
            Ok(Money::from_i64(100))
        }

        async fn report_trade_impact(&self, _impact: &TradeImpact) -> Result<(), PricingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(PricingError::Unavailable("timeout".into()));
            }
            Ok(())
        }
    }

    fn impact(side: Side, quantity: Quantity) -> TradeImpact {
        TradeImpact {
            symbol: Symbol::new("ACME"),
            side,
            quantity,
            value: Money::from_qty(quantity) * Money::from_i64(100),
            execution_price: Money::from_i64(100),
        }
    }

    #[tokio::test]
    async fn test_buy_volume_moves_price_up() {
        let provider = InMemoryPriceProvider::new(Money::new(dec!(0.0001)))
            .with_price("ACME", Money::from_i64(100));
        provider.report_trade_impact(&impact(Side::Buy, 100)).await.unwrap();
        assert_eq!(provider.get(&Symbol::new("ACME")), Some(Money::from_i64(101)));

        provider.report_trade_impact(&impact(Side::Sell, 100)).await.unwrap();
        assert_eq!(provider.get(&Symbol::new("ACME")), Some(Money::new(dec!(99.99))));
    }

    #[tokio::test]
    async fn test_impact_is_clamped() {
        let provider = InMemoryPriceProvider::new(Money::new(dec!(0.0001)))
            .with_max_impact(Money::new(dec!(0.02)))
            .with_price("ACME", Money::from_i64(100));
        provider.report_trade_impact(&impact(Side::Buy, 1_000_000)).await.unwrap();
        assert_eq!(provider.get(&Symbol::new("ACME")), Some(Money::from_i64(102)));
    }

    #[tokio::test]
    async fn test_unknown_instrument() {
        let provider = InMemoryPriceProvider::new(Money::ZERO);
        let err = provider.reference_price(&Symbol::new("NOPE")).await.unwrap_err();
        assert_eq!(err, PricingError::UnknownInstrument(Symbol::new("NOPE")));
    }

    #[tokio::test]
    async fn test_reporter_retries_then_succeeds() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let reporter =
            ImpactReporter::new(provider.clone(), 3).with_base_delay(Duration::from_millis(1));

        reporter.report(&impact(Side::Buy, 10)).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(!reporter.circuit_open().await);
    }

    #[tokio::test]
    async fn test_reporter_opens_circuit_after_exhausting_retries() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let reporter = ImpactReporter::new(provider.clone(), 1)
            .with_base_delay(Duration::from_millis(1))
            .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(1));

        assert!(reporter.report(&impact(Side::Buy, 10)).await.is_err());
        assert!(reporter.circuit_open().await);

        let err = reporter.report(&impact(Side::Buy, 10)).await.unwrap_err();
        assert_eq!(err, PricingError::CircuitOpen);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
    #[tokio::test]
    async fn test_backoff_saturates_with_many_retries() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let reporter = ImpactReporter::new(provider.clone(), 40).with_base_delay(Duration::ZERO);

        let err = reporter.report(&impact(Side::Sell, 5)).await.unwrap_err();
        assert_eq!(err, PricingError::Unavailable("timeout".into()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 41);
    }
}
