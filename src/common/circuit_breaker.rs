//! Circuit breaker for the reference price provider
//!
//! Consecutive failures trip the breaker open; after a cool-down one trial report is
//! let through, and enough successful trials close it again.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Successful trials needed to close it again
    pub success_threshold: u32,
    /// Time spent open before probing
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }

    /// Whether a call may go out now. Moves an open breaker to half-open once
    /// the cool-down has passed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => true,
            BreakerState::Open { since } if since.elapsed() >= self.config.cool_down => {
                info!("Impact circuit half-open, probing provider");
                self.state = BreakerState::HalfOpen { successes: 0 };
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn on_success(&mut self) {
        self.state = match self.state {
            BreakerState::HalfOpen { successes }
                if successes + 1 >= self.config.success_threshold =>
            {
                info!("Impact circuit closed");
                BreakerState::Closed { failures: 0 }
            }
            BreakerState::HalfOpen { successes } => BreakerState::HalfOpen {
                successes: successes + 1,
            },
            BreakerState::Closed { .. } => BreakerState::Closed { failures: 0 },
            open @ BreakerState::Open { .. } => open,
        };
    }

    pub fn on_failure(&mut self) {
        let now = Instant::now();
        self.state = match self.state {
            BreakerState::Closed { failures } if failures + 1 >= self.config.failure_threshold => {
                warn!("Impact circuit opened after {} failures", failures + 1);
                BreakerState::Open { since: now }
            }
            BreakerState::Closed { failures } => BreakerState::Closed {
                failures: failures + 1,
            },
            BreakerState::HalfOpen { .. } => {
                warn!("Impact trial report failed, circuit re-opened");
                BreakerState::Open { since: now }
            }
            BreakerState::Open { .. } => BreakerState::Open { since: now },
        };
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(2));
        cb.on_failure();
        assert_eq!(cb.state(), BreakerState::Closed { failures: 1 });
        cb.on_failure();
        assert!(cb.is_open());
        assert!(!cb.allow());
    }

    #[test]
    fn test_success_clears_failures() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(3));
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        assert_eq!(cb.state(), BreakerState::Closed { failures: 0 });
    }

    #[test]
    fn test_half_open_trial_cycle() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_cool_down(Duration::from_millis(1));
        let mut cb = CircuitBreaker::new(config);

        cb.on_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow());
        assert_eq!(cb.state(), BreakerState::HalfOpen { successes: 0 });

        cb.on_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen { successes: 1 });
        cb.on_success();
        assert_eq!(cb.state(), BreakerState::Closed { failures: 0 });
    }

    #[test]
    fn test_failed_trial_reopens() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_cool_down(Duration::from_millis(1));
        let mut cb = CircuitBreaker::new(config);

        cb.on_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.allow());
        cb.on_failure();
        assert!(cb.is_open());
    }
}
