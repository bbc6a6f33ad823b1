use crate::config::CircuitBreakerConfig;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// One instance per upstream — an unhealthy endpoint is isolated without
/// affecting its siblings on the same route. All transitions happen under a
/// single mutex; the hot path is one uncontended lock per attempt.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    max_failures: u32,
    reset_timeout: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    /// A probe is in flight while HalfOpen; all other callers are denied.
    half_open_trial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                half_open_trial: false,
            }),
            max_failures: config.max_failures.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
        }
    }

    /// Whether the next attempt may hit the network.
    ///
    /// While Open, the first caller after `reset_timeout` has elapsed wins
    /// the HalfOpen probe; everyone else is denied until the probe reports
    /// back through `on_success` / `on_failure`.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_trial = true;
                    return true;
                }
                false
            }
            BreakerState::HalfOpen => {
                if inner.half_open_trial {
                    return false;
                }
                inner.half_open_trial = true;
                true
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.half_open_trial = false;
                tracing::info!("circuit_breaker: closed (probe succeeded)");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.consecutive_failures = self.max_failures;
                inner.half_open_trial = false;
                tracing::warn!("circuit_breaker: re-opened (probe failed)");
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.max_failures {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        "circuit_breaker: opened (after {} consecutive failures)",
                        inner.consecutive_failures
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}
