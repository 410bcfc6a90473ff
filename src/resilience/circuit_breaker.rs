//! Circuit breaker for downstream protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: downstream assumed down, requests fail fast
//! - Half-Open: testing if downstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: after reset timeout
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! ```
//!
//! # Design Decisions
//! - The orchestrator only talks to the `CircuitBreaker` port; outcomes are
//!   reported manually rather than by wrapping the call
//! - Default breakers are per downstream host (not global)
//! - 5xx responses count as failures
//! - Single probe in Half-Open (prevents hammering recovering downstream)
//! - Notifications are advisory: a panicking breaker is logged and ignored

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::http::message::ResponseHead;

/// The breaker refused the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitBreakerOpen {
    pub name: String,
}

/// Capability the orchestrator consults around a downstream call.
pub trait CircuitBreaker: Send + Sync + fmt::Debug {
    /// Ask whether a call may start.
    fn check_permission(&self) -> Result<(), CircuitBreakerOpen>;

    /// The downstream produced a response.
    fn record_success(&self, response: &ResponseHead);

    /// The downstream call failed.
    fn record_failure(&self, error: &(dyn std::error::Error + Send + Sync));
}

/// Which breaker, if any, guards one downstream call.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerSelection {
    /// Explicit breaker; `None` means the default breaker for the host.
    pub breaker: Option<Arc<dyn CircuitBreaker>>,
    /// No bookkeeping at all. Wins over `breaker`.
    pub disabled: bool,
}

impl CircuitBreakerSelection {
    pub fn disabled() -> Self {
        Self {
            breaker: None,
            disabled: true,
        }
    }

    pub fn custom(breaker: Arc<dyn CircuitBreaker>) -> Self {
        Self {
            breaker: Some(breaker),
            disabled: false,
        }
    }

    /// The breaker to notify for a call to `host`.
    pub fn resolve(&self, registry: &BreakerRegistry, host: &str) -> Option<Arc<dyn CircuitBreaker>> {
        if self.disabled {
            return None;
        }
        Some(match &self.breaker {
            Some(custom) => Arc::clone(custom),
            None => registry.for_host(host),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Opens after N consecutive failures, probes once after a reset timeout.
#[derive(Debug)]
pub struct ConsecutiveFailureBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl ConsecutiveFailureBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_millis(config.reset_timeout_ms),
        )
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "Circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        }
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn check_permission(&self) -> Result<(), CircuitBreakerOpen> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open, allowing probe");
                    Ok(())
                } else {
                    Err(CircuitBreakerOpen { name: self.name.clone() })
                }
            }
            BreakerState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(())
            }
            BreakerState::HalfOpen => Err(CircuitBreakerOpen { name: self.name.clone() }),
        }
    }

    fn record_success(&self, response: &ResponseHead) {
        if response.status.is_server_error() {
            self.on_failure();
        } else {
            self.on_success();
        }
    }

    fn record_failure(&self, _error: &(dyn std::error::Error + Send + Sync)) {
        self.on_failure();
    }
}

/// Default breakers shared per downstream host.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<dyn CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// The default breaker for `host`, created on first use.
    pub fn for_host(&self, host: &str) -> Arc<dyn CircuitBreaker> {
        let key = host.to_ascii_lowercase();
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                let breaker: Arc<dyn CircuitBreaker> =
                    Arc::new(ConsecutiveFailureBreaker::from_config(key, &self.config));
                breaker
            })
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

/// Report a response to `breaker`; a panicking breaker is logged and ignored.
pub fn notify_success(breaker: &dyn CircuitBreaker, response: &ResponseHead) {
    if catch_unwind(AssertUnwindSafe(|| breaker.record_success(response))).is_err() {
        tracing::error!(breaker = ?breaker, "Circuit breaker panicked recording success, ignoring");
    }
}

/// Report a failure to `breaker`; a panicking breaker is logged and ignored.
pub fn notify_failure(breaker: &dyn CircuitBreaker, error: &(dyn std::error::Error + Send + Sync)) {
    if catch_unwind(AssertUnwindSafe(|| breaker.record_failure(error))).is_err() {
        tracing::error!(breaker = ?breaker, error = %error, "Circuit breaker panicked recording failure, ignoring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[derive(Debug)]
    struct Boom;
    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }
    impl std::error::Error for Boom {}

    #[derive(Debug)]
    struct PanickingBreaker;
    impl CircuitBreaker for PanickingBreaker {
        fn check_permission(&self) -> Result<(), CircuitBreakerOpen> {
            Ok(())
        }
        fn record_success(&self, _: &ResponseHead) {
            panic!("success hook failed");
        }
        fn record_failure(&self, _: &(dyn std::error::Error + Send + Sync)) {
            panic!("failure hook failed");
        }
    }

    #[test]
    fn opens_after_threshold() {
        let breaker = ConsecutiveFailureBreaker::new("svc", 3, Duration::from_secs(10));
        for _ in 0..2 {
            breaker.record_failure(&Boom);
            assert!(breaker.check_permission().is_ok());
        }
        breaker.record_failure(&Boom);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.check_permission(), Err(CircuitBreakerOpen { name: "svc".into() }));
    }

    #[test]
    fn server_error_response_counts_as_failure() {
        let breaker = ConsecutiveFailureBreaker::new("svc", 1, Duration::from_secs(10));
        breaker.record_success(&ResponseHead::new(StatusCode::OK));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_success(&ResponseHead::new(StatusCode::BAD_GATEWAY));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_single_probe() {
        let breaker = ConsecutiveFailureBreaker::new("svc", 1, Duration::from_millis(100));
        breaker.record_failure(&Boom);
        assert!(breaker.check_permission().is_err());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(breaker.check_permission().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.check_permission().is_err());

        breaker.record_success(&ResponseHead::new(StatusCode::OK));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breaker = ConsecutiveFailureBreaker::new("svc", 5, Duration::from_millis(100));
        for _ in 0..5 {
            breaker.record_failure(&Boom);
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.check_permission().is_ok());
        breaker.record_failure(&Boom);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn selection_policy() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default());
        let custom: Arc<dyn CircuitBreaker> = Arc::new(ConsecutiveFailureBreaker::new("custom", 1, Duration::ZERO));

        assert!(CircuitBreakerSelection::disabled().resolve(&registry, "a").is_none());

        let disabled_custom = CircuitBreakerSelection {
            breaker: Some(custom.clone()),
            disabled: true,
        };
        assert!(disabled_custom.resolve(&registry, "a").is_none());

        let chosen = CircuitBreakerSelection::custom(custom.clone()).resolve(&registry, "a").unwrap();
        assert!(Arc::ptr_eq(&chosen, &custom));

        let default_a = CircuitBreakerSelection::default().resolve(&registry, "A").unwrap();
        let again = CircuitBreakerSelection::default().resolve(&registry, "a").unwrap();
        assert!(Arc::ptr_eq(&default_a, &again));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn panicking_breaker_is_contained() {
        notify_success(&PanickingBreaker, &ResponseHead::new(StatusCode::OK));
        notify_failure(&PanickingBreaker, &Boom);
    }
}
