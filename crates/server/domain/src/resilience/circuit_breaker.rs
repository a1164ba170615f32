//! Circuit Breaker for broker operations
//!
//! Counts requests and failures inside a rolling window and trips once the
//! window has seen enough traffic with a high enough failure ratio.
//!
//! # States:
//!
//! - **Closed**: Normal operation, requests pass through and are counted
//! - **Open**: Circuit is tripped, requests fail immediately for the cool-down
//! - **HalfOpen**: Cool-down elapsed, a limited number of probe requests pass

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is tripped, requests fail immediately
    Open,
    /// Probing whether the protected resource recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Requests the window must contain before the ratio is considered
    pub min_requests: u64,
    /// Failure ratio (0.0-1.0) at or above which the circuit opens
    pub failure_ratio_threshold: f64,
    /// Length of the rolling counting window while closed
    pub window: Duration,
    /// Cool-down before an open circuit lets probes through
    pub open_duration: Duration,
    /// Probe requests allowed while half-open; all must succeed to close
    pub half_open_max_requests: u64,
    /// Timeout for individual calls
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 10,
            failure_ratio_threshold: 0.6,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 1,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerWindow {
    state: CircuitState,
    window_started: Instant,
    requests: u64,
    failures: u64,
    opened_at: Option<Instant>,
    half_open_requests: u64,
    half_open_successes: u64,
}

impl BreakerWindow {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            window_started: now,
            requests: 0,
            failures: 0,
            opened_at: None,
            half_open_requests: 0,
            half_open_successes: 0,
        }
    }

    fn reset_counts(&mut self, now: Instant) {
        self.window_started = now;
        self.requests = 0;
        self.failures = 0;
        self.half_open_requests = 0;
        self.half_open_successes = 0;
    }

    fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct BreakerTotals {
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
}

/// Circuit Breaker implementation
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: Arc<CircuitBreakerConfig>,
    window: Arc<Mutex<BreakerWindow>>,
    totals: Arc<BreakerTotals>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: Arc::new(config),
            window: Arc::new(Mutex::new(BreakerWindow::new(Instant::now()))),
            totals: Arc::new(BreakerTotals::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the current circuit state, applying time-based transitions first.
    pub fn state(&self) -> CircuitState {
        let mut window = self.lock();
        self.refresh(&mut window, Instant::now());
        window.state
    }

    fn refresh(&self, window: &mut BreakerWindow, now: Instant) {
        match window.state {
            CircuitState::Open => {
                let cooled_down = window
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.config.open_duration);
                if cooled_down {
                    self.transition(window, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::Closed => {
                if now.duration_since(window.window_started) >= self.config.window {
                    window.reset_counts(now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, window: &mut BreakerWindow, to: CircuitState, now: Instant) {
        let from = window.state;
        if from == to {
            return;
        }
        warn!(
            breaker = %self.name,
            from = %from,
            to = %to,
            requests = window.requests,
            failures = window.failures,
            "Circuit breaker state changed"
        );
        window.state = to;
        window.opened_at = (to == CircuitState::Open).then_some(now);
        window.reset_counts(now);
    }

    /// Reserves a slot for one request, or rejects it.
    fn try_acquire(&self) -> bool {
        let mut window = self.lock();
        let now = Instant::now();
        self.refresh(&mut window, now);

        let allowed = match window.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if window.half_open_requests < self.config.half_open_max_requests {
                    window.half_open_requests += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.totals.rejected_calls.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Checks if a request would currently be allowed through.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                self.lock().half_open_requests < self.config.half_open_max_requests
            }
        }
    }

    fn record_success(&self) {
        self.totals.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut window = self.lock();
        let now = Instant::now();

        match window.state {
            CircuitState::Closed => window.requests += 1,
            CircuitState::HalfOpen => {
                window.half_open_successes += 1;
                if window.half_open_successes >= self.config.half_open_max_requests {
                    self.transition(&mut window, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        self.totals.total_calls.fetch_add(1, Ordering::Relaxed);
        self.totals.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut window = self.lock();
        let now = Instant::now();

        match window.state {
            CircuitState::Closed => {
                window.requests += 1;
                window.failures += 1;
                if window.requests >= self.config.min_requests
                    && window.failure_ratio() >= self.config.failure_ratio_threshold
                {
                    self.transition(&mut window, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut window, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Gets statistics about the circuit breaker, for health reporting.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut window = self.lock();
        self.refresh(&mut window, Instant::now());
        CircuitBreakerStats {
            name: self.name.clone(),
            state: window.state,
            window_requests: window.requests,
            window_failures: window.failures,
            failure_ratio: window.failure_ratio(),
            total_calls: self.totals.total_calls.load(Ordering::Relaxed),
            total_failures: self.totals.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.totals.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Executes an operation with circuit breaker protection.
    ///
    /// # Returns
    ///
    /// `Ok(T)` if the operation ran and succeeded
    /// `Err(CircuitBreakerError::Open)` if the circuit rejected the call
    /// `Err(CircuitBreakerError::Timeout)` if the operation timed out
    /// `Err(CircuitBreakerError::Failed(e))` if the operation failed
    pub async fn execute<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            debug!(breaker = %self.name, "Call rejected by open circuit");
            return Err(CircuitBreakerError::Open);
        }

        match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(CircuitBreakerError::Failed(e))
            }
            Err(_) => {
                self.record_failure();
                Err(CircuitBreakerError::Timeout)
            }
        }
    }
}

/// Statistics about the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Requests counted in the current window
    pub window_requests: u64,
    /// Failures counted in the current window
    pub window_failures: u64,
    /// Failure ratio of the current window (0.0-1.0)
    pub failure_ratio: f64,
    pub total_calls: u64,
    pub total_failures: u64,
    /// Calls short-circuited without running
    pub rejected_calls: u64,
}

/// Error types for circuit breaker operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, requests are being rejected
    #[error("Circuit breaker is open")]
    Open,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Operation failed with an error
    #[error("Operation failed: {0}")]
    Failed(E),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new("test", config)
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.execute(async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_by_default() {
        let breaker = breaker(CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test]
    async fn test_does_not_open_below_min_requests() {
        let breaker = breaker(CircuitBreakerConfig::default());
        for _ in 0..9 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_sixty_percent_of_ten_requests() {
        let breaker = breaker(CircuitBreakerConfig::default());
        for _ in 0..4 {
            succeed(&breaker).await;
        }
        for _ in 0..6 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test]
    async fn test_stays_closed_below_failure_ratio() {
        let breaker = breaker(CircuitBreakerConfig::default());
        for _ in 0..5 {
            succeed(&breaker).await;
        }
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let breaker = breaker(CircuitBreakerConfig {
            min_requests: 1,
            ..Default::default()
        });
        fail(&breaker).await;

        let mut ran = false;
        let result = breaker
            .execute(async {
                ran = true;
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert!(!ran);
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_half_open_after_cool_down_then_closes() {
        let breaker = breaker(CircuitBreakerConfig {
            min_requests: 1,
            open_duration: Duration::from_millis(50),
            ..Default::default()
        });
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let breaker = breaker(CircuitBreakerConfig {
            min_requests: 1,
            open_duration: Duration::from_millis(50),
            ..Default::default()
        });
        fail(&breaker).await;
        sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_window_rolls_over() {
        let breaker = breaker(CircuitBreakerConfig {
            window: Duration::from_millis(50),
            ..Default::default()
        });
        for _ in 0..9 {
            fail(&breaker).await;
        }
        sleep(Duration::from_millis(80)).await;

        // The nine earlier failures fell out of the window.
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().window_requests, 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = breaker(CircuitBreakerConfig {
            call_timeout: Duration::from_millis(10),
            ..Default::default()
        });
        let result = breaker
            .execute(async {
                sleep(Duration::from_millis(100)).await;
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Timeout)));
        assert_eq!(breaker.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_stats() {
        let breaker = breaker(CircuitBreakerConfig::default());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;

        let stats = breaker.stats();
        assert_eq!(stats.name, "test");
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.total_failures, 2);
        assert!((stats.failure_ratio - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
