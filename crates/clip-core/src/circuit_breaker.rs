//! Circuit breaker for object storage calls.
//!
//! # States
//! - Closed: calls pass through, countable failures are tallied
//! - Open: storage assumed down, calls fail fast with [`CircuitOpen`]
//! - Half-Open: cool-off elapsed, a single probe call is let through
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within one cool-off window
//! Open → Half-Open: cool-off elapsed since the circuit opened
//! Half-Open → Closed: probe succeeds (counters reset)
//! Half-Open → Open: probe fails (cool-off restarts)
//! ```
//!
//! Only errors whose [`BreakerFailure::is_countable`] is true move the
//! breaker. Everything else is handed back to the caller untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CircuitConfig;
use crate::error::CircuitOpen;

/// Error types that can flow through a breaker.
pub trait BreakerFailure: From<CircuitOpen> {
    /// True for failures that indicate the backend is unavailable
    fn is_countable(&self) -> bool;
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-resource call counters, updated on every call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub ignored_errors: u64,
    pub short_circuits: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    window_started: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    stats: CircuitStats,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            window_started: None,
            opened_at: None,
            probe_in_flight: false,
            stats: CircuitStats::default(),
        }
    }
}

/// Failure-accounting state machine for one named resource
pub struct CircuitBreaker {
    resource: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// Admission ticket for one call. A probe that never reports back
/// (e.g. the future was dropped) releases the half-open slot on drop.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            resource: resource.into(),
            config: config.clamped(),
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    /// Current state. An open circuit whose cool-off has elapsed reports
    /// `HalfOpen`, since the next call will be let through.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open if self.cool_off_elapsed(&inner, now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Countable failures inside the current window
    pub fn failure_count(&self) -> u32 {
        let now = self.clock.now();
        let inner = self.inner.lock();
        if inner.state == CircuitState::Closed && self.window_expired(&inner, now) {
            0
        } else {
            inner.failure_count
        }
    }

    pub fn stats(&self) -> CircuitStats {
        self.inner.lock().stats
    }

    /// Force the breaker back to Closed, keeping call statistics
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let stats = inner.stats;
        *inner = Inner {
            stats,
            ..Inner::default()
        };
        info!(resource = %self.resource, "Circuit reset");
    }

    /// Run `operation` under the breaker.
    ///
    /// While open, `operation` is not invoked and `E::from(CircuitOpen)` is
    /// returned. Errors from `operation` are always returned unchanged.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        let permit = self.admit().map_err(E::from)?;

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(permit),
            Err(err) if err.is_countable() => self.record_failure(permit),
            Err(_) => self.record_ignored(permit),
        }

        result
    }

    fn admit(&self) -> Result<Permit<'_>, CircuitOpen> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.stats.calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                if self.cool_off_elapsed(&inner, now) {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(resource = %self.resource, "Circuit half-open, probing backend");
                    Ok(self.permit(true))
                } else {
                    let elapsed = inner
                        .opened_at
                        .map(|at| now.saturating_duration_since(at))
                        .unwrap_or_default();
                    Err(self.short_circuit(&mut inner, self.config.cool_off().saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.short_circuit(&mut inner, Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(self.permit(true))
                }
            }
        }
    }

    fn permit(&self, probe: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            probe,
            settled: false,
        }
    }

    fn short_circuit(&self, inner: &mut Inner, retry_after: Duration) -> CircuitOpen {
        inner.stats.short_circuits += 1;
        debug!(resource = %self.resource, ?retry_after, "Circuit open, call short-circuited");
        CircuitOpen {
            resource: self.resource.clone(),
            retry_after,
        }
    }

    fn record_success(&self, mut permit: Permit<'_>) {
        let mut inner = self.inner.lock();
        inner.stats.successes += 1;

        if permit.probe {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.window_started = None;
            inner.opened_at = None;
            inner.probe_in_flight = false;
            info!(resource = %self.resource, "Probe succeeded, circuit closed");
        }

        permit.settled = true;
    }

    fn record_failure(&self, mut permit: Permit<'_>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.stats.failures += 1;

        if permit.probe {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            warn!(resource = %self.resource, "Probe failed, circuit re-opened");
        } else if inner.state == CircuitState::Closed {
            if self.window_expired(&inner, now) {
                inner.failure_count = 0;
                inner.window_started = Some(now);
            }
            inner.failure_count += 1;

            if inner.failure_count >= self.config.threshold {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(
                    resource = %self.resource,
                    failures = inner.failure_count,
                    cool_off = ?self.config.cool_off(),
                    "Failure threshold reached, circuit opened"
                );
            } else {
                debug!(
                    resource = %self.resource,
                    failures = inner.failure_count,
                    threshold = self.config.threshold,
                    "Countable failure recorded"
                );
            }
        }

        permit.settled = true;
    }

    fn record_ignored(&self, mut permit: Permit<'_>) {
        let mut inner = self.inner.lock();
        inner.stats.ignored_errors += 1;

        // The probe slot is freed; the next call probes again.
        if permit.probe {
            inner.probe_in_flight = false;
        }

        permit.settled = true;
    }

    fn window_expired(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .window_started
            .map_or(true, |start| now.saturating_duration_since(start) >= self.config.cool_off())
    }

    fn cool_off_elapsed(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .opened_at
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.cool_off())
    }
}

/// Breakers keyed by resource name.
///
/// Constructed once by the host and shared (via `Arc`) with every component
/// that talks to a protected resource. All callers using the same name share
/// one breaker.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitConfig,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitConfig) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    pub fn with_clock(defaults: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            clock,
        }
    }

    /// Breaker for `resource`, created with the default policy on first use
    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                debug!(resource = %resource, "Registering circuit breaker");
                Arc::new(CircuitBreaker::new(resource, self.defaults, self.clock.clone()))
            })
            .value()
            .clone()
    }

    /// Install a breaker with its own policy, replacing any existing one
    pub fn configure(&self, resource: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(resource, config, self.clock.clone()));
        self.breakers.insert(resource.to_string(), breaker.clone());
        breaker
    }

    /// Run `operation` under the breaker registered for `resource`
    pub async fn call<F, Fut, T, E>(&self, resource: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        let breaker = self.breaker(resource);
        breaker.call(operation).await
    }

    pub fn state(&self, resource: &str) -> Option<CircuitState> {
        self.breakers.get(resource).map(|b| b.state())
    }

    pub fn reset(&self, resource: &str) {
        if let Some(breaker) = self.breakers.get(resource) {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Network,
        Validation,
        Open(CircuitOpen),
    }

    impl From<CircuitOpen> for TestError {
        fn from(err: CircuitOpen) -> Self {
            TestError::Open(err)
        }
    }

    impl BreakerFailure for TestError {
        fn is_countable(&self) -> bool {
            matches!(self, TestError::Network)
        }
    }

    fn breaker(threshold: u32, cool_off_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(
            "object-storage",
            CircuitConfig::new(threshold, Duration::from_secs(cool_off_secs)),
            clock.clone(),
        );
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker, error: TestError) -> Result<(), TestError> {
        breaker.call(move || async move { Err::<(), _>(error) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), TestError> {
        breaker.call(|| async { Ok::<_, TestError>(()) }).await
    }

    #[tokio::test]
    async fn test_closed_passes_through() {
        let (breaker, _) = breaker(10, 30);

        let value = breaker
            .call(|| async { Ok::<_, TestError>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().successes, 1);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_operation() {
        let (breaker, _) = breaker(2, 10);
        let invoked = AtomicUsize::new(0);

        assert_eq!(fail(&breaker, TestError::Network).await, Err(TestError::Network));
        assert_eq!(fail(&breaker, TestError::Network).await, Err(TestError::Network));
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;

        match result {
            Err(TestError::Open(open)) => {
                assert_eq!(open.resource, "object-storage");
                assert_eq!(open.retry_after, Duration::from_secs(10));
            }
            other => panic!("expected short circuit, got {:?}", other),
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().short_circuits, 1);
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let (breaker, clock) = breaker(2, 10);

        fail(&breaker, TestError::Network).await.unwrap_err();
        fail(&breaker, TestError::Network).await.unwrap_err();

        clock.advance(Duration::from_secs(9));
        assert!(matches!(succeed(&breaker).await, Err(TestError::Open(_))));

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        // Counters were reset: one more failure does not reopen
        fail(&breaker, TestError::Network).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_restarts_cool_off() {
        let (breaker, clock) = breaker(2, 10);

        fail(&breaker, TestError::Network).await.unwrap_err();
        fail(&breaker, TestError::Network).await.unwrap_err();

        clock.advance(Duration::from_secs(10));
        assert_eq!(fail(&breaker, TestError::Network).await, Err(TestError::Network));
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(5));
        assert!(matches!(succeed(&breaker).await, Err(TestError::Open(_))));

        clock.advance(Duration::from_secs(5));
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_countable_errors_do_not_move_breaker() {
        let (breaker, _) = breaker(2, 10);

        fail(&breaker, TestError::Network).await.unwrap_err();
        assert_eq!(breaker.failure_count(), 1);

        for _ in 0..5 {
            assert_eq!(
                fail(&breaker, TestError::Validation).await,
                Err(TestError::Validation)
            );
        }

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().ignored_errors, 5);
    }

    #[tokio::test]
    async fn test_non_countable_probe_frees_slot() {
        let (breaker, clock) = breaker(1, 10);

        fail(&breaker, TestError::Network).await.unwrap_err();
        clock.advance(Duration::from_secs(10));

        assert_eq!(
            fail(&breaker, TestError::Validation).await,
            Err(TestError::Validation)
        );
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let (breaker, clock) = breaker(3, 30);

        fail(&breaker, TestError::Network).await.unwrap_err();
        fail(&breaker, TestError::Network).await.unwrap_err();

        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker, TestError::Network).await.unwrap_err();
        fail(&breaker, TestError::Network).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_sub_second_cool_off_opens_and_recovers() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(
            "object-storage",
            CircuitConfig::new(2, Duration::from_millis(500)),
            clock.clone(),
        );

        for _ in 0..2 {
            fail(&breaker, TestError::Network).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        match succeed(&breaker).await {
            Err(TestError::Open(open)) => assert_eq!(open.retry_after, Duration::from_millis(500)),
            other => panic!("expected short circuit, got {:?}", other),
        }

        clock.advance(Duration::from_millis(500));
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_zero_cool_off_still_counts_failures() {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(
            "object-storage",
            CircuitConfig::new(3, Duration::ZERO),
            clock.clone(),
        );

        for _ in 0..3 {
            fail(&breaker, TestError::Network).await.unwrap_err();
        }

        assert_eq!(breaker.config().cool_off(), crate::config::MIN_COOL_OFF);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_every_call_updates_stats() {
        let (breaker, _) = breaker(1, 30);

        succeed(&breaker).await.unwrap();
        fail(&breaker, TestError::Validation).await.unwrap_err();
        fail(&breaker, TestError::Network).await.unwrap_err();
        succeed(&breaker).await.unwrap_err();

        assert_eq!(
            breaker.stats(),
            CircuitStats {
                calls: 4,
                successes: 1,
                failures: 1,
                ignored_errors: 1,
                short_circuits: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let (breaker, _) = breaker(1, 30);

        fail(&breaker, TestError::Network).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_shares_breaker_by_name() {
        let clock = Arc::new(ManualClock::new());
        let registry =
            CircuitBreakerRegistry::with_clock(CircuitConfig::new(1, Duration::from_secs(30)), clock);

        let first = registry
            .call("object-storage", || async { Err::<(), _>(TestError::Network) })
            .await;
        assert_eq!(first, Err(TestError::Network));

        let second = registry
            .call("object-storage", || async { Ok::<_, TestError>(()) })
            .await;
        assert!(matches!(second, Err(TestError::Open(_))));

        let other = registry
            .call("thumbnail-cache", || async { Ok::<_, TestError>(()) })
            .await;
        assert!(other.is_ok());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.state("object-storage"), Some(CircuitState::Open));
        assert_eq!(registry.state("thumbnail-cache"), Some(CircuitState::Closed));
        assert_eq!(registry.state("unknown"), None);

        registry.reset("object-storage");
        assert_eq!(registry.state("object-storage"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_registry_configure_overrides_policy() {
        let registry = CircuitBreakerRegistry::default();
        let breaker = registry.configure("object-storage", CircuitConfig::new(3, Duration::from_secs(5)));

        assert_eq!(breaker.config().threshold, 3);
        assert!(Arc::ptr_eq(&breaker, &registry.breaker("object-storage")));
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let clock = Arc::new(ManualClock::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "object-storage",
            CircuitConfig::new(1_000, Duration::from_secs(30)),
            clock,
        ));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let breaker = breaker.clone();
            tasks.spawn(async move {
                breaker
                    .call(|| async {
                        tokio::task::yield_now().await;
                        Err::<(), _>(TestError::Network)
                    })
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap(), Err(TestError::Network));
        }

        assert_eq!(breaker.failure_count(), 64);
        assert_eq!(breaker.stats().failures, 64);
    }
}
