use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    clock::{elapsed_between, system_clock, Clock},
    config::{env_key, parse_or, seconds_or, EnvLookup, ProcessEnv},
    error::{BreakerError, CircuitOpenError},
    metrics::{names, noop_metrics, MetricsSink},
};

// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub required_successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            required_successes_to_close: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Load `HOTELMSG_CB_{DEPENDENCY}_*` overrides on top of the defaults.
    pub fn from_env(dependency: &str) -> Self {
        Self::from_lookup(dependency, &ProcessEnv)
    }

    pub fn from_lookup<L: EnvLookup + ?Sized>(dependency: &str, env: &L) -> Self {
        let section = format!("cb_{dependency}");
        let defaults = Self::default();
        Self {
            failure_threshold: parse_or(
                env,
                &env_key(&section, "failure_threshold"),
                defaults.failure_threshold,
                |v| *v > 0,
            ),
            recovery_timeout: seconds_or(
                env,
                &env_key(&section, "recovery_timeout_secs"),
                defaults.recovery_timeout,
            ),
            required_successes_to_close: parse_or(
                env,
                &env_key(&section, "required_successes"),
                defaults.required_successes_to_close,
                |v| *v > 0,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

// Snapshot for health endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStateInfo {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count_in_half_open: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub required_successes_to_close: u32,
}

enum State {
    Closed {
        failures: u32,
        last_failure: Option<DateTime<Utc>>,
    },
    Open {
        failures: u32,
        last_failure: DateTime<Utc>,
    },
    HalfOpen {
        failures: u32,
        successes: u32,
        last_failure: DateTime<Utc>,
    },
}

impl State {
    fn kind(&self) -> CircuitState {
        match self {
            State::Closed { .. } => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

type ExpectedFn<E> = dyn Fn(&E) -> bool + Send + Sync;

/// Failure-counting guard around calls to one external dependency.
///
/// Each breaker is owned by the client that talks to the dependency and lives
/// for the whole process. State is never shared between process instances.
/// Only failures accepted by the `expected` predicate count toward opening;
/// anything else is logged as a bug and leaves the state untouched.
pub struct CircuitBreaker<E> {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    is_expected: Box<ExpectedFn<E>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl<E> CircuitBreaker<E> {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(State::Closed {
                failures: 0,
                last_failure: None,
            }),
            is_expected: Box::new(|_: &E| true),
            clock: system_clock(),
            metrics: noop_metrics(),
        }
    }

    pub fn with_expected(mut self, is_expected: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.is_expected = Box::new(is_expected);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self.metrics.set_gauge(
            names::BREAKER_STATE,
            CircuitState::Closed.gauge_value(),
            &[("service", self.service.as_str())],
        );
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().kind()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn state_info(&self) -> CircuitStateInfo {
        let state = self.state.lock();
        let (failure_count, success_count_in_half_open, last_failure_time) = match &*state {
            State::Closed {
                failures,
                last_failure,
            } => (*failures, 0, *last_failure),
            State::Open {
                failures,
                last_failure,
            } => (*failures, 0, Some(*last_failure)),
            State::HalfOpen {
                failures,
                successes,
                last_failure,
            } => (*failures, *successes, Some(*last_failure)),
        };
        CircuitStateInfo {
            service: self.service.clone(),
            state: state.kind(),
            failure_count,
            success_count_in_half_open,
            last_failure_time,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
            required_successes_to_close: self.config.required_successes_to_close,
        }
    }

    /// Run one attempt of `operation` under breaker protection.
    ///
    /// No timeout is applied here; callers bound the operation themselves.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let admitted_in = self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record(admitted_in, "success");
                self.on_success();
                Ok(value)
            }
            Err(error) if (self.is_expected)(&error) => {
                self.record(admitted_in, "failure");
                self.on_failure(&error);
                Err(BreakerError::Failure(error))
            }
            Err(error) => {
                self.record(admitted_in, "unexpected");
                warn!(
                    service = %self.service,
                    error = %error,
                    "Unexpected error from dependency, breaker state unchanged"
                );
                Err(BreakerError::Failure(error))
            }
        }
    }

    /// Force the breaker closed (operator action).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let from = state.kind();
        *state = State::Closed {
            failures: 0,
            last_failure: None,
        };
        if from != CircuitState::Closed {
            self.transitioned(from, CircuitState::Closed);
        }
    }

    // Decide whether a call may run. Returns the state it runs under.
    fn admit(&self) -> Result<CircuitState, CircuitOpenError> {
        let mut state = self.state.lock();
        let State::Open {
            failures,
            last_failure,
        } = *state
        else {
            return Ok(state.kind());
        };

        let now = self.clock.now();
        if elapsed_between(last_failure, now) > self.config.recovery_timeout {
            *state = State::HalfOpen {
                failures,
                successes: 0,
                last_failure,
            };
            self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
            return Ok(CircuitState::HalfOpen);
        }

        drop(state);
        self.record(CircuitState::Open, "rejected");
        debug!(service = %self.service, failures, "Circuit open, rejecting call");
        Err(CircuitOpenError {
            service: self.service.clone(),
            failure_count: failures,
            recovery_timeout: self.config.recovery_timeout,
        })
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures, .. } => *failures = 0,
            State::HalfOpen { successes, .. } => {
                *successes += 1;
                if *successes >= self.config.required_successes_to_close {
                    *state = State::Closed {
                        failures: 0,
                        last_failure: None,
                    };
                    self.transitioned(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            // Late result of a call admitted before the breaker opened
            State::Open { .. } => {}
        }
    }

    fn on_failure(&self, error: &E)
    where
        E: Display,
    {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed {
                failures,
                last_failure,
            } => {
                *failures += 1;
                *last_failure = Some(now);
                if *failures >= self.config.failure_threshold {
                    let failures = *failures;
                    *state = State::Open {
                        failures,
                        last_failure: now,
                    };
                    warn!(
                        service = %self.service,
                        failures,
                        error = %error,
                        "Failure threshold reached"
                    );
                    self.transitioned(CircuitState::Closed, CircuitState::Open);
                }
            }
            State::HalfOpen { failures, .. } => {
                let failures = *failures + 1;
                *state = State::Open {
                    failures,
                    last_failure: now,
                };
                warn!(service = %self.service, error = %error, "Probe failed while half-open");
                self.transitioned(CircuitState::HalfOpen, CircuitState::Open);
            }
            State::Open { .. } => {}
        }
    }

    fn record(&self, state: CircuitState, outcome: &str) {
        self.metrics.increment_counter(
            names::BREAKER_CALLS,
            &[
                ("service", self.service.as_str()),
                ("state", state.as_str()),
                ("outcome", outcome),
            ],
        );
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        info!(
            service = %self.service,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker state change"
        );
        self.metrics.increment_counter(
            names::BREAKER_TRANSITIONS,
            &[
                ("service", self.service.as_str()),
                ("from", from.as_str()),
                ("to", to.as_str()),
            ],
        );
        self.metrics.set_gauge(
            names::BREAKER_STATE,
            to.gauge_value(),
            &[("service", self.service.as_str())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, metrics::InMemoryMetrics};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Down,
        Bug,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn breaker(clock: &ManualClock) -> CircuitBreaker<TestError> {
        CircuitBreaker::new(
            "pms",
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
                required_successes_to_close: 3,
            },
        )
        .with_expected(|e| matches!(e, TestError::Down))
        .with_clock(Arc::new(clock.clone()))
    }

    async fn fail(cb: &CircuitBreaker<TestError>) -> Result<(), BreakerError<TestError>> {
        cb.call(|| async { Err::<(), _>(TestError::Down) }).await
    }

    async fn succeed(cb: &CircuitBreaker<TestError>) -> Result<(), BreakerError<TestError>> {
        cb.call(|| async { Ok::<(), TestError>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let clock = ManualClock::default();
        let cb = breaker(&clock);

        for _ in 0..2 {
            assert_matches!(fail(&cb).await, Err(BreakerError::Failure(TestError::Down)));
            assert!(cb.is_closed());
        }
        assert_matches!(fail(&cb).await, Err(BreakerError::Failure(_)));
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), TestError>(())
            })
            .await;
        assert_matches!(
            result,
            Err(BreakerError::Open(CircuitOpenError { failure_count: 3, .. }))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_when_closed() {
        let clock = ManualClock::default();
        let cb = breaker(&clock);

        fail(&cb).await.ok();
        fail(&cb).await.ok();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state_info().failure_count, 0);

        fail(&cb).await.ok();
        fail(&cb).await.ok();
        assert!(cb.is_closed());
    }

    #[tokio::test]
    async fn test_recovery_timeout_moves_to_half_open() {
        let clock = ManualClock::default();
        let cb = breaker(&clock);
        for _ in 0..3 {
            fail(&cb).await.ok();
        }

        clock.advance(Duration::from_secs(30));
        assert!(succeed(&cb).await.unwrap_err().is_open());

        clock.advance(Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), TestError>(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.state_info().success_count_in_half_open, 1);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_despite_successes() {
        let clock = ManualClock::default();
        let cb = breaker(&clock);
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        clock.advance(Duration::from_secs(31));

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.state_info().last_failure_time, Some(clock.now()));
        assert!(succeed(&cb).await.unwrap_err().is_open());
    }

    #[tokio::test]
    async fn test_required_successes_close_and_reset() {
        let clock = ManualClock::default();
        let cb = breaker(&clock);
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        clock.advance(Duration::from_secs(31));

        for _ in 0..3 {
            succeed(&cb).await.unwrap();
        }
        let info = cb.state_info();
        assert_eq!(info.state, CircuitState::Closed);
        assert_eq!(info.failure_count, 0);
        assert_eq!(info.success_count_in_half_open, 0);
        assert_eq!(info.last_failure_time, None);
    }

    #[tokio::test]
    async fn test_unexpected_errors_do_not_count() {
        let clock = ManualClock::default();
        let metrics = Arc::new(InMemoryMetrics::new());
        let cb = breaker(&clock).with_metrics(metrics.clone());

        for _ in 0..10 {
            let result = cb.call(|| async { Err::<(), _>(TestError::Bug) }).await;
            assert_matches!(result, Err(BreakerError::Failure(TestError::Bug)));
        }
        assert!(cb.is_closed());
        assert_eq!(cb.state_info().failure_count, 0);
        assert_eq!(
            metrics.counter(
                names::BREAKER_CALLS,
                &[("service", "pms"), ("state", "closed"), ("outcome", "unexpected")]
            ),
            10
        );
    }

    #[tokio::test]
    async fn test_metrics_label_pre_call_state() {
        let clock = ManualClock::default();
        let metrics = Arc::new(InMemoryMetrics::new());
        let cb = breaker(&clock).with_metrics(metrics.clone());
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        succeed(&cb).await.ok();

        assert_eq!(
            metrics.counter(
                names::BREAKER_CALLS,
                &[("service", "pms"), ("state", "closed"), ("outcome", "failure")]
            ),
            3
        );
        assert_eq!(
            metrics.counter(
                names::BREAKER_CALLS,
                &[("service", "pms"), ("state", "open"), ("outcome", "rejected")]
            ),
            1
        );
        assert_eq!(
            metrics.gauge(names::BREAKER_STATE, &[("service", "pms")]),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_reset_closes_open_breaker() {
        let clock = ManualClock::default();
        let cb = breaker(&clock);
        for _ in 0..3 {
            fail(&cb).await.ok();
        }
        cb.reset();
        assert!(cb.is_closed());
        succeed(&cb).await.unwrap();
    }

    #[test]
    fn test_config_from_lookup() {
        let lookup = |key: &str| match key {
            "HOTELMSG_CB_NLP_FAILURE_THRESHOLD" => Some("8".to_string()),
            "HOTELMSG_CB_NLP_RECOVERY_TIMEOUT_SECS" => Some("0".to_string()),
            _ => None,
        };
        let config = CircuitBreakerConfig::from_lookup("nlp", &lookup);
        assert_eq!(config.failure_threshold, 8);
        assert_eq!(config.recovery_timeout, Duration::from_secs(60));
        assert_eq!(config.required_successes_to_close, 3);
    }
}
