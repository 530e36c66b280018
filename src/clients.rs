// Outbound dependencies: property management system, NLP service, guest reply channel.
// PMS and NLP calls are wrapped in a circuit breaker owned by the client wrapper.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStateInfo},
    clock::Clock,
    error::BreakerError,
    message::GuestMessage,
    metrics::MetricsSink,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DependencyError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("{service} responded {status_code}: {message}")]
    Response {
        service: String,
        status_code: u16,
        message: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

impl DependencyError {
    /// Failures that say something about the dependency's health and so
    /// count toward its breaker.
    pub fn is_expected(&self) -> bool {
        match self {
            DependencyError::Network(_) | DependencyError::Timeout(_) => true,
            DependencyError::Response { status_code, .. } => {
                *status_code >= 500 || *status_code == 429
            }
            DependencyError::InvalidRequest(_) | DependencyError::Unexpected(_) => false,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            DependencyError::Network(_) => "network",
            DependencyError::Timeout(_) => "timeout",
            DependencyError::Response { status_code, .. } if *status_code >= 500 => "server_error",
            DependencyError::Response { .. } => "client_error",
            DependencyError::InvalidRequest(_) => "invalid_request",
            DependencyError::Unexpected(_) => "unexpected_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayRequest {
    pub room_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub confirmation_code: String,
    pub stay: StayRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    BookRoom(StayRequest),
    CheckAvailability(StayRequest),
    SmallTalk { reply: String },
    Unknown,
}

#[async_trait]
pub trait PmsClient: Send + Sync + 'static {
    async fn check_availability(
        &self,
        tenant_id: &str,
        stay: &StayRequest,
    ) -> Result<bool, DependencyError>;

    /// `idempotency_key` lets the PMS drop duplicate bookings from redelivered
    /// messages.
    async fn create_reservation(
        &self,
        tenant_id: &str,
        stay: &StayRequest,
        idempotency_key: &str,
    ) -> Result<Reservation, DependencyError>;
}

#[async_trait]
pub trait NlpClient: Send + Sync + 'static {
    async fn process(&self, message: &GuestMessage) -> Result<Intent, DependencyError>;
}

#[async_trait]
pub trait ReplySink: Send + Sync + 'static {
    async fn send(&self, message: &GuestMessage, body: &str) -> Result<(), DependencyError>;
}

fn guarded_breaker(service: &str, config: CircuitBreakerConfig) -> CircuitBreaker<DependencyError> {
    CircuitBreaker::new(service, config).with_expected(DependencyError::is_expected)
}

pub struct GuardedPmsClient {
    inner: Arc<dyn PmsClient>,
    breaker: CircuitBreaker<DependencyError>,
}

impl GuardedPmsClient {
    pub fn new(inner: Arc<dyn PmsClient>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: guarded_breaker("pms", config),
        }
    }

    pub fn from_env(inner: Arc<dyn PmsClient>) -> Self {
        Self::new(inner, CircuitBreakerConfig::from_env("pms"))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.breaker = self.breaker.with_clock(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.breaker = self.breaker.with_metrics(metrics);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker<DependencyError> {
        &self.breaker
    }

    pub fn state_info(&self) -> CircuitStateInfo {
        self.breaker.state_info()
    }

    pub async fn check_availability(
        &self,
        tenant_id: &str,
        stay: &StayRequest,
    ) -> Result<bool, BreakerError<DependencyError>> {
        self.breaker
            .call(|| self.inner.check_availability(tenant_id, stay))
            .await
    }

    pub async fn create_reservation(
        &self,
        tenant_id: &str,
        stay: &StayRequest,
        idempotency_key: &str,
    ) -> Result<Reservation, BreakerError<DependencyError>> {
        self.breaker
            .call(|| self.inner.create_reservation(tenant_id, stay, idempotency_key))
            .await
    }
}

pub struct GuardedNlpClient {
    inner: Arc<dyn NlpClient>,
    breaker: CircuitBreaker<DependencyError>,
}

impl GuardedNlpClient {
    pub fn new(inner: Arc<dyn NlpClient>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: guarded_breaker("nlp", config),
        }
    }

    pub fn from_env(inner: Arc<dyn NlpClient>) -> Self {
        Self::new(inner, CircuitBreakerConfig::from_env("nlp"))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.breaker = self.breaker.with_clock(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.breaker = self.breaker.with_metrics(metrics);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker<DependencyError> {
        &self.breaker
    }

    pub fn state_info(&self) -> CircuitStateInfo {
        self.breaker.state_info()
    }

    pub async fn process(&self, message: &GuestMessage) -> Result<Intent, BreakerError<DependencyError>> {
        self.breaker.call(|| self.inner.process(message)).await
    }
}

// Scriptable in-process dependencies for tests and local runs
pub mod mock {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct FailureScript(Mutex<VecDeque<DependencyError>>);

    impl FailureScript {
        fn push(&self, count: usize, error: DependencyError) {
            let mut queue = self.0.lock();
            queue.extend(std::iter::repeat(error).take(count));
        }

        fn next(&self) -> Result<(), DependencyError> {
            match self.0.lock().pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[derive(Debug)]
    pub struct MockPms {
        available: AtomicBool,
        failures: FailureScript,
        calls: AtomicUsize,
        reservations: Mutex<Vec<(String, Reservation)>>,
    }

    impl Default for MockPms {
        fn default() -> Self {
            Self {
                available: AtomicBool::new(true),
                failures: FailureScript::default(),
                calls: AtomicUsize::new(0),
                reservations: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockPms {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        pub fn fail_next_requests(&self, count: usize, error: DependencyError) {
            self.failures.push(count, error);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// `(idempotency_key, reservation)` pairs in booking order.
        pub fn reservations(&self) -> Vec<(String, Reservation)> {
            self.reservations.lock().clone()
        }
    }

    #[async_trait]
    impl PmsClient for MockPms {
        async fn check_availability(
            &self,
            _tenant_id: &str,
            _stay: &StayRequest,
        ) -> Result<bool, DependencyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.failures.next()?;
            Ok(self.available.load(Ordering::SeqCst))
        }

        async fn create_reservation(
            &self,
            _tenant_id: &str,
            stay: &StayRequest,
            idempotency_key: &str,
        ) -> Result<Reservation, DependencyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.failures.next()?;

            let mut reservations = self.reservations.lock();
            if let Some((_, existing)) = reservations.iter().find(|(k, _)| k == idempotency_key) {
                return Ok(existing.clone());
            }
            let reservation = Reservation {
                confirmation_code: format!("CONF-{}", reservations.len() + 1),
                stay: stay.clone(),
            };
            reservations.push((idempotency_key.to_string(), reservation.clone()));
            Ok(reservation)
        }
    }

    #[derive(Debug)]
    pub struct MockNlp {
        intent: Mutex<Intent>,
        failures: FailureScript,
    }

    impl MockNlp {
        pub fn new(intent: Intent) -> Self {
            Self {
                intent: Mutex::new(intent),
                failures: FailureScript::default(),
            }
        }

        pub fn set_intent(&self, intent: Intent) {
            *self.intent.lock() = intent;
        }

        pub fn fail_next_requests(&self, count: usize, error: DependencyError) {
            self.failures.push(count, error);
        }
    }

    #[async_trait]
    impl NlpClient for MockNlp {
        async fn process(&self, _message: &GuestMessage) -> Result<Intent, DependencyError> {
            self.failures.next()?;
            Ok(self.intent.lock().clone())
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingReplies {
        sent: Mutex<Vec<(String, String)>>,
        failures: FailureScript,
    }

    impl RecordingReplies {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_requests(&self, count: usize, error: DependencyError) {
            self.failures.push(count, error);
        }

        /// `(message_id, body)` pairs in send order.
        pub fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ReplySink for RecordingReplies {
        async fn send(&self, message: &GuestMessage, body: &str) -> Result<(), DependencyError> {
            self.failures.next()?;
            self.sent
                .lock()
                .push((message.message_id.clone(), body.to_string()));
            Ok(())
        }
    }
}
