// Resilience core for the hotel guest-messaging backend: circuit breakers around
// outbound dependencies, distributed room locks, and a dead-letter queue with
// scheduled retries.

pub mod audit;
pub mod circuit_breaker;
pub mod clients;
pub mod clock;
pub mod config;
pub mod dlq;
pub mod error;
pub mod lock_manager;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod postgres;
pub mod store;

// Re-export key types for convenience
pub use audit::{AuditEventType, AuditSink, LockAuditEvent, MemoryAuditLog, RetryingAuditSink};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStateInfo};
pub use clients::{DependencyError, GuardedNlpClient, GuardedPmsClient, NlpClient, PmsClient, ReplySink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dlq::{DeadLetterQueue, DlqConfig, DlqEntry, DlqHealth, DlqWorker, FailureInfo};
pub use error::{BreakerError, CircuitOpenError, DatabaseError, DlqError, LockError, StoreError};
pub use lock_manager::{AcquireRequest, DistributedLockManager, LockConfig, LockKey, UnparsablePolicy};
pub use message::{GuestMessage, MessageProcessor};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use orchestrator::{InboundOutcome, MessageOrchestrator, OrchestratorError};
pub use postgres::{DatabaseConfig, PgKeyValueStore};
pub use store::{KeyValueStore, MemoryStore};
