// Lock audit trail. Forensic only: nothing reads it back to decide anything.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::{
    error::DatabaseError,
    metrics::{names, noop_metrics, MetricsSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Acquired,
    Extended,
    Released,
    Expired,
    Conflict,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Acquired => "acquired",
            AuditEventType::Extended => "extended",
            AuditEventType::Released => "released",
            AuditEventType::Expired => "expired",
            AuditEventType::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockAuditEvent {
    pub lock_key: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    pub tenant_id: String,
}

// Durable append-only storage for audit events
#[async_trait]
pub trait AuditRepository: Send + Sync + 'static {
    async fn insert(&self, event: &LockAuditEvent) -> Result<(), DatabaseError>;
}

/// Fire-and-forget audit capability.
///
/// `record` never fails: implementations deal with their own errors so that a
/// broken audit path can never abort a lock operation.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn record(&self, event: LockAuditEvent);
}

#[derive(Debug, Clone)]
pub struct AuditRetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for AuditRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
        }
    }
}

// Writes to a repository with a bounded number of attempts, then gives up and logs
pub struct RetryingAuditSink {
    repository: Arc<dyn AuditRepository>,
    config: AuditRetryConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl RetryingAuditSink {
    pub fn new(repository: Arc<dyn AuditRepository>, config: AuditRetryConfig) -> Self {
        Self {
            repository,
            config,
            metrics: noop_metrics(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[async_trait]
impl AuditSink for RetryingAuditSink {
    async fn record(&self, event: LockAuditEvent) {
        let attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_delay;

        for attempt in 1..=attempts {
            match self.repository.insert(&event).await {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    warn!(
                        lock_key = %event.lock_key,
                        event_type = event.event_type.as_str(),
                        attempt,
                        error = %e,
                        "Audit write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        lock_key = %event.lock_key,
                        event_type = event.event_type.as_str(),
                        attempts,
                        error = %e,
                        "Audit write abandoned"
                    );
                    self.metrics.increment_counter(
                        names::AUDIT_WRITE_FAILURES,
                        &[("event_type", event.event_type.as_str())],
                    );
                }
            }
        }
    }
}

// In-memory audit log with failure injection
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<LockAuditEvent>>,
    fail_next_writes: AtomicUsize,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<LockAuditEvent> {
        self.events.lock().clone()
    }

    pub fn events_of(&self, event_type: AuditEventType) -> Vec<LockAuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditRepository for MemoryAuditLog {
    async fn insert(&self, event: &LockAuditEvent) -> Result<(), DatabaseError> {
        let injected = self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DatabaseError::Unavailable("injected failure".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;

    fn event() -> LockAuditEvent {
        LockAuditEvent {
            lock_key: "tenant:t1:lock:room:101:2025-01-01:2025-01-03".to_string(),
            event_type: AuditEventType::Acquired,
            timestamp: Utc::now(),
            details: serde_json::json!({ "session_id": "s1" }),
            tenant_id: "t1".to_string(),
        }
    }

    fn sink(log: &Arc<MemoryAuditLog>, metrics: &Arc<InMemoryMetrics>) -> RetryingAuditSink {
        RetryingAuditSink::new(
            log.clone(),
            AuditRetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
            },
        )
        .with_metrics(metrics.clone())
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let log = Arc::new(MemoryAuditLog::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        log.fail_next_writes(2);

        sink(&log, &metrics).record(event()).await;

        assert_eq!(log.events().len(), 1);
        assert_eq!(metrics.counter_total(names::AUDIT_WRITE_FAILURES), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let log = Arc::new(MemoryAuditLog::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        log.fail_next_writes(5);

        sink(&log, &metrics).record(event()).await;

        assert!(log.events().is_empty());
        assert_eq!(
            metrics.counter(names::AUDIT_WRITE_FAILURES, &[("event_type", "acquired")]),
            1
        );
        // remaining injected failures: 5 - 3 attempts
        log.fail_next_writes(0);
        sink(&log, &metrics).record(event()).await;
        assert_eq!(log.events_of(AuditEventType::Acquired).len(), 1);
    }

    #[test]
    fn test_event_type_serializes_snake_case() {
        let json = serde_json::to_string(&AuditEventType::Conflict).unwrap();
        assert_eq!(json, "\"conflict\"");
    }
}
