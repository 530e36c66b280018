use std::time::Duration;

use thiserror::Error;

// Errors raised by the shared key-value store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Wrong value type at key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Invalid counter value at key {0}")]
    InvalidCounter(String),
}

// Errors raised by the durable relational store
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Invalid date range: check-in {check_in} is not before check-out {check_out}")]
    InvalidRange { check_in: String, check_out: String },

    #[error("Malformed lock key: {0}")]
    MalformedKey(String),

    #[error("Lock record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum DlqError {
    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt DLQ entry {dlq_id}: {reason}")]
    CorruptEntry { dlq_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// Synthetic rejection raised while a breaker is open. The operation never ran.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Circuit breaker open for {service} ({failure_count} failures, recovery timeout {recovery_timeout:?})")]
pub struct CircuitOpenError {
    pub service: String,
    pub failure_count: u32,
    pub recovery_timeout: Duration,
}

#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Failure(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            BreakerError::Open(_) => None,
            BreakerError::Failure(e) => Some(e),
        }
    }
}
