//! DLQ entry model and its hash encoding.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::{env_key, parse_or, seconds_or, EnvLookup, ProcessEnv},
    error::DlqError,
    message::GuestMessage,
    orchestrator::OrchestratorError,
};

pub const MESSAGE_KEY_PREFIX: &str = "dlq:messages:";
pub const RETRY_INDEX_KEY: &str = "dlq:retry_schedule";
pub const SIZE_KEY: &str = "dlq:size";

pub fn message_key(dlq_id: &str) -> String {
    format!("{MESSAGE_KEY_PREFIX}{dlq_id}")
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retention: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub cleanup_interval: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            max_concurrency: 8,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl DlqConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup<L: EnvLookup + ?Sized>(env: &L) -> Self {
        let d = Self::default();
        Self {
            max_retries: parse_or(env, &env_key("dlq", "max_retries"), d.max_retries, |v| *v > 0),
            retry_backoff_base: seconds_or(env, &env_key("dlq", "backoff_base_secs"), d.retry_backoff_base),
            retention: seconds_or(env, &env_key("dlq", "retention_secs"), d.retention),
            poll_interval: seconds_or(env, &env_key("dlq", "poll_interval_secs"), d.poll_interval),
            batch_size: parse_or(env, &env_key("dlq", "batch_size"), d.batch_size, |v| *v > 0),
            max_concurrency: parse_or(env, &env_key("dlq", "max_concurrency"), d.max_concurrency, |v| *v > 0),
            cleanup_interval: seconds_or(env, &env_key("dlq", "cleanup_interval_secs"), d.cleanup_interval),
        }
    }

    /// `base * 2^retry_count`, saturating.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.retry_backoff_base.saturating_mul(factor)
    }
}

/// Classified description of why processing failed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{error_type}: {error_message}")]
pub struct FailureInfo {
    pub error_type: String,
    pub error_message: String,
}

impl FailureInfo {
    pub fn new(error_type: impl Into<String>, error_message: impl fmt::Display) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.to_string(),
        }
    }

    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        if let Some(info) = error.downcast_ref::<FailureInfo>() {
            return info.clone();
        }
        if let Some(e) = error.downcast_ref::<OrchestratorError>() {
            return Self::new(e.error_type(), format!("{error:#}"));
        }
        Self::new("unclassified", format!("{error:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub message: GuestMessage,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub retry_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
    pub reason: Option<String>,
}

pub(crate) fn epoch_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl DlqEntry {
    pub fn to_fields(&self) -> Result<HashMap<String, String>, DlqError> {
        let mut fields = HashMap::from([
            ("message".to_string(), serde_json::to_string(&self.message)?),
            ("error_type".to_string(), self.error_type.clone()),
            ("error_message".to_string(), self.error_message.clone()),
            ("retry_count".to_string(), self.retry_count.to_string()),
            ("first_failed_at".to_string(), encode_time(self.first_failed_at)),
            ("retry_at".to_string(), encode_time(self.retry_at)),
            ("correlation_id".to_string(), self.correlation_id.clone()),
        ]);
        if let Some(at) = self.last_retry_at {
            fields.insert("last_retry_at".to_string(), encode_time(at));
        }
        if let Some(reason) = &self.reason {
            fields.insert("reason".to_string(), reason.clone());
        }
        Ok(fields)
    }

    pub fn from_fields(dlq_id: &str, fields: &HashMap<String, String>) -> Result<Self, DlqError> {
        let corrupt = |reason: String| DlqError::CorruptEntry {
            dlq_id: dlq_id.to_string(),
            reason,
        };
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| corrupt(format!("missing field {name}")))
        };
        let time = |name: &str| -> Result<DateTime<Utc>, DlqError> {
            DateTime::parse_from_rfc3339(field(name)?)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad {name}: {e}")))
        };

        let message: GuestMessage = serde_json::from_str(field("message")?)
            .map_err(|e| corrupt(format!("bad message payload: {e}")))?;
        let retry_count = field("retry_count")?
            .parse::<u32>()
            .map_err(|e| corrupt(format!("bad retry_count: {e}")))?;
        let last_retry_at = if fields.contains_key("last_retry_at") {
            Some(time("last_retry_at")?)
        } else {
            None
        };

        Ok(Self {
            dlq_id: dlq_id.to_string(),
            message,
            error_type: field("error_type")?.clone(),
            error_message: field("error_message")?.clone(),
            retry_count,
            first_failed_at: time("first_failed_at")?,
            retry_at: time("retry_at")?,
            last_retry_at,
            correlation_id: field("correlation_id")?.clone(),
            reason: fields.get("reason").cloned(),
        })
    }
}

// Monitoring snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqHealth {
    pub queue_size: u64,
    pub oldest_message_age_secs: Option<u64>,
    pub due_now: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    Rescheduled,
    PermanentlyFailed,
    Missing,
}

impl RetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Succeeded => "succeeded",
            RetryOutcome::Rescheduled => "rescheduled",
            RetryOutcome::PermanentlyFailed => "permanent_failure",
            RetryOutcome::Missing => "missing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::fixtures::guest_message;
    use assert_matches::assert_matches;

    fn entry() -> DlqEntry {
        let now = Utc::now();
        DlqEntry {
            dlq_id: "d1".to_string(),
            message: guest_message("m1"),
            error_type: "pms_unavailable".to_string(),
            error_message: "503".to_string(),
            retry_count: 1,
            first_failed_at: now,
            retry_at: now + chrono::Duration::seconds(120),
            last_retry_at: None,
            correlation_id: "corr-m1".to_string(),
            reason: Some("dependency_failure".to_string()),
        }
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let config = DlqConfig::default();
        let delays: Vec<u64> = (0..4).map(|n| config.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![60, 120, 240, 480]);
        assert_eq!(config.backoff(64), Duration::from_secs(60).saturating_mul(u32::MAX));
    }

    #[test]
    fn test_hash_fields_preserve_entry() {
        let original = entry();
        let fields = original.to_fields().unwrap();
        assert!(!fields.contains_key("last_retry_at"));

        let decoded = DlqEntry::from_fields("d1", &fields).unwrap();
        assert_eq!(decoded.message, original.message);
        assert_eq!(decoded.retry_count, 1);
        assert_eq!(decoded.reason.as_deref(), Some("dependency_failure"));
        assert_eq!(
            decoded.retry_at.timestamp_millis(),
            original.retry_at.timestamp_millis()
        );
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let mut fields = entry().to_fields().unwrap();
        fields.remove("message");
        assert_matches!(
            DlqEntry::from_fields("d1", &fields),
            Err(DlqError::CorruptEntry { .. })
        );
    }

    #[test]
    fn test_failure_info_from_anyhow() {
        let classified = anyhow::Error::new(FailureInfo::new("nlp_timeout", "took too long"));
        assert_eq!(FailureInfo::from_anyhow(&classified).error_type, "nlp_timeout");

        let other = anyhow::anyhow!("boom");
        let info = FailureInfo::from_anyhow(&other);
        assert_eq!(info.error_type, "unclassified");
        assert_eq!(info.error_message, "boom");
    }
}
