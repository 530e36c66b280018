use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Inbound guest message, already parsed from its channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestMessage {
    pub message_id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub channel: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Orchestrator entry point. The DLQ resubmits failed messages through it.
///
/// Implementations must tolerate being handed the same message more than once:
/// delivery is at-least-once.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    async fn process(&self, message: &GuestMessage) -> anyhow::Result<()>;
}
