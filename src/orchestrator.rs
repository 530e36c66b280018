use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    audit::AuditSink,
    clients::{DependencyError, GuardedNlpClient, GuardedPmsClient, Intent, ReplySink, StayRequest},
    clock::{system_clock, Clock},
    dlq::{DeadLetterQueue, FailureInfo},
    error::{BreakerError, LockError},
    lock_manager::{AcquireRequest, DistributedLockManager, LockConfig},
    message::{GuestMessage, MessageProcessor},
    metrics::{noop_metrics, MetricsSink},
    store::KeyValueStore,
};

pub const DEGRADED_REPLY: &str =
    "Thanks for your message! We're experiencing a short delay and will get back to you shortly.";
pub const FALLBACK_REPLY: &str =
    "Thanks for your message! A member of our team will get back to you shortly.";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("NLP service call failed: {0}")]
    Nlp(BreakerError<DependencyError>),

    #[error("PMS call failed: {0}")]
    Pms(BreakerError<DependencyError>),

    #[error("Room lock failed: {0}")]
    Lock(#[from] LockError),

    #[error("Reply delivery failed: {0}")]
    Reply(DependencyError),
}

impl OrchestratorError {
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::Nlp(BreakerError::Open(_)) => "nlp_circuit_open",
            OrchestratorError::Nlp(BreakerError::Failure(_)) => "nlp_failure",
            OrchestratorError::Pms(BreakerError::Open(_)) => "pms_circuit_open",
            OrchestratorError::Pms(BreakerError::Failure(_)) => "pms_failure",
            OrchestratorError::Lock(LockError::Store(_)) => "lock_store",
            OrchestratorError::Lock(LockError::InvalidRange { .. }) => "invalid_stay",
            OrchestratorError::Lock(_) => "lock_record",
            OrchestratorError::Reply(_) => "reply_delivery",
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        match self {
            OrchestratorError::Nlp(e) | OrchestratorError::Pms(e) => e.is_open(),
            _ => false,
        }
    }

    /// Whether a later attempt could plausibly succeed. Of the lock errors
    /// only a store outage qualifies; a bad range or record fails every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Nlp(BreakerError::Failure(e))
            | OrchestratorError::Pms(BreakerError::Failure(e))
            | OrchestratorError::Reply(e) => e.is_expected(),
            OrchestratorError::Nlp(BreakerError::Open(_))
            | OrchestratorError::Pms(BreakerError::Open(_))
            | OrchestratorError::Lock(LockError::Store(_)) => true,
            OrchestratorError::Lock(_) => false,
        }
    }
}

/// What the inbound front door reports back. Every variant means the message
/// was accepted; nothing is surfaced to the sender as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    Processed,
    /// Failed, queued for retry.
    Deferred { dlq_id: String },
    /// A dependency circuit was open: a holding reply was sent and the
    /// message queued.
    Degraded { dlq_id: String },
    /// Could not be processed or queued.
    Dropped { reason: String },
}

pub struct MessageOrchestrator {
    nlp: Arc<GuardedNlpClient>,
    pms: Arc<GuardedPmsClient>,
    replies: Arc<dyn ReplySink>,
    dlq: Arc<DeadLetterQueue>,
    store: Arc<dyn KeyValueStore>,
    audit: Arc<dyn AuditSink>,
    lock_config: LockConfig,
    locks: DashMap<String, Arc<DistributedLockManager>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl MessageOrchestrator {
    pub fn new(
        nlp: Arc<GuardedNlpClient>,
        pms: Arc<GuardedPmsClient>,
        replies: Arc<dyn ReplySink>,
        dlq: Arc<DeadLetterQueue>,
        store: Arc<dyn KeyValueStore>,
        audit: Arc<dyn AuditSink>,
        lock_config: LockConfig,
    ) -> Self {
        Self {
            nlp,
            pms,
            replies,
            dlq,
            store,
            audit,
            lock_config,
            locks: DashMap::new(),
            clock: system_clock(),
            metrics: noop_metrics(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Lock manager for one tenant, created on first use.
    pub fn locks_for(&self, tenant_id: &str) -> Arc<DistributedLockManager> {
        self.locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(
                    DistributedLockManager::new(
                        tenant_id,
                        self.store.clone(),
                        self.audit.clone(),
                        self.lock_config.clone(),
                    )
                    .with_clock(self.clock.clone())
                    .with_metrics(self.metrics.clone()),
                )
            })
            .clone()
    }

    pub async fn handle_inbound(&self, message: &GuestMessage) -> InboundOutcome {
        let e = match self.process_message(message).await {
            Ok(()) => return InboundOutcome::Processed,
            Err(e) => e,
        };

        let failure = FailureInfo::new(e.error_type(), &e);
        if e.is_circuit_open() {
            if let Err(reply_err) = self.replies.send(message, DEGRADED_REPLY).await {
                warn!(
                    correlation_id = %message.correlation_id,
                    error = %reply_err,
                    "Failed to send degraded reply"
                );
            }
            return match self.dlq.enqueue(message, &failure, 0, Some("circuit_open")).await {
                Ok(dlq_id) => InboundOutcome::Degraded { dlq_id },
                Err(dlq_err) => self.dropped(message, &failure, dlq_err),
            };
        }

        if !e.is_retryable() {
            warn!(
                correlation_id = %message.correlation_id,
                error_type = e.error_type(),
                error = %e,
                "Message failed with a non-retryable error"
            );
            if let Err(reply_err) = self.replies.send(message, FALLBACK_REPLY).await {
                warn!(correlation_id = %message.correlation_id, error = %reply_err, "Failed to send fallback reply");
            }
            return InboundOutcome::Dropped {
                reason: failure.to_string(),
            };
        }

        match self
            .dlq
            .enqueue(message, &failure, 0, Some("processing_failure"))
            .await
        {
            Ok(dlq_id) => InboundOutcome::Deferred { dlq_id },
            Err(dlq_err) => self.dropped(message, &failure, dlq_err),
        }
    }

    fn dropped(
        &self,
        message: &GuestMessage,
        failure: &FailureInfo,
        dlq_err: crate::error::DlqError,
    ) -> InboundOutcome {
        error!(
            correlation_id = %message.correlation_id,
            message_id = %message.message_id,
            error_type = %failure.error_type,
            error = %dlq_err,
            "Could not dead-letter failed message"
        );
        InboundOutcome::Dropped {
            reason: failure.to_string(),
        }
    }

    pub async fn process_message(&self, message: &GuestMessage) -> Result<(), OrchestratorError> {
        let intent = self
            .nlp
            .process(message)
            .await
            .map_err(OrchestratorError::Nlp)?;

        let reply = match intent {
            Intent::BookRoom(stay) => self.book(message, &stay).await?,
            Intent::CheckAvailability(stay) => self.availability(message, &stay).await?,
            Intent::SmallTalk { reply } => reply,
            Intent::Unknown => FALLBACK_REPLY.to_string(),
        };

        self.replies
            .send(message, &reply)
            .await
            .map_err(OrchestratorError::Reply)?;
        info!(
            correlation_id = %message.correlation_id,
            message_id = %message.message_id,
            "Message processed"
        );
        Ok(())
    }

    async fn availability(
        &self,
        message: &GuestMessage,
        stay: &StayRequest,
    ) -> Result<String, OrchestratorError> {
        let locks = self.locks_for(&message.tenant_id);
        if locks
            .check_conflicts(&stay.room_id, stay.check_in, stay.check_out)
            .await?
        {
            return Ok(unavailable_reply(stay));
        }
        let available = self
            .pms
            .check_availability(&message.tenant_id, stay)
            .await
            .map_err(OrchestratorError::Pms)?;
        Ok(if available {
            format!(
                "Good news: room {} is available from {} to {}.",
                stay.room_id, stay.check_in, stay.check_out
            )
        } else {
            unavailable_reply(stay)
        })
    }

    // Holds the room lock for the availability check and the reservation
    async fn book(&self, message: &GuestMessage, stay: &StayRequest) -> Result<String, OrchestratorError> {
        let locks = self.locks_for(&message.tenant_id);
        let request = AcquireRequest {
            room_id: &stay.room_id,
            check_in: stay.check_in,
            check_out: stay.check_out,
            session_id: &message.conversation_id,
            user_id: message.metadata.get("guest_id").map(String::as_str),
            ttl: None,
        };
        let Some(lock_key) = locks.acquire(request).await? else {
            return Ok(unavailable_reply(stay));
        };

        let result = self.reserve(message, stay).await;
        if let Err(e) = locks.release(&lock_key).await {
            warn!(
                lock_key = %lock_key,
                correlation_id = %message.correlation_id,
                error = %e,
                "Failed to release booking lock, leaving it to expire"
            );
        }
        result
    }

    async fn reserve(&self, message: &GuestMessage, stay: &StayRequest) -> Result<String, OrchestratorError> {
        let available = self
            .pms
            .check_availability(&message.tenant_id, stay)
            .await
            .map_err(OrchestratorError::Pms)?;
        if !available {
            return Ok(unavailable_reply(stay));
        }

        let reservation = self
            .pms
            .create_reservation(&message.tenant_id, stay, &message.message_id)
            .await
            .map_err(OrchestratorError::Pms)?;
        info!(
            correlation_id = %message.correlation_id,
            room_id = %stay.room_id,
            confirmation_code = %reservation.confirmation_code,
            "Reservation created"
        );
        Ok(format!(
            "Your booking is confirmed: room {} from {} to {}. Confirmation code {}.",
            stay.room_id, stay.check_in, stay.check_out, reservation.confirmation_code
        ))
    }
}

fn unavailable_reply(stay: &StayRequest) -> String {
    format!(
        "Sorry, room {} is not available from {} to {}.",
        stay.room_id, stay.check_in, stay.check_out
    )
}

#[async_trait]
impl MessageProcessor for MessageOrchestrator {
    async fn process(&self, message: &GuestMessage) -> anyhow::Result<()> {
        self.process_message(message).await.map_err(anyhow::Error::from)
    }
}
