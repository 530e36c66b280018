use std::{sync::Arc, time::Duration};

use futures::{stream, StreamExt};
use rand::Rng;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

use super::{queue::DeadLetterQueue, types::RetryOutcome};
use crate::{error::DlqError, message::MessageProcessor};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPassReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub permanently_failed: usize,
    pub errors: usize,
}

/// Background loop that drains due DLQ entries back through the processor.
pub struct DlqWorker {
    dlq: Arc<DeadLetterQueue>,
    processor: Arc<dyn MessageProcessor>,
}

impl DlqWorker {
    pub fn new(dlq: Arc<DeadLetterQueue>, processor: Arc<dyn MessageProcessor>) -> Self {
        Self { dlq, processor }
    }

    /// One pass over the currently due entries, at most `batch_size` of them.
    pub async fn run_once(&self) -> Result<RetryPassReport, DlqError> {
        let config = self.dlq.config();
        let mut candidates = self.dlq.get_retry_candidates().await?;
        candidates.truncate(config.batch_size);

        let outcomes: Vec<Result<RetryOutcome, DlqError>> = stream::iter(candidates)
            .map(|entry| async move {
                self.dlq
                    .attempt(&entry.dlq_id, self.processor.as_ref())
                    .await
                    .map_err(|e| {
                        warn!(dlq_id = %entry.dlq_id, error = %e, "DLQ retry errored");
                        e
                    })
            })
            .buffer_unordered(config.max_concurrency.max(1))
            .collect()
            .await;

        let mut report = RetryPassReport {
            attempted: outcomes.len(),
            ..RetryPassReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(RetryOutcome::Succeeded) => report.succeeded += 1,
                Ok(RetryOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(RetryOutcome::PermanentlyFailed) => report.permanently_failed += 1,
                Ok(RetryOutcome::Missing) => {}
                Err(_) => report.errors += 1,
            }
        }
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                permanently_failed = report.permanently_failed,
                errors = report.errors,
                "DLQ retry pass complete"
            );
        }
        Ok(report)
    }

    fn jittered_poll(&self) -> Duration {
        let base = self.dlq.config().poll_interval;
        let spread = u64::try_from(base.as_millis() / 10).unwrap_or(u64::MAX);
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        base.saturating_add(Duration::from_millis(jitter))
    }

    /// Polls until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let cleanup_interval = self.dlq.config().cleanup_interval;
        let mut last_cleanup = Instant::now();
        info!("DLQ worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.jittered_poll()) => {}
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, "DLQ retry pass failed");
            }

            if last_cleanup.elapsed() >= cleanup_interval {
                match self.dlq.cleanup_expired().await {
                    Ok(removed) => debug!(removed, "DLQ cleanup pass"),
                    Err(e) => error!(error = %e, "DLQ cleanup failed"),
                }
                last_cleanup = Instant::now();
            }
        }
        info!("DLQ worker stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
