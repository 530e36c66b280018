use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    permanent::{PermanentFailure, PermanentFailureStore},
    types::{
        epoch_score, message_key, DlqConfig, DlqEntry, DlqHealth, FailureInfo, RetryOutcome,
        RETRY_INDEX_KEY, SIZE_KEY,
    },
};
use crate::{
    clock::{elapsed_between, system_clock, Clock},
    error::DlqError,
    message::{GuestMessage, MessageProcessor},
    metrics::{names, noop_metrics, MetricsSink},
    store::KeyValueStore,
};

/// Dead-letter queue backed by the shared key-value store.
///
/// Each entry lives in a hash under `dlq:messages:{id}`, is indexed in the
/// `dlq:retry_schedule` sorted set by its next retry time, and is counted in
/// `dlq:size`. Entries that exhaust their retries move to the permanent
/// failure store.
pub struct DeadLetterQueue {
    store: Arc<dyn KeyValueStore>,
    failures: Arc<dyn PermanentFailureStore>,
    config: DlqConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        failures: Arc<dyn PermanentFailureStore>,
        config: DlqConfig,
    ) -> Self {
        Self {
            store,
            failures,
            config,
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

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn retry_at(&self, from: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.backoff(retry_count))
            .ok()
            .and_then(|delay| from.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub async fn enqueue(
        &self,
        message: &GuestMessage,
        failure: &FailureInfo,
        retry_count: u32,
        reason: Option<&str>,
    ) -> Result<String, DlqError> {
        let dlq_id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let entry = DlqEntry {
            dlq_id: dlq_id.clone(),
            message: message.clone(),
            error_type: failure.error_type.clone(),
            error_message: failure.error_message.clone(),
            retry_count,
            first_failed_at: now,
            retry_at: self.retry_at(now, retry_count),
            last_retry_at: None,
            correlation_id: message.correlation_id.clone(),
            reason: reason.map(str::to_string),
        };

        self.write_entry(&entry).await?;
        // The entry is queued once indexed; a lost increment only skews the gauge
        match self.store.increment_by(SIZE_KEY, 1).await {
            Ok(size) => self.metrics.set_gauge(names::DLQ_SIZE, size.max(0) as f64, &[]),
            Err(e) => error!(dlq_id = %dlq_id, error = %e, "Failed to count dead-lettered message"),
        }
        self.metrics.increment_counter(
            names::DLQ_ENQUEUED,
            &[
                ("error_type", failure.error_type.as_str()),
                ("reason", reason.unwrap_or("unspecified")),
            ],
        );

        info!(
            dlq_id = %dlq_id,
            correlation_id = %entry.correlation_id,
            error_type = %entry.error_type,
            retry_count,
            retry_at = %entry.retry_at,
            "Message dead-lettered"
        );
        Ok(dlq_id)
    }

    // Hash first, then index: a crash in between leaves an unindexed hash that
    // retention eventually expires, never an index entry without a payload.
    async fn write_entry(&self, entry: &DlqEntry) -> Result<(), DlqError> {
        let fields = entry.to_fields()?;
        self.store
            .hash_set_all(&message_key(&entry.dlq_id), &fields, Some(self.config.retention))
            .await?;
        self.store
            .sorted_add(RETRY_INDEX_KEY, &entry.dlq_id, epoch_score(entry.retry_at))
            .await?;
        Ok(())
    }

    pub async fn get_entry(&self, dlq_id: &str) -> Result<Option<DlqEntry>, DlqError> {
        match self.store.hash_get_all(&message_key(dlq_id)).await? {
            Some(fields) => Ok(Some(DlqEntry::from_fields(dlq_id, &fields)?)),
            None => Ok(None),
        }
    }

    async fn drop_stale_index(&self, dlq_id: &str) -> Result<bool, DlqError> {
        let removed = self.store.sorted_remove(RETRY_INDEX_KEY, dlq_id).await?;
        if removed {
            self.metrics.increment_counter(names::DLQ_STALE_INDEX, &[]);
            debug!(dlq_id, "Removed retry index entry with no payload");
        }
        Ok(removed)
    }

    /// Every entry whose `retry_at` is not after now, oldest schedule first.
    ///
    /// Index members whose hash has vanished are removed along the way.
    pub async fn get_retry_candidates(&self) -> Result<Vec<DlqEntry>, DlqError> {
        let now = self.clock.now();
        let due = self
            .store
            .sorted_range_by_score(RETRY_INDEX_KEY, f64::NEG_INFINITY, epoch_score(now))
            .await?;

        let mut candidates = Vec::with_capacity(due.len());
        for (dlq_id, _) in due {
            let Some(fields) = self.store.hash_get_all(&message_key(&dlq_id)).await? else {
                self.drop_stale_index(&dlq_id).await?;
                continue;
            };
            match DlqEntry::from_fields(&dlq_id, &fields) {
                Ok(entry) if entry.retry_at <= now => candidates.push(entry),
                Ok(_) => {}
                Err(e) => warn!(dlq_id = %dlq_id, error = %e, "Skipping unreadable DLQ entry"),
            }
        }
        Ok(candidates)
    }

    /// Resubmits one entry. True only if processing succeeded and the entry
    /// was removed.
    pub async fn retry(
        &self,
        dlq_id: &str,
        processor: &dyn MessageProcessor,
    ) -> Result<bool, DlqError> {
        Ok(self.attempt(dlq_id, processor).await? == RetryOutcome::Succeeded)
    }

    pub async fn attempt(
        &self,
        dlq_id: &str,
        processor: &dyn MessageProcessor,
    ) -> Result<RetryOutcome, DlqError> {
        let Some(entry) = self.get_entry(dlq_id).await? else {
            self.drop_stale_index(dlq_id).await?;
            self.record_retry(RetryOutcome::Missing);
            return Ok(RetryOutcome::Missing);
        };

        let outcome = match processor.process(&entry.message).await {
            Ok(()) => {
                self.remove(dlq_id).await?;
                info!(
                    dlq_id,
                    correlation_id = %entry.correlation_id,
                    retry_count = entry.retry_count,
                    "DLQ retry succeeded"
                );
                RetryOutcome::Succeeded
            }
            Err(e) => {
                let failure = FailureInfo::from_anyhow(&e);
                self.on_retry_failed(entry, failure).await?
            }
        };
        self.record_retry(outcome);
        Ok(outcome)
    }

    async fn on_retry_failed(
        &self,
        entry: DlqEntry,
        failure: FailureInfo,
    ) -> Result<RetryOutcome, DlqError> {
        let now = self.clock.now();
        let retry_count = entry.retry_count.saturating_add(1);

        if retry_count >= self.config.max_retries {
            if self.store.hash_get_all(&message_key(&entry.dlq_id)).await?.is_none() {
                return Ok(self.finished_elsewhere(&entry));
            }
            self.fail_permanently(&entry, &failure, retry_count, now).await?;
            return Ok(RetryOutcome::PermanentlyFailed);
        }

        let rescheduled = DlqEntry {
            error_type: failure.error_type,
            error_message: failure.error_message,
            retry_count,
            retry_at: self.retry_at(now, retry_count),
            last_retry_at: Some(now),
            ..entry
        };
        // Another worker may have finished this entry while it was processing
        let fields = rescheduled.to_fields()?;
        if !self
            .store
            .hash_update_if_present(&message_key(&rescheduled.dlq_id), &fields, Some(self.config.retention))
            .await?
        {
            return Ok(self.finished_elsewhere(&rescheduled));
        }
        self.store
            .sorted_add(RETRY_INDEX_KEY, &rescheduled.dlq_id, epoch_score(rescheduled.retry_at))
            .await?;
        warn!(
            dlq_id = %rescheduled.dlq_id,
            correlation_id = %rescheduled.correlation_id,
            retry_count,
            retry_at = %rescheduled.retry_at,
            error = %rescheduled.error_message,
            "DLQ retry failed, rescheduled"
        );
        Ok(RetryOutcome::Rescheduled)
    }

    fn finished_elsewhere(&self, entry: &DlqEntry) -> RetryOutcome {
        debug!(
            dlq_id = %entry.dlq_id,
            correlation_id = %entry.correlation_id,
            "DLQ entry removed during retry, dropping late failure"
        );
        RetryOutcome::Missing
    }

    async fn fail_permanently(
        &self,
        entry: &DlqEntry,
        failure: &FailureInfo,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), DlqError> {
        let row = PermanentFailure {
            id: entry.dlq_id.clone(),
            message_payload: serde_json::to_value(&entry.message)?,
            error_message: failure.error_message.clone(),
            error_type: failure.error_type.clone(),
            retry_count: i32::try_from(retry_count).unwrap_or(i32::MAX),
            first_failed_at: entry.first_failed_at,
            last_retry_at: now,
        };

        // The entry stays queued if the durable write fails
        if let Err(e) = self.failures.insert(&row).await {
            error!(
                dlq_id = %entry.dlq_id,
                correlation_id = %entry.correlation_id,
                error = %e,
                "Failed to persist permanent failure"
            );
            return Err(e.into());
        }

        self.remove(&entry.dlq_id).await?;
        self.metrics
            .increment_counter(names::DLQ_PERMANENT, &[("error_type", row.error_type.as_str())]);
        error!(
            dlq_id = %entry.dlq_id,
            correlation_id = %entry.correlation_id,
            retry_count,
            error_type = %row.error_type,
            "Message permanently failed"
        );
        Ok(())
    }

    // Decrements the size only when this call actually deleted the payload
    async fn remove(&self, dlq_id: &str) -> Result<(), DlqError> {
        let deleted = self.store.delete(&message_key(dlq_id)).await?;
        self.store.sorted_remove(RETRY_INDEX_KEY, dlq_id).await?;
        if deleted {
            let size = self.store.increment_by(SIZE_KEY, -1).await?;
            self.metrics.set_gauge(names::DLQ_SIZE, size.max(0) as f64, &[]);
        }
        Ok(())
    }

    fn record_retry(&self, outcome: RetryOutcome) {
        self.metrics
            .increment_counter(names::DLQ_RETRIES, &[("outcome", outcome.as_str())]);
    }

    /// Drops index entries whose payload has expired and returns how many
    /// were removed.
    pub async fn cleanup_expired(&self) -> Result<usize, DlqError> {
        let purged = self.store.purge_expired().await?;
        if purged > 0 {
            debug!(purged, "Purged expired store keys");
        }

        let indexed = self
            .store
            .sorted_range_by_score(RETRY_INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await?;

        let mut removed = 0;
        for (dlq_id, _) in indexed {
            if self.store.hash_get_all(&message_key(&dlq_id)).await?.is_some() {
                continue;
            }
            if self.store.sorted_remove(RETRY_INDEX_KEY, &dlq_id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            let size = self.store.increment_by(SIZE_KEY, -(removed as i64)).await?;
            // Keep the counter from drifting below zero
            if size < 0 {
                self.store.increment_by(SIZE_KEY, -size).await?;
            }
            self.metrics.set_gauge(names::DLQ_SIZE, size.max(0) as f64, &[]);
            info!(removed, "Cleaned up expired DLQ entries");
        }
        Ok(removed)
    }

    pub async fn queue_size(&self) -> Result<u64, DlqError> {
        let size = self.store.get_counter(SIZE_KEY).await?;
        Ok(u64::try_from(size).unwrap_or(0))
    }

    /// Age of the entry that failed first, or None if the queue is empty.
    pub async fn oldest_message_age(&self) -> Result<Option<Duration>, DlqError> {
        let indexed = self
            .store
            .sorted_range_by_score(RETRY_INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await?;

        let mut oldest: Option<DateTime<Utc>> = None;
        for (dlq_id, _) in indexed {
            let Some(fields) = self.store.hash_get_all(&message_key(&dlq_id)).await? else {
                continue;
            };
            let Some(failed_at) = first_failed_at(&fields) else {
                continue;
            };
            oldest = Some(oldest.map_or(failed_at, |o| o.min(failed_at)));
        }

        let age = oldest.map(|at| elapsed_between(at, self.clock.now()));
        if let Some(age) = age {
            self.metrics
                .set_gauge(names::DLQ_OLDEST_AGE, age.as_secs_f64(), &[]);
        }
        Ok(age)
    }

    pub async fn health(&self) -> Result<DlqHealth, DlqError> {
        let due_now = self
            .store
            .sorted_range_by_score(RETRY_INDEX_KEY, f64::NEG_INFINITY, epoch_score(self.clock.now()))
            .await?
            .len();
        Ok(DlqHealth {
            queue_size: self.queue_size().await?,
            oldest_message_age_secs: self.oldest_message_age().await?.map(|age| age.as_secs()),
            due_now,
        })
    }
}

fn first_failed_at(fields: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    let raw = fields.get("first_failed_at")?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::atomic::{AtomicUsize, Ordering}};

    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use tokio_test::assert_ok;

    use super::*;
    use crate::{
        clock::ManualClock,
        dlq::permanent::MemoryPermanentFailureStore,
        message::fixtures::guest_message,
        metrics::InMemoryMetrics,
        store::MemoryStore,
    };

    // Fails while scripted failures remain, then succeeds
    #[derive(Default)]
    struct ScriptedProcessor {
        failures: Mutex<VecDeque<FailureInfo>>,
        calls: AtomicUsize,
    }

    impl ScriptedProcessor {
        fn failing(times: usize) -> Self {
            let processor = Self::default();
            for _ in 0..times {
                processor
                    .failures
                    .lock()
                    .push_back(FailureInfo::new("pms_unavailable", "503 from PMS"));
            }
            processor
        }
    }

    #[async_trait]
    impl MessageProcessor for ScriptedProcessor {
        async fn process(&self, _message: &GuestMessage) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.lock().pop_front() {
                Some(failure) => Err(failure.into()),
                None => Ok(()),
            }
        }
    }

    struct Harness {
        dlq: DeadLetterQueue,
        store: Arc<MemoryStore>,
        failures: Arc<MemoryPermanentFailureStore>,
        clock: Arc<ManualClock>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn harness(config: DlqConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let failures = Arc::new(MemoryPermanentFailureStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let dlq = DeadLetterQueue::new(store.clone(), failures.clone(), config)
            .with_clock(clock.clone())
            .with_metrics(metrics.clone());
        Harness {
            dlq,
            store,
            failures,
            clock,
            metrics,
        }
    }

    fn failure() -> FailureInfo {
        FailureInfo::new("pms_unavailable", "503 from PMS")
    }

    #[tokio::test]
    async fn test_enqueue_writes_entry_index_and_size() {
        let h = harness(DlqConfig::default());
        let id = assert_ok!(
            h.dlq
                .enqueue(&guest_message("m1"), &failure(), 0, Some("dependency_failure"))
                .await
        );

        let entry = h.dlq.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.correlation_id, "corr-m1");
        assert_eq!(entry.retry_at - entry.first_failed_at, chrono::Duration::seconds(60));

        let indexed = h
            .store
            .sorted_range_by_score(RETRY_INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].0, id);
        assert_eq!(h.dlq.queue_size().await.unwrap(), 1);
        assert_eq!(h.metrics.counter_total(names::DLQ_ENQUEUED), 1);
    }

    #[tokio::test]
    async fn test_candidates_only_when_due() {
        let h = harness(DlqConfig::default());
        h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.dlq.enqueue(&guest_message("m2"), &failure(), 2, None).await.unwrap();

        h.clock.advance(Duration::from_secs(59));
        assert!(h.dlq.get_retry_candidates().await.unwrap().is_empty());

        h.clock.advance(Duration::from_secs(1));
        let due = h.dlq.get_retry_candidates().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.message_id, "m1");

        // m2 was enqueued with retry_count 2: due after 240s
        h.clock.advance(Duration::from_secs(180));
        assert_eq!(h.dlq.get_retry_candidates().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_successful_retry_removes_entry() {
        let h = harness(DlqConfig::default());
        let id = h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.clock.advance(Duration::from_secs(60));

        let processor = ScriptedProcessor::default();
        assert!(h.dlq.retry(&id, &processor).await.unwrap());

        assert!(h.dlq.get_entry(&id).await.unwrap().is_none());
        assert!(h.dlq.get_retry_candidates().await.unwrap().is_empty());
        assert_eq!(h.dlq.queue_size().await.unwrap(), 0);
        assert_eq!(
            h.metrics.counter(names::DLQ_RETRIES, &[("outcome", "succeeded")]),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_retry_doubles_backoff() {
        let h = harness(DlqConfig::default());
        let id = h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.clock.advance(Duration::from_secs(60));

        let processor = ScriptedProcessor::failing(1);
        assert_eq!(
            h.dlq.attempt(&id, &processor).await.unwrap(),
            RetryOutcome::Rescheduled
        );

        let entry = h.dlq.get_entry(&id).await.unwrap().unwrap();
        let now = h.clock.now();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_retry_at, Some(now));
        assert_eq!(entry.retry_at - now, chrono::Duration::seconds(120));
        assert_eq!(h.dlq.queue_size().await.unwrap(), 1);
        assert!(h.dlq.get_retry_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_move_to_permanent_store() {
        let h = harness(DlqConfig {
            max_retries: 2,
            retry_backoff_base: Duration::from_secs(1),
            ..DlqConfig::default()
        });
        let processor = ScriptedProcessor::failing(10);
        let id = h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(
            h.dlq.attempt(&id, &processor).await.unwrap(),
            RetryOutcome::Rescheduled
        );

        h.clock.advance(Duration::from_secs(2));
        assert_eq!(h.dlq.get_retry_candidates().await.unwrap().len(), 1);
        assert_eq!(
            h.dlq.attempt(&id, &processor).await.unwrap(),
            RetryOutcome::PermanentlyFailed
        );

        let rows = h.failures.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].retry_count, 2);
        assert_eq!(rows[0].message_payload["message_id"], "m1");
        assert!(h.dlq.get_entry(&id).await.unwrap().is_none());
        assert_eq!(h.dlq.queue_size().await.unwrap(), 0);
        assert_eq!(h.metrics.counter_total(names::DLQ_PERMANENT), 1);
    }

    #[tokio::test]
    async fn test_permanent_write_failure_keeps_entry() {
        let h = harness(DlqConfig {
            max_retries: 1,
            ..DlqConfig::default()
        });
        let id = h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.clock.advance(Duration::from_secs(60));
        h.failures.fail_next_writes(1);

        let processor = ScriptedProcessor::failing(1);
        assert!(h.dlq.retry(&id, &processor).await.is_err());
        assert!(h.dlq.get_entry(&id).await.unwrap().is_some());
        assert_eq!(h.dlq.queue_size().await.unwrap(), 1);
    }

    // Settles the entry through a second queue instance while the first
    // attempt is still processing, then fails
    struct CompletedElsewhere {
        other: Arc<DeadLetterQueue>,
        dlq_id: String,
    }

    #[async_trait]
    impl MessageProcessor for CompletedElsewhere {
        async fn process(&self, _message: &GuestMessage) -> anyhow::Result<()> {
            let done = self
                .other
                .retry(&self.dlq_id, &ScriptedProcessor::default())
                .await?;
            assert!(done);
            Err(failure().into())
        }
    }

    fn second_instance(h: &Harness) -> Arc<DeadLetterQueue> {
        Arc::new(
            DeadLetterQueue::new(h.store.clone(), h.failures.clone(), h.dlq.config().clone())
                .with_clock(h.clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_late_failure_does_not_resurrect_finished_entry() {
        let h = harness(DlqConfig::default());
        let id = h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.clock.advance(Duration::from_secs(60));

        let processor = CompletedElsewhere {
            other: second_instance(&h),
            dlq_id: id.clone(),
        };
        assert_eq!(
            h.dlq.attempt(&id, &processor).await.unwrap(),
            RetryOutcome::Missing
        );

        assert!(h.dlq.get_entry(&id).await.unwrap().is_none());
        assert_eq!(h.dlq.queue_size().await.unwrap(), 0);
        h.clock.advance(Duration::from_secs(600));
        assert!(h.dlq.get_retry_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_final_failure_skips_permanent_store() {
        let h = harness(DlqConfig {
            max_retries: 1,
            ..DlqConfig::default()
        });
        let id = h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.clock.advance(Duration::from_secs(60));

        let processor = CompletedElsewhere {
            other: second_instance(&h),
            dlq_id: id.clone(),
        };
        assert!(!h.dlq.retry(&id, &processor).await.unwrap());

        assert!(h.failures.rows().is_empty());
        assert_eq!(h.dlq.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_survives_size_counter_failure() {
        let h = harness(DlqConfig::default());
        // a non-counter value at the size key makes the increment fail
        h.store.sorted_add(SIZE_KEY, "corrupt", 1.0).await.unwrap();

        let id = assert_ok!(h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await);

        assert!(h.dlq.get_entry(&id).await.unwrap().is_some());
        h.clock.advance(Duration::from_secs(60));
        let due = h.dlq.get_retry_candidates().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].dlq_id, id);
    }

    #[tokio::test]
    async fn test_stale_index_entries_self_heal() {
        let h = harness(DlqConfig::default());
        h.store.sorted_add(RETRY_INDEX_KEY, "ghost", 0.0).await.unwrap();

        assert!(h.dlq.get_retry_candidates().await.unwrap().is_empty());
        assert!(h
            .store
            .sorted_range_by_score(RETRY_INDEX_KEY, f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(h.metrics.counter_total(names::DLQ_STALE_INDEX), 1);
    }

    #[tokio::test]
    async fn test_retry_of_missing_entry_returns_false() {
        let h = harness(DlqConfig::default());
        let processor = ScriptedProcessor::default();
        assert!(!h.dlq.retry("nope", &processor).await.unwrap());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired_drops_orphans() {
        let h = harness(DlqConfig {
            retention: Duration::from_secs(10),
            ..DlqConfig::default()
        });
        h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.dlq.enqueue(&guest_message("m2"), &failure(), 0, None).await.unwrap();
        assert_eq!(h.dlq.cleanup_expired().await.unwrap(), 0);

        h.clock.advance(Duration::from_secs(11));
        assert_eq!(h.dlq.cleanup_expired().await.unwrap(), 2);
        assert_eq!(h.dlq.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_size_and_oldest_age() {
        let h = harness(DlqConfig::default());
        assert_eq!(h.dlq.oldest_message_age().await.unwrap(), None);

        h.dlq.enqueue(&guest_message("m1"), &failure(), 0, None).await.unwrap();
        h.clock.advance(Duration::from_secs(90));
        h.dlq.enqueue(&guest_message("m2"), &failure(), 0, None).await.unwrap();

        let health = h.dlq.health().await.unwrap();
        assert_eq!(health.queue_size, 2);
        assert_eq!(health.oldest_message_age_secs, Some(90));
        assert_eq!(health.due_now, 1);
    }
}
