// Booking locks: advisory, TTL-bearing records that keep two sessions from
// selling the same room for overlapping nights.

use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEventType, AuditSink, LockAuditEvent},
    clock::{system_clock, Clock},
    config::{env_key, millis_or, parse_or, seconds_or, EnvLookup, ProcessEnv},
    error::LockError,
    metrics::{names, noop_metrics, MetricsSink},
    store::KeyValueStore,
};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// What to do with an existing lock record that cannot be parsed while
/// scanning for conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnparsablePolicy {
    /// Log and ignore the record (fail-open).
    #[default]
    Skip,
    /// Treat the record as covering every date (fail-closed).
    TreatAsConflict,
}

impl FromStr for UnparsablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" | "fail_open" => Ok(UnparsablePolicy::Skip),
            "conflict" | "fail_closed" => Ok(UnparsablePolicy::TreatAsConflict),
            other => Err(format!("unknown unparsable policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub default_ttl: Duration,
    pub max_extensions: u32,
    // Per-room guard serializing the conflict scan and the create
    pub guard_ttl: Duration,
    pub guard_attempts: u32,
    pub guard_retry_delay: Duration,
    pub unparsable_policy: UnparsablePolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_extensions: 2,
            guard_ttl: Duration::from_secs(5),
            guard_attempts: 50,
            guard_retry_delay: Duration::from_millis(20),
            unparsable_policy: UnparsablePolicy::Skip,
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup<L: EnvLookup + ?Sized>(env: &L) -> Self {
        let d = Self::default();
        Self {
            default_ttl: seconds_or(env, &env_key("lock", "ttl_secs"), d.default_ttl),
            max_extensions: parse_or(env, &env_key("lock", "max_extensions"), d.max_extensions, |_| true),
            guard_ttl: millis_or(env, &env_key("lock", "guard_ttl_ms"), d.guard_ttl),
            guard_attempts: parse_or(env, &env_key("lock", "guard_attempts"), d.guard_attempts, |v| *v > 0),
            guard_retry_delay: millis_or(env, &env_key("lock", "guard_retry_ms"), d.guard_retry_delay),
            unparsable_policy: env
                .get(&env_key("lock", "unparsable_policy"))
                .and_then(|raw| match raw.parse() {
                    Ok(policy) => Some(policy),
                    Err(e) => {
                        warn!(error = %e, "Invalid unparsable policy, using default");
                        None
                    }
                })
                .unwrap_or(d.unparsable_policy),
        }
    }
}

/// Store key of one booking lock:
/// `tenant:{tenant}:lock:room:{room_id}:{check_in}:{check_out}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeyParts {
    pub tenant_id: String,
    pub room_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl LockKey {
    pub fn new(tenant_id: &str, room_id: &str, check_in: NaiveDate, check_out: NaiveDate) -> Self {
        Self(format!(
            "{}{}:{}",
            room_prefix(tenant_id, room_id),
            check_in.format(DATE_FORMAT),
            check_out.format(DATE_FORMAT)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parts(&self) -> Result<LockKeyParts, LockError> {
        let malformed = || LockError::MalformedKey(self.0.clone());

        let mut tail = self.0.rsplitn(3, ':');
        let check_out = tail.next().ok_or_else(malformed)?;
        let check_in = tail.next().ok_or_else(malformed)?;
        let head = tail.next().ok_or_else(malformed)?;

        let (tenant_id, room_id) = head
            .strip_prefix("tenant:")
            .and_then(|rest| rest.split_once(":lock:room:"))
            .ok_or_else(malformed)?;

        Ok(LockKeyParts {
            tenant_id: tenant_id.to_string(),
            room_id: room_id.to_string(),
            check_in: NaiveDate::parse_from_str(check_in, DATE_FORMAT).map_err(|_| malformed())?,
            check_out: NaiveDate::parse_from_str(check_out, DATE_FORMAT).map_err(|_| malformed())?,
        })
    }
}

impl FromStr for LockKey {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = LockKey(s.to_string());
        key.parts()?;
        Ok(key)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn room_prefix(tenant_id: &str, room_id: &str) -> String {
    format!("tenant:{tenant_id}:lock:room:{room_id}:")
}

// Keys under `prefix` that are this room's own locks. A room id containing ':'
// shares the prefix of a shorter room id, so the remainder must be exactly
// `{check_in}:{check_out}` or a single unparsable segment.
fn own_room_keys(prefix: &str, keys: Vec<String>) -> Vec<String> {
    keys.into_iter()
        .filter(|key| {
            key.strip_prefix(prefix)
                .map_or(false, |rest| rest.matches(':').count() <= 1)
        })
        .collect()
}

fn guard_key(tenant_id: &str, room_id: &str) -> String {
    format!("tenant:{tenant_id}:lock:guard:room:{room_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub room_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub session_id: String,
    pub user_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub extensions: u32,
}

/// Half-open interval overlap: `[a, b)` and `[c, d)` share at least one night.
pub fn ranges_overlap(a: NaiveDate, b: NaiveDate, c: NaiveDate, d: NaiveDate) -> bool {
    !(b <= c || a >= d)
}

fn validate_range(check_in: NaiveDate, check_out: NaiveDate) -> Result<(), LockError> {
    if check_in < check_out {
        Ok(())
    } else {
        Err(LockError::InvalidRange {
            check_in: check_in.to_string(),
            check_out: check_out.to_string(),
        })
    }
}

fn after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquireRequest<'a> {
    pub room_id: &'a str,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub session_id: &'a str,
    pub user_id: Option<&'a str>,
    pub ttl: Option<Duration>,
}

// Audit event decided inside the room guard, written after it is released
type PendingAudit = (AuditEventType, serde_json::Value);

enum Extension {
    Extended(serde_json::Value),
    Missing,
    Limit,
}

enum Scan {
    Clear,
    Conflict { key: String, reason: &'static str },
}

/// Tenant-scoped lock manager over the shared store.
///
/// Acquisition takes a short per-room guard record, scans the live locks of
/// the room for an overlapping range and only then creates its own record with
/// a create-if-absent write. The record TTL is the only release mechanism a
/// crashed holder needs; the guard carries its own short TTL for the same reason.
pub struct DistributedLockManager {
    tenant_id: String,
    store: Arc<dyn KeyValueStore>,
    audit: Arc<dyn AuditSink>,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl DistributedLockManager {
    pub fn new(
        tenant_id: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        audit: Arc<dyn AuditSink>,
        config: LockConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            store,
            audit,
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

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn lock_key(&self, room_id: &str, check_in: NaiveDate, check_out: NaiveDate) -> LockKey {
        LockKey::new(&self.tenant_id, room_id, check_in, check_out)
    }

    /// Try to lock `room_id` for `[check_in, check_out)`.
    ///
    /// Returns `Ok(None)` when any live lock of the room overlaps the range.
    pub async fn acquire(&self, request: AcquireRequest<'_>) -> Result<Option<LockKey>, LockError> {
        validate_range(request.check_in, request.check_out)?;
        let started = Instant::now();
        let key = self.lock_key(request.room_id, request.check_in, request.check_out);

        let Some(token) = self.acquire_room_guard(request.room_id).await? else {
            warn!(lock_key = %key, "Room guard busy, treating as conflict");
            self.metrics
                .increment_counter(names::LOCK_ACQUIRE, &[("outcome", "busy")]);
            self.audit_event(
                key.as_str(),
                AuditEventType::Conflict,
                json!({
                    "session_id": request.session_id,
                    "reason": "room_guard_busy",
                }),
            )
            .await;
            return Ok(None);
        };

        let result = self.acquire_guarded(&key, &request).await;
        self.release_room_guard(request.room_id, &token).await;

        self.metrics.observe_histogram(
            names::LOCK_ACQUIRE_SECONDS,
            started.elapsed().as_secs_f64(),
            &[],
        );

        // audit writes may retry for seconds, never while holding the guard
        let (acquired, (event_type, details)) = result?;
        self.audit_event(key.as_str(), event_type, details).await;
        Ok(acquired)
    }

    async fn acquire_guarded(
        &self,
        key: &LockKey,
        request: &AcquireRequest<'_>,
    ) -> Result<(Option<LockKey>, PendingAudit), LockError> {
        if let Scan::Conflict { key: existing, reason } = self
            .scan_room(request.room_id, request.check_in, request.check_out)
            .await?
        {
            return Ok((None, self.conflict(key, request, &existing, reason)));
        }

        let ttl = request.ttl.unwrap_or(self.config.default_ttl);
        let now = self.clock.now();
        let record = LockRecord {
            room_id: request.room_id.to_string(),
            check_in: request.check_in,
            check_out: request.check_out,
            session_id: request.session_id.to_string(),
            user_id: request.user_id.map(str::to_string),
            acquired_at: now,
            expires_at: after(now, ttl),
            extensions: 0,
        };
        let value = serde_json::to_string(&record)?;

        if !self.store.set_if_absent(key.as_str(), &value, ttl).await? {
            return Ok((None, self.conflict(key, request, key.as_str(), "identical_key")));
        }

        info!(
            lock_key = %key,
            session_id = request.session_id,
            ttl_secs = ttl.as_secs(),
            "Booking lock acquired"
        );
        self.metrics
            .increment_counter(names::LOCK_ACQUIRE, &[("outcome", "acquired")]);
        Ok((
            Some(key.clone()),
            (
                AuditEventType::Acquired,
                json!({
                    "session_id": request.session_id,
                    "user_id": request.user_id,
                    "ttl_secs": ttl.as_secs(),
                    "expires_at": record.expires_at,
                }),
            ),
        ))
    }

    fn conflict(
        &self,
        key: &LockKey,
        request: &AcquireRequest<'_>,
        existing: &str,
        reason: &'static str,
    ) -> PendingAudit {
        info!(
            lock_key = %key,
            conflicting_key = existing,
            reason,
            "Booking lock conflict"
        );
        self.metrics
            .increment_counter(names::LOCK_ACQUIRE, &[("outcome", "conflict")]);
        (
            AuditEventType::Conflict,
            json!({
                "session_id": request.session_id,
                "conflicting_key": existing,
                "reason": reason,
            }),
        )
    }

    /// Extend a held lock by `extra_ttl` on top of its remaining TTL, up to
    /// the configured number of extensions.
    pub async fn extend(&self, lock_key: &LockKey, extra_ttl: Duration) -> Result<bool, LockError> {
        self.extend_with_limit(lock_key, extra_ttl, self.config.max_extensions)
            .await
    }

    /// Runs under the room guard so concurrent extensions of one lock are
    /// counted against the limit one at a time.
    pub async fn extend_with_limit(
        &self,
        lock_key: &LockKey,
        extra_ttl: Duration,
        max_extensions: u32,
    ) -> Result<bool, LockError> {
        let room_id = lock_key.parts()?.room_id;
        let Some(token) = self.acquire_room_guard(&room_id).await? else {
            warn!(lock_key = %lock_key, "Room guard busy, extension refused");
            self.metrics
                .increment_counter(names::LOCK_EXTEND, &[("outcome", "busy")]);
            return Ok(false);
        };

        let result = self
            .extend_guarded(lock_key, extra_ttl, max_extensions)
            .await;
        self.release_room_guard(&room_id, &token).await;

        match result? {
            Extension::Extended(details) => {
                self.audit_event(lock_key.as_str(), AuditEventType::Extended, details)
                    .await;
                Ok(true)
            }
            Extension::Missing => Ok(self.extend_missing(lock_key).await),
            Extension::Limit => Ok(false),
        }
    }

    async fn extend_guarded(
        &self,
        lock_key: &LockKey,
        extra_ttl: Duration,
        max_extensions: u32,
    ) -> Result<Extension, LockError> {
        let Some(raw) = self.store.get(lock_key.as_str()).await? else {
            return Ok(Extension::Missing);
        };
        let mut record: LockRecord = serde_json::from_str(&raw)?;

        if record.extensions >= max_extensions {
            warn!(
                lock_key = %lock_key,
                extensions = record.extensions,
                max_extensions,
                "Lock extension limit reached"
            );
            self.metrics
                .increment_counter(names::LOCK_EXTEND, &[("outcome", "limit")]);
            return Ok(Extension::Limit);
        }

        let remaining = self
            .store
            .ttl(lock_key.as_str())
            .await?
            .unwrap_or(Duration::ZERO);
        let new_ttl = remaining + extra_ttl;
        record.extensions += 1;
        record.expires_at = after(self.clock.now(), new_ttl);

        let value = serde_json::to_string(&record)?;
        if !self
            .store
            .set_if_present(lock_key.as_str(), &value, new_ttl)
            .await?
        {
            return Ok(Extension::Missing);
        }

        debug!(
            lock_key = %lock_key,
            extensions = record.extensions,
            ttl_secs = new_ttl.as_secs(),
            "Booking lock extended"
        );
        self.metrics
            .increment_counter(names::LOCK_EXTEND, &[("outcome", "extended")]);
        Ok(Extension::Extended(json!({
            "extensions": record.extensions,
            "ttl_secs": new_ttl.as_secs(),
            "expires_at": record.expires_at,
        })))
    }

    async fn extend_missing(&self, lock_key: &LockKey) -> bool {
        info!(lock_key = %lock_key, "Cannot extend, lock no longer held");
        self.metrics
            .increment_counter(names::LOCK_EXTEND, &[("outcome", "missing")]);
        self.audit_event(
            lock_key.as_str(),
            AuditEventType::Expired,
            json!({ "reason": "missing_on_extend" }),
        )
        .await;
        false
    }

    /// Release a lock. Releasing a lock that is gone returns `false`.
    pub async fn release(&self, lock_key: &LockKey) -> Result<bool, LockError> {
        let released = self.store.delete(lock_key.as_str()).await?;
        if released {
            info!(lock_key = %lock_key, "Booking lock released");
            self.metrics
                .increment_counter(names::LOCK_RELEASE, &[("outcome", "released")]);
            self.audit_event(lock_key.as_str(), AuditEventType::Released, json!({}))
                .await;
        } else {
            debug!(lock_key = %lock_key, "Release of a lock that is not held");
            self.metrics
                .increment_counter(names::LOCK_RELEASE, &[("outcome", "missing")]);
        }
        Ok(released)
    }

    /// Whether any live lock of the room overlaps `[check_in, check_out)`.
    pub async fn check_conflicts(
        &self,
        room_id: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<bool, LockError> {
        validate_range(check_in, check_out)?;
        Ok(matches!(
            self.scan_room(room_id, check_in, check_out).await?,
            Scan::Conflict { .. }
        ))
    }

    pub async fn get_lock(&self, lock_key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        match self.store.get(lock_key.as_str()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // Live, parsable locks of one room
    pub async fn active_locks(&self, room_id: &str) -> Result<Vec<(LockKey, LockRecord)>, LockError> {
        let prefix = room_prefix(&self.tenant_id, room_id);
        let keys = own_room_keys(&prefix, self.store.keys_with_prefix(&prefix).await?);

        let mut locks = Vec::new();
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<LockRecord>(&raw) {
                Ok(record) if record.room_id == room_id => locks.push((LockKey(key), record)),
                _ => {}
            }
        }
        Ok(locks)
    }

    async fn scan_room(
        &self,
        room_id: &str,
        check_in: NaiveDate,
        check_out: NaiveDate,
    ) -> Result<Scan, LockError> {
        let prefix = room_prefix(&self.tenant_id, room_id);
        let keys = own_room_keys(&prefix, self.store.keys_with_prefix(&prefix).await?);

        for key in keys {
            // expired between the scan and the read
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };

            let record = match serde_json::from_str::<LockRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(lock_key = %key, error = %e, policy = ?self.config.unparsable_policy, "Unparsable lock record");
                    self.metrics
                        .increment_counter(names::LOCK_UNPARSABLE, &[("room_id", room_id)]);
                    match self.config.unparsable_policy {
                        UnparsablePolicy::Skip => continue,
                        UnparsablePolicy::TreatAsConflict => {
                            return Ok(Scan::Conflict {
                                key,
                                reason: "unparsable_record",
                            })
                        }
                    }
                }
            };

            if record.room_id != room_id {
                continue;
            }
            if ranges_overlap(record.check_in, record.check_out, check_in, check_out) {
                return Ok(Scan::Conflict {
                    key,
                    reason: "overlapping_range",
                });
            }
        }
        Ok(Scan::Clear)
    }

    async fn acquire_room_guard(&self, room_id: &str) -> Result<Option<String>, LockError> {
        let key = guard_key(&self.tenant_id, room_id);
        let token = Uuid::new_v4().to_string();

        for attempt in 0..self.config.guard_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.config.guard_retry_delay).await;
            }
            if self
                .store
                .set_if_absent(&key, &token, self.config.guard_ttl)
                .await?
            {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    async fn release_room_guard(&self, room_id: &str, token: &str) {
        let key = guard_key(&self.tenant_id, room_id);
        match self.store.delete_if_equals(&key, token).await {
            Ok(true) => {}
            Ok(false) => warn!(guard_key = %key, "Room guard expired before release"),
            Err(e) => warn!(guard_key = %key, error = %e, "Room guard release failed, left to TTL"),
        }
    }

    async fn audit_event(&self, lock_key: &str, event_type: AuditEventType, details: serde_json::Value) {
        self.audit
            .record(LockAuditEvent {
                lock_key: lock_key.to_string(),
                event_type,
                timestamp: self.clock.now(),
                details,
                tenant_id: self.tenant_id.clone(),
            })
            .await;
    }
}
