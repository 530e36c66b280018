//! Postgres-backed stores: the lock audit trail, permanently failed DLQ
//! messages, and the shared key-value store that lets booking locks and the
//! DLQ span every instance pointed at the same database.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::{debug, info};

use crate::{
    audit::{AuditRepository, LockAuditEvent},
    config::{env_key, parse_or, seconds_or, EnvLookup, ProcessEnv},
    dlq::{PermanentFailure, PermanentFailureStore},
    error::{DatabaseError, StoreError},
    store::{KeyValueStore, StoreResult},
};

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/guest_messaging".to_string(),
            max_connections: 20,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup<L: EnvLookup + ?Sized>(env: &L) -> Self {
        let d = Self::default();
        Self {
            url: env.get(&env_key("database", "url")).unwrap_or(d.url),
            max_connections: parse_or(
                env,
                &env_key("database", "max_connections"),
                d.max_connections,
                |v| *v > 0,
            ),
            acquire_timeout: seconds_or(env, &env_key("database", "acquire_timeout_secs"), d.acquire_timeout),
        }
    }
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await?;
    info!(max_connections = config.max_connections, "Database pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgAuditRepository {
    pool: PgPool,
}

impl PgAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for PgAuditRepository {
    async fn insert(&self, event: &LockAuditEvent) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO lock_audit (lock_key, event_type, \"timestamp\", details, tenant_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.lock_key)
        .bind(event.event_type.as_str())
        .bind(event.timestamp)
        .bind(&event.details)
        .bind(&event.tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const FAILURE_COLUMNS: &str = "\
    id, message_payload, error_message, error_type, retry_count, \
    first_failed_at, last_retry_at";

#[derive(Debug, Clone)]
pub struct PgPermanentFailureStore {
    pool: PgPool,
}

impl PgPermanentFailureStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermanentFailureStore for PgPermanentFailureStore {
    async fn insert(&self, failure: &PermanentFailure) -> Result<(), DatabaseError> {
        let query = format!(
            "INSERT INTO dlq_permanent_failures ({FAILURE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO NOTHING"
        );
        sqlx::query(&query)
            .bind(&failure.id)
            .bind(&failure.message_payload)
            .bind(&failure.error_message)
            .bind(&failure.error_type)
            .bind(failure.retry_count)
            .bind(failure.first_failed_at)
            .bind(failure.last_retry_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<PermanentFailure>, DatabaseError> {
        let query = format!(
            "SELECT {FAILURE_COLUMNS} FROM dlq_permanent_failures \
             ORDER BY last_retry_at DESC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, PermanentFailure>(&query)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

// Row predicates over `kv_entries`
const LIVE: &str = "(expires_at IS NULL OR expires_at > now())";
const EXPIRED: &str = "(kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now())";

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

// LIKE pattern matching keys that start with `prefix` literally
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// `KeyValueStore` over two tables: `kv_entries` for strings, counters and
/// hashes, `kv_sorted` for sorted-set members. Expiry is evaluated against
/// the database clock, so every instance agrees on it. Expired rows are
/// invisible to reads and overwritten by conditional creates; `purge_expired`
/// deletes them.
#[derive(Debug, Clone)]
pub struct PgKeyValueStore {
    pool: PgPool,
}

impl PgKeyValueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for PgKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let query = format!(
            "INSERT INTO kv_entries (key, kind, value, fields, expires_at) \
             VALUES ($1, 'text', $2, NULL, now() + $3::float8 * interval '1 millisecond') \
             ON CONFLICT (key) DO UPDATE SET \
                 kind = EXCLUDED.kind, value = EXCLUDED.value, fields = NULL, \
                 expires_at = EXCLUDED.expires_at \
             WHERE {EXPIRED}"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(value)
            .bind(millis(ttl))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_if_present(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let query = format!(
            "UPDATE kv_entries SET kind = 'text', value = $2, fields = NULL, \
                 expires_at = now() + $3::float8 * interval '1 millisecond' \
             WHERE key = $1 AND {LIVE}"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(value)
            .bind(millis(ttl))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let query = format!("SELECT kind, value FROM kv_entries WHERE key = $1 AND {LIVE}");
        let row: Option<(String, Option<String>)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match row {
            None => Ok(None),
            Some((kind, value)) if kind == "text" || kind == "counter" => Ok(value),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let query = format!(
            "SELECT (EXTRACT(EPOCH FROM (expires_at - now())) * 1000)::BIGINT \
             FROM kv_entries WHERE key = $1 AND {LIVE}"
        );
        let row: Option<(Option<i64>,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row
            .and_then(|(remaining,)| remaining)
            .map(|ms| Duration::from_millis(u64::try_from(ms).unwrap_or(0))))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let query = format!("DELETE FROM kv_entries WHERE key = $1 RETURNING {LIVE}");
        let live: Option<(bool,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        let members = sqlx::query("DELETE FROM kv_sorted WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(live.map_or(false, |(live,)| live) || members.rows_affected() > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let query = format!(
            "DELETE FROM kv_entries WHERE key = $1 AND kind = 'text' AND value = $2 AND {LIVE}"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let query = format!(
            "SELECT key FROM kv_entries WHERE key LIKE $1 ESCAPE '\\' AND {LIVE} ORDER BY key"
        );
        let rows: Vec<(String,)> = sqlx::query_as(&query)
            .bind(like_prefix(prefix))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let query = format!(
            "INSERT INTO kv_entries (key, kind, value, fields, expires_at) \
             VALUES ($1, 'hash', NULL, $2, \
                 CASE WHEN $3::BIGINT IS NULL THEN NULL \
                 ELSE now() + $3::float8 * interval '1 millisecond' END) \
             ON CONFLICT (key) DO UPDATE SET \
                 kind = 'hash', \
                 value = NULL, \
                 fields = CASE WHEN {EXPIRED} THEN EXCLUDED.fields \
                     ELSE kv_entries.fields || EXCLUDED.fields END, \
                 expires_at = CASE WHEN EXCLUDED.expires_at IS NOT NULL THEN EXCLUDED.expires_at \
                     WHEN {EXPIRED} THEN NULL \
                     ELSE kv_entries.expires_at END \
             WHERE kv_entries.kind = 'hash' OR {EXPIRED}"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(Json(fields))
            .bind(ttl.map(millis))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
            });
        }
        Ok(())
    }

    async fn hash_update_if_present(
        &self,
        key: &str,
        fields: &HashMap<String, String>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let query = format!(
            "UPDATE kv_entries SET \
                 fields = fields || $2, \
                 expires_at = CASE WHEN $3::BIGINT IS NULL THEN expires_at \
                     ELSE now() + $3::float8 * interval '1 millisecond' END \
             WHERE key = $1 AND kind = 'hash' AND {LIVE}"
        );
        let result = sqlx::query(&query)
            .bind(key)
            .bind(Json(fields))
            .bind(ttl.map(millis))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        let query = format!("SELECT kind, fields FROM kv_entries WHERE key = $1 AND {LIVE}");
        let row: Option<(String, Option<Json<HashMap<String, String>>>)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match row {
            None => Ok(None),
            Some((kind, fields)) if kind == "hash" => {
                Ok(Some(fields.map(|Json(fields)| fields).unwrap_or_default()))
            }
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
            }),
        }
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO kv_sorted (key, member, score) VALUES ($1, $2, $3) \
             ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score",
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        sqlx::query_as(
            "SELECT member, score FROM kv_sorted \
             WHERE key = $1 AND score >= $2 AND score <= $3 \
             ORDER BY score, member",
        )
        .bind(key)
        .bind(min)
        .bind(max)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM kv_sorted WHERE key = $1 AND member = $2")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() == 1)
    }

    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let query = format!(
            "INSERT INTO kv_entries (key, kind, value) VALUES ($1, 'counter', $2::BIGINT::TEXT) \
             ON CONFLICT (key) DO UPDATE SET \
                 kind = 'counter', \
                 value = ((CASE WHEN {EXPIRED} THEN 0 ELSE kv_entries.value::BIGINT END) \
                     + $2::BIGINT)::TEXT, \
                 expires_at = CASE WHEN {EXPIRED} THEN NULL ELSE kv_entries.expires_at END \
             WHERE kv_entries.kind IN ('counter', 'text') OR {EXPIRED} \
             RETURNING value"
        );
        let row: Option<(Option<String>,)> = sqlx::query_as(&query)
            .bind(key)
            .bind(delta)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        let Some((value,)) = row else {
            return Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "counter",
            });
        };
        value
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| StoreError::InvalidCounter(key.to_string()))
    }

    async fn get_counter(&self, key: &str) -> StoreResult<i64> {
        let query = format!("SELECT kind, value FROM kv_entries WHERE key = $1 AND {LIVE}");
        let row: Option<(String, Option<String>)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match row {
            None => Ok(0),
            Some((kind, value)) if kind == "counter" || kind == "text" => value
                .and_then(|v| v.parse::<i64>().ok())
                .ok_or_else(|| StoreError::InvalidCounter(key.to_string())),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "counter",
            }),
        }
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= now()")
                .execute(&self.pool)
                .await
                .map_err(unavailable)?;
        debug!(purged = result.rows_affected(), "Purged expired store rows");
        Ok(result.rows_affected())
    }
}
