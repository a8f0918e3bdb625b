use super::{CheckAndLock, IdempotencyStore};
use crate::audit::AuditEvent;
use crate::error::{EngineError, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_records (
    key TEXT PRIMARY KEY,
    status VARCHAR(16) NOT NULL,
    fingerprint TEXT,
    result JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    lock_expires_at TIMESTAMPTZ,
    expires_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS idempotency_audit (
    id BIGSERIAL PRIMARY KEY,
    recorded_at TIMESTAMPTZ NOT NULL,
    key TEXT NOT NULL,
    action VARCHAR(32) NOT NULL,
    event JSONB NOT NULL
);
"#;

/// PostgreSQL-backed store. The check-or-lock primitive is one conditional
/// upsert: the insert wins when the key is absent, and the `DO UPDATE` arm
/// reclaims rows whose lock or retention window has lapsed (and rows with an
/// unrecognized status or a committed row missing its payload, which are
/// treated as corrupt).
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the backing tables when they do not exist yet. Deployments
    /// with their own migration pipeline can run the equivalent DDL there
    /// instead.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Store(anyhow!("failed to create schema: {e}")))?;
        Ok(())
    }

    /// Deletes records whose retention or lock window has lapsed. Postgres
    /// has no per-row TTL, so deployments run this from a periodic job.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE (status = 'committed' AND expires_at <= NOW())
               OR (status = 'processing' AND lock_expires_at <= NOW())
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(anyhow!("cleanup failed: {e}")))?;

        Ok(result.rows_affected())
    }
}

fn millis(duration: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis() as i64)
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn atomic_check_and_lock(
        &self,
        key: &str,
        _fingerprint: &str,
        lock_ttl: Duration,
    ) -> Result<CheckAndLock> {
        let now = Utc::now();
        let lock_expires_at = now + millis(lock_ttl);

        let upsert = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, status, created_at, lock_expires_at)
            VALUES ($1, 'processing', $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET status = 'processing',
                    created_at = $2,
                    lock_expires_at = $3,
                    fingerprint = NULL,
                    result = NULL,
                    expires_at = NULL
                WHERE (idempotency_records.status = 'processing'
                        AND idempotency_records.lock_expires_at <= $2)
                   OR (idempotency_records.status = 'committed'
                        AND (idempotency_records.expires_at <= $2
                             OR idempotency_records.fingerprint IS NULL
                             OR idempotency_records.result IS NULL))
                   OR idempotency_records.status NOT IN ('processing', 'committed')
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(lock_expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(anyhow!("check-and-lock failed: {e}")))?;

        if upsert.rows_affected() == 1 {
            return Ok(CheckAndLock::Acquired);
        }

        // The upsert lost to a live holder; classify the surviving row.
        let row: Option<(String, Option<String>, Option<Value>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT status, fingerprint, result, created_at
                FROM idempotency_records
                WHERE key = $1
                "#,
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::Store(anyhow!("record lookup failed: {e}")))?;

        match row {
            Some((status, Some(fingerprint), Some(result), created_at))
                if status == "committed" =>
            {
                Ok(CheckAndLock::Exists {
                    fingerprint,
                    result,
                    created_at,
                })
            }
            // A processing holder, or a row that changed hands between the
            // two statements; the caller sees a lock either way.
            Some(_) | None => Ok(CheckAndLock::Locked),
        }
    }

    async fn commit_result(
        &self,
        key: &str,
        fingerprint: &str,
        result: Value,
        retention: Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + millis(retention);

        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'committed',
                fingerprint = $2,
                result = $3,
                created_at = $4,
                expires_at = $5,
                lock_expires_at = NULL
            WHERE key = $1
              AND status = 'processing'
              AND lock_expires_at > $4
            "#,
        )
        .bind(key)
        .bind(fingerprint)
        .bind(&result)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Store(anyhow!("commit failed: {e}")))?;

        if updated.rows_affected() == 1 {
            Ok(())
        } else {
            Err(EngineError::Store(anyhow!(
                "no active processing record to commit for key '{key}'"
            )))
        }
    }

    async fn release_lock(&self, key: &str) {
        let released = sqlx::query(
            "DELETE FROM idempotency_records WHERE key = $1 AND status = 'processing'",
        )
        .bind(key)
        .execute(&self.pool)
        .await;

        if let Err(error) = released {
            warn!(key, %error, "failed to release idempotency lock");
        }
    }

    async fn record_audit(&self, event: &AuditEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(key = %event.key, %error, "failed to serialize audit event");
                return;
            }
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_audit (recorded_at, key, action, event)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.timestamp)
        .bind(&event.key)
        .bind(event.action.as_str())
        .bind(&payload)
        .execute(&self.pool)
        .await;

        if let Err(error) = inserted {
            warn!(key = %event.key, %error, "failed to append audit event");
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
