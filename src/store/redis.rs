use super::{CheckAndLock, IdempotencyStore, KeyRecord};
use crate::audit::AuditEvent;
use crate::error::{EngineError, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

// All three operations run server-side so the check and the write are one
// atomic action. Records that fail cjson decoding, or committed records
// missing their payload fields, are treated as absent and overwritten.
static CHECK_AND_LOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if raw then
            local ok, record = pcall(cjson.decode, raw)
            if ok and type(record) == 'table' then
                if record.status == 'committed' and record.fingerprint and record.result ~= nil then
                    return {'exists', raw}
                end
                if record.status == 'processing' then
                    return {'locked'}
                end
            end
        end
        redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
        return {'acquired'}
        "#,
    )
});

static COMMIT_RESULT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if not raw then
            return 0
        end
        local ok, record = pcall(cjson.decode, raw)
        if not ok or type(record) ~= 'table' or record.status ~= 'processing' then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
        return 1
        "#,
    )
});

static RELEASE_LOCK: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local raw = redis.call('GET', KEYS[1])
        if raw then
            local ok, record = pcall(cjson.decode, raw)
            if ok and type(record) == 'table' and record.status == 'processing' then
                redis.call('DEL', KEYS[1])
            end
        end
        return 1
        "#,
    )
});

/// Redis-backed store. Key records are JSON values in the reference wire
/// layout with a PX expiry; the audit log is an append-only list.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    audit_key: String,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client) -> Self {
        Self::with_audit_key(client, "idempotency:audit")
    }

    pub fn with_audit_key(client: redis::Client, audit_key: impl Into<String>) -> Self {
        Self {
            client,
            audit_key: audit_key.into(),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Store(anyhow!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn atomic_check_and_lock(
        &self,
        key: &str,
        _fingerprint: &str,
        lock_ttl: Duration,
    ) -> Result<CheckAndLock> {
        let mut conn = self.connection().await?;

        let record = KeyRecord::processing(Utc::now());
        let payload = serde_json::to_string(&record)
            .map_err(|e| EngineError::Store(anyhow!("failed to serialize lock record: {e}")))?;

        let reply: Vec<String> = CHECK_AND_LOCK
            .key(key)
            .arg(payload)
            .arg(lock_ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| EngineError::Store(anyhow!("check-and-lock script failed: {e}")))?;

        match reply.first().map(String::as_str) {
            Some("acquired") => Ok(CheckAndLock::Acquired),
            Some("locked") => Ok(CheckAndLock::Locked),
            Some("exists") => {
                let raw = reply
                    .get(1)
                    .ok_or_else(|| EngineError::Store(anyhow!("exists reply missing record")))?;
                let stored: KeyRecord = serde_json::from_str(raw).map_err(|e| {
                    EngineError::Store(anyhow!("committed record failed to parse: {e}"))
                })?;
                Ok(CheckAndLock::Exists {
                    fingerprint: stored.fingerprint.unwrap_or_default(),
                    result: stored.result.unwrap_or(Value::Null),
                    created_at: stored.created_at.unwrap_or_else(Utc::now),
                })
            }
            other => Err(EngineError::Store(anyhow!(
                "unexpected check-and-lock reply: {other:?}"
            ))),
        }
    }

    async fn commit_result(
        &self,
        key: &str,
        fingerprint: &str,
        result: Value,
        retention: Duration,
    ) -> Result<()> {
        let mut conn = self.connection().await?;

        let record = KeyRecord::committed(fingerprint.to_string(), result, Utc::now());
        let payload = serde_json::to_string(&record)
            .map_err(|e| EngineError::Store(anyhow!("failed to serialize result record: {e}")))?;

        let committed: i64 = COMMIT_RESULT
            .key(key)
            .arg(payload)
            .arg(retention.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| EngineError::Store(anyhow!("commit script failed: {e}")))?;

        if committed == 1 {
            Ok(())
        } else {
            Err(EngineError::Store(anyhow!(
                "no active processing record to commit for key '{key}'"
            )))
        }
    }

    async fn release_lock(&self, key: &str) {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(key, %error, "failed to connect for lock release");
                return;
            }
        };

        let released: std::result::Result<i64, _> =
            RELEASE_LOCK.key(key).invoke_async(&mut conn).await;
        if let Err(error) = released {
            warn!(key, %error, "failed to release idempotency lock");
        }
    }

    async fn record_audit(&self, event: &AuditEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(key = %event.key, %error, "failed to serialize audit event");
                return;
            }
        };

        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(key = %event.key, %error, "failed to connect for audit append");
                return;
            }
        };

        let appended: std::result::Result<i64, _> =
            conn.rpush(&self.audit_key, payload).await;
        if let Err(error) = appended {
            warn!(key = %event.key, %error, "failed to append audit event");
        }
    }
}
