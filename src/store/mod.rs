pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::MemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use redis::RedisIdempotencyStore;

use crate::audit::AuditEvent;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Status of a persisted key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Processing,
    Committed,
}

/// Reference wire layout for a key record. Adapters that speak JSON (Redis,
/// document stores) persist this shape; others may choose their own
/// representation as long as the contract below holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_acquired_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    /// A fresh `processing` record for the lock window starting now.
    pub fn processing(now: DateTime<Utc>) -> Self {
        Self {
            status: RecordStatus::Processing,
            fingerprint: None,
            result: None,
            created_at: Some(now),
            lock_acquired_at: Some(now),
        }
    }

    /// A `committed` record carrying the memoized result.
    pub fn committed(fingerprint: String, result: Value, now: DateTime<Utc>) -> Self {
        Self {
            status: RecordStatus::Committed,
            fingerprint: Some(fingerprint),
            result: Some(result),
            created_at: Some(now),
            lock_acquired_at: None,
        }
    }
}

/// Outcome of the atomic check-or-lock primitive.
#[derive(Debug, Clone)]
pub enum CheckAndLock {
    /// No record existed; a `processing` record was installed and the caller
    /// now holds the lock.
    Acquired,
    /// A live `processing` record is held by another caller.
    Locked,
    /// A committed record exists; the stored result is returned as-is.
    Exists {
        fingerprint: String,
        result: Value,
        created_at: DateTime<Utc>,
    },
}

/// Atomic contract every backend must provide.
///
/// The engine performs no cross-task coordination of its own; correctness
/// under concurrency reduces entirely to the atomicity of
/// `atomic_check_and_lock` (a server-side script, conditional write, or
/// transaction with row locking).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Single atomic action: install a `processing` record and return
    /// `Acquired` when the key is absent, report `Locked` for a live
    /// `processing` record, or return the committed record. Corrupt or
    /// unparseable records are treated as absent and may be overwritten.
    async fn atomic_check_and_lock(
        &self,
        key: &str,
        fingerprint: &str,
        lock_ttl: Duration,
    ) -> Result<CheckAndLock>;

    /// Atomically replaces the caller's `processing` record with a
    /// `committed` one expiring after `retention`. Fails when no live
    /// `processing` record is present (lock expired, already committed, or
    /// the key was wiped).
    async fn commit_result(
        &self,
        key: &str,
        fingerprint: &str,
        result: Value,
        retention: Duration,
    ) -> Result<()>;

    /// Best-effort removal of a `processing` record. Never removes a
    /// committed record and never fails; the lock TTL is the correctness
    /// backstop.
    async fn release_lock(&self, _key: &str) {}

    /// Appends an audit event to the store's log, if it keeps one. Must not
    /// fail.
    async fn record_audit(&self, _event: &AuditEvent) {}

    /// Releases adapter resources.
    async fn close(&self) {}
}
