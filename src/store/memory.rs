use super::{CheckAndLock, IdempotencyStore};
use crate::audit::AuditEvent;
use crate::error::{EngineError, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum MemoryRecord {
    Processing {
        lock_expires_at: DateTime<Utc>,
    },
    Committed {
        fingerprint: String,
        result: Value,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

/// In-process store backed by a mutex-guarded map.
///
/// The mutex makes check-or-lock atomic within one process, which is the
/// extent of this adapter's guarantee; multi-node deployments need a shared
/// backend. Expired records are reclaimed lazily on the next access.
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, MemoryRecord>>,
    audit_log: Mutex<Vec<AuditEvent>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events persisted via `record_audit`, in append order.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit_log.lock().expect("poisoned audit log").clone()
    }

    /// True when a live (unexpired) record exists for the key.
    pub fn contains_key(&self, key: &str) -> bool {
        let entries = self.entries.lock().expect("poisoned store");
        match entries.get(key) {
            Some(record) => !is_expired(record, Utc::now()),
            None => false,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().expect("poisoned store").clear();
        self.audit_log.lock().expect("poisoned audit log").clear();
    }
}

fn is_expired(record: &MemoryRecord, now: DateTime<Utc>) -> bool {
    match record {
        MemoryRecord::Processing { lock_expires_at } => *lock_expires_at <= now,
        MemoryRecord::Committed { expires_at, .. } => *expires_at <= now,
    }
}

fn millis(duration: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis() as i64)
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn atomic_check_and_lock(
        &self,
        key: &str,
        _fingerprint: &str,
        lock_ttl: Duration,
    ) -> Result<CheckAndLock> {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("poisoned store");

        let live = entries
            .get(key)
            .filter(|record| !is_expired(record, now))
            .cloned();

        match live {
            Some(MemoryRecord::Processing { .. }) => Ok(CheckAndLock::Locked),
            Some(MemoryRecord::Committed {
                fingerprint,
                result,
                created_at,
                ..
            }) => Ok(CheckAndLock::Exists {
                fingerprint,
                result,
                created_at,
            }),
            None => {
                entries.insert(
                    key.to_string(),
                    MemoryRecord::Processing {
                        lock_expires_at: now + millis(lock_ttl),
                    },
                );
                Ok(CheckAndLock::Acquired)
            }
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
        let mut entries = self.entries.lock().expect("poisoned store");

        let holds_live_lock = matches!(
            entries.get(key),
            Some(record @ MemoryRecord::Processing { .. }) if !is_expired(record, now)
        );
        if !holds_live_lock {
            return Err(EngineError::Store(anyhow!(
                "no active processing record to commit for key '{key}'"
            )));
        }

        entries.insert(
            key.to_string(),
            MemoryRecord::Committed {
                fingerprint: fingerprint.to_string(),
                result,
                created_at: now,
                expires_at: now + millis(retention),
            },
        );
        Ok(())
    }

    async fn release_lock(&self, key: &str) {
        let mut entries = self.entries.lock().expect("poisoned store");
        let held = matches!(entries.get(key), Some(MemoryRecord::Processing { .. }));
        if held {
            entries.remove(key);
        }
    }

    async fn record_audit(&self, event: &AuditEvent) {
        self.audit_log
            .lock()
            .expect("poisoned audit log")
            .push(event.clone());
    }
}
