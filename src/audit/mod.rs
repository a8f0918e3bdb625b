pub mod redact;
mod sink;

pub use redact::redact_metadata;
pub use sink::{MemoryAuditSink, TracingAuditSink};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle action recorded by an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Hit,
    Miss,
    Acquired,
    Locked,
    FingerprintMismatch,
    Stored,
    Error,
    Timeout,
    LockReleased,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Hit => "hit",
            AuditAction::Miss => "miss",
            AuditAction::Acquired => "acquired",
            AuditAction::Locked => "locked",
            AuditAction::FingerprintMismatch => "fingerprint_mismatch",
            AuditAction::Stored => "stored",
            AuditAction::Error => "error",
            AuditAction::Timeout => "timeout",
            AuditAction::LockReleased => "lock_released",
        }
    }
}

/// Immutable compliance record emitted by the engine.
///
/// `metadata` is always post-redaction; `stored_fingerprint` is present only
/// on `fingerprint_mismatch` events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// Destination for audit events.
///
/// Sinks are invoked inline from `execute` and must be reentrant under
/// concurrent calls. A failing sink never affects business logic; the engine
/// swallows the error and drops the event.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: &AuditEvent) -> Result<()>;
}
