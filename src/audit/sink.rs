use super::{AuditAction, AuditEvent, AuditSink};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Sink that forwards every event to the process log via `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        info!(
            key = %event.key,
            action = event.action.as_str(),
            fingerprint = event.fingerprint.as_deref(),
            "idempotency audit event"
        );
        Ok(())
    }
}

/// In-process sink that keeps every emitted event, used in tests and for
/// single-node deployments that flush the buffer themselves.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("poisoned audit sink").clone()
    }

    /// Action tags in emission order, the shape most assertions care about.
    pub fn actions(&self) -> Vec<AuditAction> {
        self.events
            .lock()
            .expect("poisoned audit sink")
            .iter()
            .map(|event| event.action)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("poisoned audit sink").clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .expect("poisoned audit sink")
            .push(event.clone());
        Ok(())
    }
}
