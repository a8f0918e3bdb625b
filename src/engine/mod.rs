use crate::audit::{redact_metadata, AuditAction, AuditEvent, AuditSink};
use crate::error::{EngineError, Result};
use crate::fingerprint::{fingerprint_with, FingerprintAlgorithm};
use crate::store::{CheckAndLock, IdempotencyStore};
use anyhow::anyhow;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MIN_LOCK_TTL: Duration = Duration::from_millis(50);
pub const MAX_LOCK_TTL: Duration = Duration::from_millis(300_000);
pub const MIN_HANDLER_TIMEOUT: Duration = Duration::from_millis(50);
pub const MAX_HANDLER_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_millis(30_000);

/// PCI-DSS floor: committed results stay queryable for at least 24 hours.
pub const MIN_RETENTION: Duration = Duration::from_millis(86_400_000);

/// Engine-level configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub lock_ttl: Duration,
    pub retention: Duration,
    pub fingerprint_algorithm: FingerprintAlgorithm,
    pub key_prefix: String,
}

impl EngineConfig {
    pub fn new(lock_ttl: Duration, retention: Duration) -> Self {
        Self {
            lock_ttl,
            retention,
            fingerprint_algorithm: FingerprintAlgorithm::default(),
            key_prefix: String::new(),
        }
    }

    pub fn with_fingerprint_algorithm(mut self, name: &str) -> Result<Self> {
        self.fingerprint_algorithm = name.parse()?;
        Ok(self)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn validate(&self) -> Result<()> {
        validate_lock_ttl(self.lock_ttl)?;
        validate_retention(self.retention)?;
        Ok(())
    }
}

fn validate_lock_ttl(lock_ttl: Duration) -> Result<()> {
    if lock_ttl < MIN_LOCK_TTL || lock_ttl > MAX_LOCK_TTL {
        return Err(EngineError::Validation(format!(
            "lock TTL must be between {}ms and {}ms, got {}ms",
            MIN_LOCK_TTL.as_millis(),
            MAX_LOCK_TTL.as_millis(),
            lock_ttl.as_millis()
        )));
    }
    Ok(())
}

fn validate_handler_timeout(timeout: Duration) -> Result<()> {
    if timeout < MIN_HANDLER_TIMEOUT || timeout > MAX_HANDLER_TIMEOUT {
        return Err(EngineError::Validation(format!(
            "handler timeout must be between {}ms and {}ms, got {}ms",
            MIN_HANDLER_TIMEOUT.as_millis(),
            MAX_HANDLER_TIMEOUT.as_millis(),
            timeout.as_millis()
        )));
    }
    Ok(())
}

fn validate_retention(retention: Duration) -> Result<()> {
    if retention < MIN_RETENTION {
        return Err(EngineError::InvalidRetention {
            retention_ms: retention.as_millis() as u64,
        });
    }
    Ok(())
}

/// Per-call overrides for `Engine::execute`.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Replaces the engine-level audit sink for this call only.
    pub on_audit: Option<Arc<dyn AuditSink>>,
    /// Replaces the 30 s default; validated against the same bounds as the
    /// lock TTL.
    pub handler_timeout: Option<Duration>,
    /// Replaces the engine retention for this call's commit; still at least
    /// 24 hours.
    pub retention_override: Option<Duration>,
    /// Merged into every audit event of this call, post-redaction.
    pub metadata: Option<Map<String, Value>>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.on_audit = Some(sink);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_retention_override(mut self, retention: Duration) -> Self {
        self.retention_override = Some(retention);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

struct AuditContext {
    sink: Arc<dyn AuditSink>,
    key: String,
    metadata: Map<String, Value>,
}

/// Orchestrates the lock/execute/commit lifecycle over a store.
///
/// All cross-task coordination happens in the store's atomic primitive; the
/// engine itself holds no locks across its suspension points, so any number
/// of `execute` calls may run concurrently on one instance.
pub struct Engine<S> {
    store: Arc<S>,
    config: EngineConfig,
    sink: Arc<dyn AuditSink>,
}

impl<S: IdempotencyStore> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig, sink: Arc<dyn AuditSink>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            sink,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fingerprints a payload with the engine's configured algorithm.
    pub fn fingerprint(&self, payload: &Value) -> String {
        fingerprint_with(payload, self.config.fingerprint_algorithm)
    }

    /// Executes `handler` at most once for `(key, fingerprint)`.
    ///
    /// Duplicate calls return the memoized result; a duplicate with a
    /// different fingerprint fails with `FingerprintMismatch` and is audited
    /// as a security event; a call racing a live holder fails with
    /// `OperationInProgress`. The handler runs under a timeout and its
    /// failure propagates verbatim after the failure audit and a best-effort
    /// lock release.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        handler: F,
        options: ExecuteOptions,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(EngineError::InvalidKey);
        }

        let handler_timeout = options.handler_timeout.unwrap_or(DEFAULT_HANDLER_TIMEOUT);
        validate_handler_timeout(handler_timeout)?;
        if let Some(retention) = options.retention_override {
            validate_retention(retention)?;
        }
        let retention = options.retention_override.unwrap_or(self.config.retention);

        let full_key = format!("{}{}", self.config.key_prefix, trimmed);
        let ctx = AuditContext {
            sink: options
                .on_audit
                .unwrap_or_else(|| Arc::clone(&self.sink)),
            key: full_key.clone(),
            metadata: options.metadata.unwrap_or_default(),
        };

        let probe = self
            .store
            .atomic_check_and_lock(&full_key, fingerprint, self.config.lock_ttl)
            .await?;

        match probe {
            CheckAndLock::Exists {
                fingerprint: stored,
                result,
                created_at: _,
            } => {
                if stored == fingerprint {
                    debug!(key = %full_key, "idempotency hit, returning memoized result");
                    self.emit(&ctx, AuditAction::Hit, Some(fingerprint), None)
                        .await;
                    serde_json::from_value(result).map_err(|e| {
                        EngineError::Internal(anyhow!(
                            "failed to deserialize memoized result: {e}"
                        ))
                    })
                } else {
                    warn!(key = %full_key, "fingerprint mismatch on committed key");
                    self.emit(
                        &ctx,
                        AuditAction::FingerprintMismatch,
                        Some(fingerprint),
                        Some(&stored),
                    )
                    .await;
                    Err(EngineError::FingerprintMismatch {
                        stored_fingerprint: stored,
                    })
                }
            }
            CheckAndLock::Locked => {
                self.emit(&ctx, AuditAction::Locked, Some(fingerprint), None)
                    .await;
                Err(EngineError::OperationInProgress)
            }
            CheckAndLock::Acquired => {
                self.emit(&ctx, AuditAction::Acquired, Some(fingerprint), None)
                    .await;

                let outcome = self
                    .run_acquired(&full_key, fingerprint, handler, handler_timeout, retention, &ctx)
                    .await;

                // Best-effort in every exit path; the TTL reclaims the lock
                // when release is unavailable or fails.
                self.store.release_lock(&full_key).await;
                self.emit(&ctx, AuditAction::LockReleased, Some(fingerprint), None)
                    .await;

                outcome
            }
        }
    }

    async fn run_acquired<T, F, Fut>(
        &self,
        full_key: &str,
        fingerprint: &str,
        handler: F,
        handler_timeout: Duration,
        retention: Duration,
        ctx: &AuditContext,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let value = match tokio::time::timeout(handler_timeout, handler()).await {
            Err(_elapsed) => {
                let err = EngineError::HandlerTimeout {
                    timeout_ms: handler_timeout.as_millis() as u64,
                };
                self.emit_failure(ctx, AuditAction::Timeout, &err, fingerprint)
                    .await;
                return Err(err);
            }
            Ok(Err(err)) => {
                self.emit_failure(ctx, AuditAction::Error, &err, fingerprint)
                    .await;
                return Err(err);
            }
            Ok(Ok(value)) => value,
        };

        let serialized = match serde_json::to_value(&value) {
            Ok(serialized) => serialized,
            Err(e) => {
                let err =
                    EngineError::Internal(anyhow!("failed to serialize handler result: {e}"));
                self.emit_failure(ctx, AuditAction::Error, &err, fingerprint)
                    .await;
                return Err(err);
            }
        };

        match self
            .store
            .commit_result(full_key, fingerprint, serialized, retention)
            .await
        {
            Ok(()) => {
                self.emit(ctx, AuditAction::Stored, Some(fingerprint), None)
                    .await;
                Ok(value)
            }
            Err(err) => {
                self.emit_failure(ctx, AuditAction::Error, &err, fingerprint)
                    .await;
                Err(err)
            }
        }
    }

    async fn emit(
        &self,
        ctx: &AuditContext,
        action: AuditAction,
        fingerprint: Option<&str>,
        stored_fingerprint: Option<&str>,
    ) {
        self.dispatch(ctx, action, fingerprint, stored_fingerprint, ctx.metadata.clone())
            .await;
    }

    async fn emit_failure(
        &self,
        ctx: &AuditContext,
        action: AuditAction,
        err: &EngineError,
        fingerprint: &str,
    ) {
        let mut metadata = ctx.metadata.clone();
        metadata.insert("error".to_string(), Value::String(err.to_string()));
        metadata.insert(
            "error_code".to_string(),
            Value::String(err.code().to_string()),
        );
        self.dispatch(ctx, action, Some(fingerprint), None, metadata)
            .await;
    }

    async fn dispatch(
        &self,
        ctx: &AuditContext,
        action: AuditAction,
        fingerprint: Option<&str>,
        stored_fingerprint: Option<&str>,
        metadata: Map<String, Value>,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            key: ctx.key.clone(),
            action,
            fingerprint: fingerprint.map(str::to_string),
            stored_fingerprint: stored_fingerprint.map(str::to_string),
            metadata: redact_metadata(&metadata),
        };

        if let Err(error) = ctx.sink.emit(&event).await {
            warn!(
                key = %event.key,
                action = action.as_str(),
                %error,
                "audit sink failed, event dropped"
            );
        }

        self.store.record_audit(&event).await;
    }
}
