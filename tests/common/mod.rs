#![allow(dead_code)]

use idempotency_engine::audit::{AuditAction, AuditEvent, MemoryAuditSink};
use idempotency_engine::engine::{Engine, EngineConfig};
use idempotency_engine::store::MemoryIdempotencyStore;
use std::sync::Arc;
use std::time::Duration;

pub const DAY: Duration = Duration::from_millis(86_400_000);

pub fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().compact())
        .try_init()
        .ok();
}

pub struct TestHarness {
    pub engine: Engine<MemoryIdempotencyStore>,
    pub store: Arc<MemoryIdempotencyStore>,
    pub sink: Arc<MemoryAuditSink>,
}

pub fn harness() -> TestHarness {
    harness_with_config(EngineConfig::new(Duration::from_millis(200), DAY))
}

pub fn harness_with_config(config: EngineConfig) -> TestHarness {
    init_tracing();

    let store = Arc::new(MemoryIdempotencyStore::new());
    let sink = Arc::new(MemoryAuditSink::new());
    let engine = Engine::new(Arc::clone(&store), config, sink.clone())
        .expect("test engine config should be valid");

    TestHarness {
        engine,
        store,
        sink,
    }
}

pub fn actions(events: &[AuditEvent]) -> Vec<AuditAction> {
    events.iter().map(|event| event.action).collect()
}
