use crate::engine::EngineConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub engine: EngineSettings,
    pub redis: Option<RedisSettings>,
    pub database: Option<DatabaseSettings>,
}

#[derive(Debug, Deserialize)]
pub struct EngineSettings {
    pub lock_ttl_ms: u64,
    pub retention_ms: u64,
    #[serde(default = "default_fingerprint_algorithm")]
    pub fingerprint_algorithm: String,
    #[serde(default)]
    pub key_prefix: String,
}

#[derive(Debug, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

fn default_fingerprint_algorithm() -> String {
    "sha256".to_string()
}

impl Settings {
    /// Layers `config/default`, an optional `config/local`, and
    /// `IDEM__`-prefixed environment variables.
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("IDEM").separator("__"));

        builder.build()?.try_deserialize()
    }
}

impl EngineSettings {
    /// Converts loaded settings into a validated-on-construction
    /// `EngineConfig`; bound checks happen in `Engine::new`.
    pub fn to_engine_config(&self) -> crate::error::Result<EngineConfig> {
        Ok(EngineConfig::new(
            Duration::from_millis(self.lock_ttl_ms),
            Duration::from_millis(self.retention_ms),
        )
        .with_fingerprint_algorithm(&self.fingerprint_algorithm)?
        .with_key_prefix(self.key_prefix.clone()))
    }
}
