//! Crate configuration: serde structs with defaults, loadable from an
//! optional file plus `STREAMCORE_*` environment overrides.

use {
    config::{Config as ConfigBuilder, ConfigError, Environment, File},
    serde::{Deserialize, Serialize},
    std::path::Path,
    std::time::Duration,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub dispatch: DispatchConfig,
    pub transport: TransportConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Load from an optional file, then apply environment overrides such as
    /// `STREAMCORE_TRANSPORT__CONNECT_TIMEOUT_MS=2000`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(Environment::with_prefix("STREAMCORE").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on one consumer-loop wait between drains.
    pub idle_wait_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { idle_wait_ms: 500 }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Socket read chunk size handed to demuxers.
    pub read_chunk_size: usize,
    /// Cap on an HTTP preamble head.
    pub max_head_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            read_chunk_size: 4096,
            max_head_bytes: 8192,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Max concurrent client connections per listening stream.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_clients: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `"pretty"` for development, `"json"` for production.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.dispatch.idle_wait(), Duration::from_millis(500));
        assert_eq!(cfg.transport.connect_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.transport.read_chunk_size, 4096);
        assert_eq!(cfg.server.max_clients, 1000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = CoreConfig::load(None).expect("load");
        assert_eq!(cfg.transport.max_head_bytes, 8192);
    }
}
