use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::CacheConfig;
use crate::orchestrator::{OrchestratorSettings, ServiceConfig};
use crate::resilience::{BulkheadConfig, CircuitBreakerConfig};
use crate::security::{KeyStrategy, RateLimitPolicy, ValidationConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QuireConfig {
    pub server: ServerConfig,
    pub orchestrator: OrchestratorSettings,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// `"stdio"` or `"http"`.
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

impl Default for QuireConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            orchestrator: OrchestratorSettings::default(),
            services: default_services(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

/// The dependencies a writing assistant talks to: the story graph, a key-value
/// store, the language model, and local text analysis.
pub fn default_services() -> Vec<ServiceConfig> {
    let per_ip = |max| RateLimitPolicy::new("per-ip", Duration::from_secs(60), max);
    vec![
        ServiceConfig::new("graph")
            .with_timeout(Duration::from_secs(5))
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_bulkhead(BulkheadConfig::default())
            .with_cache(CacheConfig::default())
            .with_rate_limit(per_ip(100))
            .with_validation(ValidationConfig::default()),
        ServiceConfig::new("kv")
            .with_timeout(Duration::from_secs(1))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 5,
                open_timeout_ms: 10_000,
            })
            .with_bulkhead(BulkheadConfig {
                max_concurrency: 50,
                queue_depth: 200,
                queue_timeout_ms: None,
            })
            .with_cache(CacheConfig {
                max_entries: 5_000,
                ..CacheConfig::default()
            })
            .with_rate_limit(per_ip(300)),
        ServiceConfig::new("llm")
            .with_timeout(Duration::from_secs(60))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 3,
                open_timeout_ms: 60_000,
            })
            .with_bulkhead(BulkheadConfig {
                max_concurrency: 4,
                queue_depth: 20,
                queue_timeout_ms: Some(30_000),
            })
            .with_cache(CacheConfig {
                max_entries: 200,
                compression_threshold: 512,
                ..CacheConfig::default()
            })
            .with_rate_limit(
                RateLimitPolicy::new("per-user", Duration::from_secs(60), 20)
                    .keyed_by(KeyStrategy::User),
            )
            .with_rate_limit(per_ip(30))
            .with_validation(ValidationConfig::default()),
        ServiceConfig::new("analysis")
            .with_timeout(Duration::from_secs(2))
            .with_circuit_breaker(CircuitBreakerConfig::default())
            .with_bulkhead(BulkheadConfig {
                max_concurrency: 8,
                queue_depth: 32,
                queue_timeout_ms: Some(5_000),
            })
            .with_cache(CacheConfig::default())
            .with_rate_limit(per_ip(60))
            .with_validation(ValidationConfig::default()),
    ]
}

/// Returns `~/.quire/`
pub fn default_quire_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quire")
}

/// Returns the default config file path: `~/.quire/config.toml`
pub fn default_config_path() -> PathBuf {
    default_quire_dir().join("config.toml")
}

impl QuireConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            QuireConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (QUIRE_LOG_LEVEL, QUIRE_TRANSPORT, QUIRE_PORT).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("QUIRE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("QUIRE_TRANSPORT") {
            self.server.transport = val;
        }
        if let Ok(val) = std::env::var("QUIRE_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %val, "ignoring invalid QUIRE_PORT"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.server.transport.as_str(), "stdio" | "http") {
            bail!(
                "unknown transport '{}', expected 'stdio' or 'http'",
                self.server.transport
            );
        }
        self.orchestrator
            .profiler
            .check()
            .context("invalid [orchestrator.profiler] section")?;
        let mut seen = HashSet::new();
        for service in &self.services {
            service
                .check()
                .with_context(|| format!("invalid service '{}'", service.name))?;
            if !seen.insert(service.name.as_str()) {
                bail!("service '{}' is configured twice", service.name);
            }
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }
}
