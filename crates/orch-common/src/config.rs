//! ---
//! orch_section: "01-shared-primitives"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Shared configuration model and loader."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_provisioning_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_operation_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_provider_latency() -> Duration {
    Duration::from_millis(500)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Primary configuration object for the orchestrator daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "ORCH_CONFIG";

    /// Load configuration from disk, respecting the `ORCH_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        for (name, provider) in &self.providers {
            if name.trim().is_empty() {
                return Err(anyhow!("provider names must not be empty"));
            }
            provider.validate(name)?;
        }
        if let Some(default_provider) = &self.engine.default_provider {
            let known = self
                .providers
                .keys()
                .any(|name| name.eq_ignore_ascii_case(default_provider));
            if !known {
                return Err(anyhow!(
                    "engine default_provider '{default_provider}' has no [providers] table"
                ));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Tuning for the background execution engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Simulated latency of a single provisioning call.
    #[serde(rename = "provisioning_delay_ms", default = "default_provisioning_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub provisioning_delay: Duration,
    /// Simulated latency of a single resource action.
    #[serde(rename = "operation_delay_ms", default = "default_operation_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub operation_delay: Duration,
    /// Upper bound on a background unit; unset means units run to completion.
    #[serde(rename = "execution_timeout_secs", default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub execution_timeout: Option<Duration>,
    /// Serialise background operations that target the same resource id.
    #[serde(default)]
    pub serialize_resource_operations: bool,
    /// Route provisioning and actions through this `[providers]` entry instead
    /// of the built-in simulation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provisioning_delay: default_provisioning_delay(),
            operation_delay: default_operation_delay(),
            execution_timeout: None,
            serialize_resource_operations: false,
            default_provider: None,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if matches!(self.execution_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(anyhow!("engine execution_timeout_secs must be greater than zero"));
        }
        self.retry.validate()
    }
}

/// Retry policy applied around provisioning backend calls.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", default = "default_retry_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    #[serde(rename = "jitter_ms", default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay: default_retry_base_delay(),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("engine retry max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Simulated provider registered under its table name.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "latency_ms", default = "default_provider_latency")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub latency: Duration,
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            latency: default_provider_latency(),
            metadata: IndexMap::new(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.metadata.keys().any(|key| key.trim().is_empty()) {
            return Err(anyhow!("provider '{}' declares an empty metadata key", name));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}
