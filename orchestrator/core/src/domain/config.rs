// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Mesh Configuration Types
//
// Defines the configuration schema for an AEGIS agent mesh, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Liveness thresholds for the health monitor
// - Coordination retry, timeout and quorum settings
// - Event bus and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "MeshConfig";

/// Top-level Kubernetes-style mesh configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MeshConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: MeshConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfigSpec {
    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Two-tier heartbeat liveness thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Silence after which an agent becomes UNHEALTHY (T).
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Multiplier K: silence beyond `T * K` evicts the agent to OFFLINE.
    #[serde(default = "default_offline_multiplier")]
    pub offline_multiplier: u32,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Records evaluated per sweep batch before yielding.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,

    /// OFFLINE records older than this are moved to the audit archive.
    #[serde(default = "default_archive_after", with = "humantime_serde")]
    pub archive_after: Duration,
}

impl LivenessConfig {
    /// The hard eviction threshold `T * K`.
    pub fn offline_threshold(&self) -> Duration {
        self.heartbeat_timeout
            .saturating_mul(self.offline_multiplier)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            offline_multiplier: default_offline_multiplier(),
            sweep_interval: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            archive_after: default_archive_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Retries per task (and resolution rounds / auction reopens).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_task_timeout", with = "humantime_serde")]
    pub task_timeout: Duration,

    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Quorum is strictly more than this fraction of the cohort.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_default_threshold: f64,

    /// Fraction of the cohort that must contribute before a merge completes.
    #[serde(default = "default_completeness_threshold")]
    pub collaborative_completeness_threshold: f64,

    #[serde(default = "default_auction_bid_window", with = "humantime_serde")]
    pub auction_bid_window: Duration,

    #[serde(default = "default_timeout_sweep_interval", with = "humantime_serde")]
    pub timeout_sweep_interval: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            task_timeout: default_task_timeout(),
            session_timeout: default_session_timeout(),
            consensus_default_threshold: default_consensus_threshold(),
            collaborative_completeness_threshold: default_completeness_threshold(),
            auction_bid_window: default_auction_bid_window(),
            timeout_sweep_interval: default_timeout_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity; lagging receivers drop the oldest events.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_offline_multiplier() -> u32 {
    3
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_sweep_batch_size() -> usize {
    64
}

fn default_archive_after() -> Duration {
    Duration::from_secs(600)
}

fn default_max_retries() -> u32 {
    3
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_consensus_threshold() -> f64 {
    0.5
}

fn default_completeness_threshold() -> f64 {
    1.0
}

fn default_auction_bid_window() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_event_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-mesh".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: MeshConfigSpec::default(),
        }
    }
}

impl MeshConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_MESH_CONFIG_PATH environment variable
    /// 2. ./aegis-mesh.yaml (working directory)
    /// 3. ~/.aegis/mesh.yaml (user home)
    /// 4. /etc/aegis/mesh.yaml (system, Unix) or C:\ProgramData\Aegis\mesh.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_MESH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-mesh.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("mesh.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/aegis/mesh.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Aegis\\mesh.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default.
    ///
    /// An explicit path must exist and parse. The result is validated after
    /// environment overrides are applied.
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading mesh configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load mesh config at {:?}: {}", path, e))?
        } else if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading mesh configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No mesh configuration file found in standard locations. Using defaults.");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration.
    /// Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        let liveness = &mut self.spec.liveness;
        override_duration("AEGIS_MESH_HEARTBEAT_TIMEOUT", &mut liveness.heartbeat_timeout);
        override_parsed("AEGIS_MESH_OFFLINE_MULTIPLIER", &mut liveness.offline_multiplier);

        let coordination = &mut self.spec.coordination;
        override_parsed("AEGIS_MESH_MAX_RETRIES", &mut coordination.max_retries);
        override_duration("AEGIS_MESH_TASK_TIMEOUT", &mut coordination.task_timeout);
        override_duration("AEGIS_MESH_SESSION_TIMEOUT", &mut coordination.session_timeout);
        override_parsed(
            "AEGIS_MESH_CONSENSUS_THRESHOLD",
            &mut coordination.consensus_default_threshold,
        );
        override_parsed(
            "AEGIS_MESH_COMPLETENESS_THRESHOLD",
            &mut coordination.collaborative_completeness_threshold,
        );
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let liveness = &self.spec.liveness;
        if liveness.heartbeat_timeout.is_zero() {
            anyhow::bail!("spec.liveness.heartbeat_timeout must be greater than zero");
        }
        if liveness.offline_multiplier < 1 {
            anyhow::bail!("spec.liveness.offline_multiplier must be at least 1");
        }
        if liveness.sweep_interval.is_zero() {
            anyhow::bail!("spec.liveness.sweep_interval must be greater than zero");
        }
        if liveness.sweep_batch_size == 0 {
            anyhow::bail!("spec.liveness.sweep_batch_size must be greater than zero");
        }

        let coordination = &self.spec.coordination;
        if coordination.task_timeout.is_zero() {
            anyhow::bail!("spec.coordination.task_timeout must be greater than zero");
        }
        if coordination.session_timeout.is_zero() {
            anyhow::bail!("spec.coordination.session_timeout must be greater than zero");
        }
        if coordination.auction_bid_window.is_zero() {
            anyhow::bail!("spec.coordination.auction_bid_window must be greater than zero");
        }
        if coordination.timeout_sweep_interval.is_zero() {
            anyhow::bail!("spec.coordination.timeout_sweep_interval must be greater than zero");
        }
        check_fraction(
            "spec.coordination.consensus_default_threshold",
            coordination.consensus_default_threshold,
        )?;
        check_fraction(
            "spec.coordination.collaborative_completeness_threshold",
            coordination.collaborative_completeness_threshold,
        )?;

        if self.spec.events.capacity == 0 {
            anyhow::bail!("spec.events.capacity must be greater than zero");
        }

        Ok(())
    }
}

fn check_fraction(field: &str, value: f64) -> anyhow::Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        anyhow::bail!("{} must be within (0, 1], got {}", field, value);
    }
    Ok(())
}

fn override_duration(var: &str, target: &mut Duration) {
    if let Ok(val) = std::env::var(var) {
        match humantime::parse_duration(&val) {
            Ok(parsed) => {
                tracing::info!("Environment override: {}={}", var, val);
                *target = parsed;
            }
            Err(e) => {
                tracing::warn!("Invalid value for {}: '{}' ({}). Ignoring.", var, val, e);
            }
        }
    }
}

fn override_parsed<T>(var: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(val) = std::env::var(var) {
        match val.trim().parse::<T>() {
            Ok(parsed) => {
                tracing::info!("Environment override: {}={}", var, val);
                *target = parsed;
            }
            Err(e) => {
                tracing::warn!("Invalid value for {}: '{}' ({}). Ignoring.", var, val, e);
            }
        }
    }
}
