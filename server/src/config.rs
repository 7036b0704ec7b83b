//! Global configuration loaded from a YAML file.
//!
//! DESIGN
//! ======
//! The file has four sections (`Logger`, `Data`, `HTTP`, `Simulation`) whose
//! keys match the JSON served by `GET /webapi/config`, so the same struct
//! round-trips through both surfaces. Missing keys fall back to defaults and a
//! missing file is created with the defaults on first start.
//!
//! Simulation settings are snapshotted when a simulation starts; changing
//! them at runtime only affects simulations started afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "DEVSIM_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "devsim.yaml";

const DEFAULT_LOG_LEVEL: &str = "debug";
const DEFAULT_LOGS_DIR: &str = "./logs";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_ADMIN_PORT: u16 = 6001;
const DEFAULT_METRICS_PORT: u16 = 6002;
const DEFAULT_PROMETHEUS_PORT: u16 = 9090;
const DEFAULT_GRAFANA_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_REGISTRATION_ATTEMPT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENCY: usize = 10;
const DEFAULT_MAX_REGISTRATION_ATTEMPTS: u32 = 10;
const DEFAULT_REPORTED_PROPS_START_DELAY_SECS: u64 = 300;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Route around Redmond used for `geopoint` telemetry.
const DEFAULT_GEOPOINT_ROUTE: [[f64; 3]; 21] = [
    [47.645_804, -122.132_337, 0.0],
    [47.644_799, -122.132_291, 0.0],
    [47.643_975, -122.132_302, 0.0],
    [47.642_746, -122.132_366, 0.0],
    [47.641_264, -122.132_409, 0.0],
    [47.639_768, -122.132_430, 0.0],
    [47.637_844, -122.132_393, 0.0],
    [47.635_111, -122.132_479, 0.0],
    [47.633_202, -122.132_382, 0.0],
    [47.633_354, -122.131_191, 0.0],
    [47.634_540, -122.129_163, 0.0],
    [47.636_325, -122.126_081, 0.0],
    [47.638_046, -122.123_120, 0.0],
    [47.641_111, -122.119_204, 0.0],
    [47.644_017, -122.115_642, 0.0],
    [47.645_990, -122.114_258, 0.0],
    [47.646_069, -122.117_938, 0.0],
    [47.646_069, -122.120_921, 0.0],
    [47.646_105, -122.125_888, 0.0],
    [47.646_047, -122.129_568, 0.0],
    [47.646_069, -122.132_164, 0.0],
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("config file {path} is not valid YAML: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("config could not be serialized: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggerConfig {
    pub log_level: String,
    pub logs_dir: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { log_level: DEFAULT_LOG_LEVEL.into(), logs_dir: DEFAULT_LOGS_DIR.into() }
    }
}

impl LoggerConfig {
    /// Normalized `tracing` level directive. Unknown levels fall back to `debug`.
    #[must_use]
    pub fn level_directive(&self) -> &'static str {
        let wanted = self.log_level.trim().to_ascii_lowercase();
        LOG_LEVELS.iter().find(|level| **level == wanted).copied().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the database file.
    pub path: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { path: DEFAULT_DATA_DIR.into() }
    }
}

impl DataConfig {
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        if self.path.trim().is_empty() { PathBuf::from(DEFAULT_DATA_DIR) } else { PathBuf::from(&self.path) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpConfig {
    pub admin_port: u16,
    pub metrics_port: u16,
    pub prometheus_port: u16,
    pub grafana_port: u16,
    /// Optional directory with a built web console, served as the fallback route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_dir: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            admin_port: DEFAULT_ADMIN_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            prometheus_port: DEFAULT_PROMETHEUS_PORT,
            grafana_port: DEFAULT_GRAFANA_PORT,
            ui_dir: None,
        }
    }
}

/// Which device transport the simulator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Mqtt,
    /// In-process transport that accepts every message. Useful for load-testing
    /// the simulator itself without a hub.
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub connection_timeout: u64,
    pub telemetry_timeout: u64,
    pub twin_update_timeout: u64,
    pub command_timeout: u64,
    pub registration_attempt_timeout: u64,
    pub max_concurrent_connections: usize,
    pub max_concurrent_twin_updates: usize,
    pub max_concurrent_registrations: usize,
    pub max_concurrent_deletes: usize,
    pub max_registration_attempts: u32,
    pub enable_telemetry: bool,
    pub enable_reported_props: bool,
    pub enable_twin_update_acks: bool,
    pub enable_command_acks: bool,
    /// Seconds to wait after start before the first reported-property wave.
    pub reported_props_start_delay: u64,
    pub transport: TransportKind,
    pub geopoint_data: Vec<[f64; 3]>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_TIMEOUT_MS,
            telemetry_timeout: DEFAULT_TIMEOUT_MS,
            twin_update_timeout: DEFAULT_TIMEOUT_MS,
            command_timeout: DEFAULT_TIMEOUT_MS,
            registration_attempt_timeout: DEFAULT_REGISTRATION_ATTEMPT_TIMEOUT_MS,
            max_concurrent_connections: DEFAULT_MAX_CONCURRENCY,
            max_concurrent_twin_updates: DEFAULT_MAX_CONCURRENCY,
            max_concurrent_registrations: DEFAULT_MAX_CONCURRENCY,
            max_concurrent_deletes: DEFAULT_MAX_CONCURRENCY,
            max_registration_attempts: DEFAULT_MAX_REGISTRATION_ATTEMPTS,
            enable_telemetry: true,
            enable_reported_props: true,
            enable_twin_update_acks: true,
            enable_command_acks: true,
            reported_props_start_delay: DEFAULT_REPORTED_PROPS_START_DELAY_SECS,
            transport: TransportKind::Mqtt,
            geopoint_data: DEFAULT_GEOPOINT_ROUTE.to_vec(),
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    #[must_use]
    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout)
    }

    #[must_use]
    pub fn twin_update_timeout(&self) -> Duration {
        Duration::from_millis(self.twin_update_timeout)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout)
    }

    #[must_use]
    pub fn registration_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_attempt_timeout)
    }

    #[must_use]
    pub fn reported_props_start_delay(&self) -> Duration {
        Duration::from_secs(self.reported_props_start_delay)
    }

    // Zero would deadlock the semaphores, so every limit is at least one.

    #[must_use]
    pub fn connection_limit(&self) -> usize {
        self.max_concurrent_connections.max(1)
    }

    #[must_use]
    pub fn twin_update_limit(&self) -> usize {
        self.max_concurrent_twin_updates.max(1)
    }

    #[must_use]
    pub fn registration_limit(&self) -> usize {
        self.max_concurrent_registrations.max(1)
    }

    #[must_use]
    pub fn delete_limit(&self) -> usize {
        self.max_concurrent_deletes.max(1)
    }
}

// =============================================================================
// GLOBAL CONFIG
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    #[serde(rename = "Logger")]
    pub logger: LoggerConfig,
    #[serde(rename = "Data")]
    pub data: DataConfig,
    #[serde(rename = "HTTP")]
    pub http: HttpConfig,
    #[serde(rename = "Simulation")]
    pub simulation: SimulationConfig,
}

/// Config file location: `DEVSIM_CONFIG` when set, else `devsim.yaml`.
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Load the config file, writing the defaults first when it does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be read, written, or parsed.
pub fn load_or_create(path: &Path) -> Result<GlobalConfig, ConfigError> {
    if !path.exists() {
        let config = GlobalConfig::default();
        save(path, &config)?;
        return Ok(config);
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    parse(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

/// Parse YAML text. An empty document yields the defaults.
///
/// # Errors
///
/// Returns the YAML error for malformed input.
pub fn parse(raw: &str) -> Result<GlobalConfig, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(GlobalConfig::default());
    }
    serde_yaml::from_str(raw)
}

/// Write the config as YAML, creating parent directories as needed.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn save(path: &Path, config: &GlobalConfig) -> Result<(), ConfigError> {
    let body = serde_yaml::to_string(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
    }
    std::fs::write(path, body).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

/// Async variant of [`save`] for request handlers.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn save_async(path: &Path, config: &GlobalConfig) -> Result<(), ConfigError> {
    let body = serde_yaml::to_string(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
    }
    tokio::fs::write(path, body).await.map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
