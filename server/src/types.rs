//! Domain records shared by the store, the simulator and the REST surface.
//!
//! DESIGN
//! ======
//! Field names serialize in camelCase to match the JSON the console and the
//! exported shell scripts exchange. Enum-valued fields are closed sets parsed
//! through `FromStr`; the JSON forms are plain strings, and an empty string
//! means the default variant so partially filled forms still deserialize.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

// =============================================================================
// TARGETS
// =============================================================================

/// IoT Central application that simulated devices are provisioned into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    /// DPS host, e.g. `global.azure-devices-provisioning.net`.
    pub provisioning_url: String,
    pub id_scope: String,
    /// Group enrollment SAS key (base64).
    pub master_key: String,
    /// Central application host, e.g. `myapp.azureiotcentral.com`.
    pub app_url: String,
    /// Central API token sent verbatim as the `Authorization` header.
    pub app_token: String,
}

/// Body of `POST /webapi/target`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NewTarget {
    #[serde(flatten)]
    pub target: Target,
    pub import_models: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetModels {
    pub target_id: String,
    pub models: Vec<String>,
}

/// Cached provisioning result for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetDevice {
    pub target_id: String,
    pub device_id: String,
    pub connection_string: String,
}

// =============================================================================
// DEVICE MODELS
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceModel {
    pub id: String,
    pub name: String,
    /// DTDL interfaces, first entry is the root interface.
    pub capability_model: Vec<serde_json::Value>,
}

impl DeviceModel {
    /// DTDL model id announced during provisioning: the root interface `@id`,
    /// or the model id when the capability model has none.
    #[must_use]
    pub fn dtdl_id(&self) -> &str {
        self.capability_model
            .first()
            .and_then(|root| root.get("@id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&self.id)
    }
}

// =============================================================================
// SIMULATIONS
// =============================================================================

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Lifecycle state of a simulation. Only `Ready` simulations may be edited,
/// deleted, provisioned or started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SimulationStatus {
    #[default]
    Ready,
    Provisioning,
    Running,
    Deleting,
}

impl SimulationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Deleting => "deleting",
        }
    }

    /// Every stored value that reads back as this status.
    #[must_use]
    pub fn stored_forms(self) -> &'static [&'static str] {
        match self {
            Self::Ready => &["ready", "", "created", "stopped"],
            Self::Provisioning => &["provisioning"],
            Self::Running => &["running"],
            Self::Deleting => &["deleting"],
        }
    }
}

impl FromStr for SimulationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // `created` and `stopped` are written by older releases.
            "" | "ready" | "created" | "stopped" => Ok(Self::Ready),
            "provisioning" => Ok(Self::Provisioning),
            "running" => Ok(Self::Running),
            "deleting" => Ok(Self::Deleting),
            other => Err(ParseEnumError { kind: "simulation status", value: other.to_owned() }),
        }
    }
}

/// When a simulated device drops its hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DisconnectBehavior {
    #[default]
    Never,
    /// Disconnect after every telemetry batch (occasionally connected device).
    Telemetry,
}

impl DisconnectBehavior {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Telemetry => "telemetry",
        }
    }
}

impl FromStr for DisconnectBehavior {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "never" => Ok(Self::Never),
            "telemetry" => Ok(Self::Telemetry),
            other => Err(ParseEnumError { kind: "disconnect behavior", value: other.to_owned() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TelemetryFormat {
    #[default]
    Default,
    /// OPC-UA publisher envelope.
    Opcua,
}

impl TelemetryFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Opcua => "opcua",
        }
    }
}

impl FromStr for TelemetryFormat {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(Self::Default),
            "opcua" => Ok(Self::Opcua),
            other => Err(ParseEnumError { kind: "telemetry format", value: other.to_owned() }),
        }
    }
}

macro_rules! string_enum_conversions {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = ParseEnumError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.as_str().to_owned()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

string_enum_conversions!(SimulationStatus, DisconnectBehavior, TelemetryFormat);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Simulation {
    pub id: String,
    pub name: String,
    pub target_id: String,
    pub status: SimulationStatus,
    /// Number of groups devices are split into within one wave.
    pub wave_group_count: u32,
    /// Seconds between consecutive wave groups.
    pub wave_group_interval: u32,
    pub telemetry_batch_size: u32,
    /// Seconds between telemetry waves.
    pub telemetry_interval: u32,
    /// Seconds between reported-property waves.
    pub reported_property_interval: u32,
    pub disconnect_behavior: DisconnectBehavior,
    pub telemetry_format: TelemetryFormat,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_time: OffsetDateTime,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            target_id: String::new(),
            status: SimulationStatus::Ready,
            wave_group_count: 0,
            wave_group_interval: 0,
            telemetry_batch_size: 0,
            telemetry_interval: 0,
            reported_property_interval: 0,
            disconnect_behavior: DisconnectBehavior::Never,
            telemetry_format: TelemetryFormat::Default,
            last_updated_time: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

impl Simulation {
    /// Prefix shared by every device id this simulation owns for one model.
    #[must_use]
    pub fn device_prefix(&self, model_id: &str) -> String {
        format!("{}-{}-{model_id}-", self.id, self.target_id)
    }

    /// Device id `<sim>-<target>-<model>-<n>`.
    #[must_use]
    pub fn device_id(&self, model_id: &str, index: u32) -> String {
        format!("{}{index}", self.device_prefix(model_id))
    }
}

/// Number of devices of one model a simulation runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    pub model_id: String,
    pub device_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationViewDeviceConfig {
    pub id: String,
    pub model_id: String,
    pub provisioned_count: u32,
    pub simulated_count: u32,
    pub connected_count: u32,
}

/// Simulation plus per-model device counts, as shown by the console.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationView {
    #[serde(flatten)]
    pub simulation: Simulation,
    pub devices: Vec<SimulationViewDeviceConfig>,
}

impl SimulationView {
    /// Device configs to persist for this view: `simulatedCount` per model.
    #[must_use]
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .map(|d| DeviceConfig {
                id: if d.id.is_empty() { d.model_id.clone() } else { d.id.clone() },
                model_id: d.model_id.clone(),
                device_count: d.simulated_count,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsStatus {
    pub grafana_server: bool,
    pub prometheus_server: bool,
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
