//! Hub transport: the device-side connection to an IoT hub.
//!
//! DESIGN
//! ======
//! The simulator talks to hubs only through `HubTransport` and
//! `HubConnection`, so the MQTT implementation can be swapped for the
//! in-process loopback used by tests and hub-less load runs. A connect yields
//! a `HubSession`: the shared connection handle plus the stream of
//! cloud-initiated events (desired-property patches, direct-method calls,
//! cloud-to-device messages) for the device's listener task.
//!
//! ERROR HANDLING
//! ==============
//! `HubError::kind` is the closed set of error classes used as the `error`
//! metrics label. Refusals that mean "this hub no longer knows the device"
//! (`is_failover`) make the device re-provision and reconnect to whatever hub
//! DPS assigns now.

pub mod loopback;
pub mod mqtt;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::config::TransportKind;
use crate::sim::datagen::TelemetryMessage;
use crate::sim::sas::SasError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("invalid device key: {0}")]
    Key(String),
    #[error("not authorized")]
    NotAuthorized,
    #[error("server unavailable")]
    ServerUnavailable,
    #[error("network error: {0}")]
    Network(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Error class used as the `error` label on failure counters.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Throttled(_) => "throttled",
            Self::ConnectionClosed => "connection closed",
            Self::NotAuthorized => "not authorized",
            Self::Timeout => "timeout",
            Self::Network(_) => "network error",
            Self::InvalidConnectionString(_) | Self::Key(_) | Self::ServerUnavailable | Self::Other(_) => "error",
        }
    }

    /// True when the device should re-provision and try another hub.
    #[must_use]
    pub fn is_failover(&self) -> bool {
        matches!(self, Self::NotAuthorized | Self::ServerUnavailable | Self::Network(_))
    }

    /// Classify a free-form transport error message.
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("429") || lower.contains("throttl") {
            Self::Throttled(message.to_owned())
        } else if lower.contains("not authorized") || lower.contains("unauthorized") {
            Self::NotAuthorized
        } else if lower.contains("closed") || lower.contains("reset by peer") || lower.contains("broken pipe") {
            Self::ConnectionClosed
        } else if lower.contains("deadline") || lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("tls") || lower.contains("dns") || lower.contains("connection refused") {
            Self::Network(message.to_owned())
        } else {
            Self::Other(message.to_owned())
        }
    }
}

impl From<SasError> for HubError {
    fn from(err: SasError) -> Self {
        Self::Key(err.to_string())
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Parsed `HostName=..;DeviceId=..;SharedAccessKey=..` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: String,
}

impl DeviceCredentials {
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!("HostName={};DeviceId={};SharedAccessKey={}", self.host_name, self.device_id, self.shared_access_key)
    }
}

impl FromStr for DeviceCredentials {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Keys are base64 and may themselves end in '='.
            let Some((key, value)) = part.split_once('=') else {
                return Err(HubError::InvalidConnectionString(format!("malformed segment '{part}'")));
            };
            match key {
                "HostName" => host_name = Some(value.to_owned()),
                "DeviceId" => device_id = Some(value.to_owned()),
                "SharedAccessKey" => shared_access_key = Some(value.to_owned()),
                _ => {}
            }
        }

        match (host_name, device_id, shared_access_key) {
            (Some(host_name), Some(device_id), Some(shared_access_key)) => {
                Ok(Self { host_name, device_id, shared_access_key })
            }
            _ => Err(HubError::InvalidConnectionString("HostName, DeviceId and SharedAccessKey are required".into())),
        }
    }
}

/// Short hub name for metrics: the host label before `.azure-devices.net`.
#[must_use]
pub fn hub_name(host_name: &str) -> String {
    match host_name.split_once(".azure-devices.net") {
        Some((name, _)) if !name.is_empty() => name.to_owned(),
        _ => "unknown".to_owned(),
    }
}

// =============================================================================
// TRAITS
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub timeout: Duration,
    /// DTDL model id announced on connect.
    pub model_id: String,
    pub subscribe_desired: bool,
    pub subscribe_methods: bool,
    pub subscribe_cloud_messages: bool,
}

/// Cloud-initiated traffic delivered to a connected device.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    DesiredProperties(Map<String, Value>),
    MethodCall { request_id: String, name: String, payload: Value },
    CloudMessage { payload: Vec<u8> },
}

pub struct HubSession {
    pub connection: Arc<dyn HubConnection>,
    pub events: mpsc::Receiver<HubEvent>,
}

#[async_trait]
pub trait HubTransport: Send + Sync {
    async fn connect(&self, credentials: &DeviceCredentials, options: &ConnectOptions) -> Result<HubSession, HubError>;
}

#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Short name of the hub this connection landed on.
    fn hub_name(&self) -> &str;

    async fn send_event(&self, message: &TelemetryMessage, timeout: Duration) -> Result<(), HubError>;

    async fn update_reported(&self, patch: &Map<String, Value>, timeout: Duration) -> Result<(), HubError>;

    async fn respond_method(&self, request_id: &str, status: u16, body: &Value) -> Result<(), HubError>;

    async fn close(&self);
}

/// Transport implementation selected by configuration.
#[must_use]
pub fn transport_for(kind: TransportKind) -> Arc<dyn HubTransport> {
    match kind {
        TransportKind::Mqtt => Arc::new(mqtt::MqttTransport),
        TransportKind::Loopback => Arc::new(loopback::LoopbackTransport::default()),
    }
}

/// Run `fut` with a deadline, mapping expiry to `HubError::Timeout`.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, HubError>>,
) -> Result<T, HubError> {
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut).await.unwrap_or(Err(HubError::Timeout))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
