//! Device provisioning through the Device Provisioning Service (DPS).
//!
//! DESIGN
//! ======
//! Group-enrollment symmetric keys: the device key is derived from the
//! target's master key, a registration SAS token authorizes the register
//! call, and the operation is polled until DPS assigns a hub. The result is a
//! device connection string that the caller caches in the target device store.
//!
//! ERROR HANDLING
//! ==============
//! Every failure maps to `ProvisionError` and bumps the provisioning failure
//! counter; nothing is retried here beyond the operation-status polling. The
//! caller decides whether to try again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use crate::metrics::{DeviceLabels, SimMetrics};
use crate::services::central::https_base_url;
use crate::sim::sas::{self, SasError};
use crate::types::{DeviceModel, Target};

const API_VERSION: &str = "2019-03-31";
const REGISTRATION_KEY_NAME: &str = "registration";
const REGISTRATION_TOKEN_TTL: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_AFTER_SECS: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to compute device key: {0}")]
    Key(#[from] SasError),
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("DPS request failed: {0}")]
    Request(String),
    #[error("DPS answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected DPS response: {0}")]
    Parse(String),
    #[error("device was not assigned to a hub (status '{0}')")]
    NotAssigned(String),
    #[error("registration still pending after {0} attempts")]
    AttemptsExhausted(u32),
}

/// One device to register.
pub struct ProvisionRequest<'a> {
    pub device_id: &'a str,
    pub target: &'a Target,
    pub model: &'a DeviceModel,
    pub labels: &'a DeviceLabels,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    #[serde(default)]
    operation_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResult {
    #[serde(default)]
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

// =============================================================================
// PROVISIONER
// =============================================================================

#[derive(Clone)]
pub struct Provisioner {
    http: reqwest::Client,
    max_attempts: u32,
    metrics: Arc<SimMetrics>,
}

impl Provisioner {
    /// `attempt_timeout` bounds every DPS HTTP call; `max_attempts` bounds
    /// the operation-status polling.
    ///
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot be initialized.
    pub fn new(attempt_timeout: Duration, max_attempts: u32, metrics: Arc<SimMetrics>) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(|e| ProvisionError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, max_attempts: max_attempts.max(1), metrics })
    }

    /// Register a device and return its connection string.
    ///
    /// # Errors
    ///
    /// Returns an error when key derivation, the register call or the
    /// status polling fails.
    pub async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<String, ProvisionError> {
        let started = Instant::now();
        match self.register(request).await {
            Ok(conn_str) => {
                self.metrics.provision_succeeded(request.labels, started.elapsed().as_secs_f64());
                tracing::trace!(device_id = request.device_id, "device provisioned");
                Ok(conn_str)
            }
            Err(e) => {
                self.metrics.provision_failed(request.labels);
                tracing::error!(device_id = request.device_id, error = %e, "failed to provision device");
                Err(e)
            }
        }
    }

    async fn register(&self, request: &ProvisionRequest<'_>) -> Result<String, ProvisionError> {
        let target = request.target;
        let device_id = request.device_id;

        let device_key = sas::derive_device_key(&target.master_key, device_id)?;
        let resource = format!("{}/registrations/{device_id}", target.id_scope);
        let token = sas::create_sas_token(&device_key, &resource, Some(REGISTRATION_KEY_NAME), REGISTRATION_TOKEN_TTL)?;

        let base = format!("{}/{resource}", https_base_url(&target.provisioning_url));
        let operation_id = self.send_register(&base, device_id, request.model.dtdl_id(), &token).await?;
        let hub = self.poll_assignment(&base, device_id, &operation_id, &token).await?;

        Ok(format!("HostName={hub};DeviceId={device_id};SharedAccessKey={device_key}"))
    }

    async fn send_register(
        &self,
        base: &str,
        device_id: &str,
        model_id: &str,
        token: &str,
    ) -> Result<String, ProvisionError> {
        let url = format!("{base}/register?api-version={API_VERSION}");
        let body = json!({ "registrationId": device_id, "payload": { "modelId": model_id } });

        let response = self
            .http
            .put(&url)
            .header("Encoding", "utf-8")
            .header(reqwest::header::AUTHORIZATION, token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProvisionError::Request(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ProvisionError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(ProvisionError::Status { status: status.as_u16(), body: text });
        }

        let parsed: RegistrationResponse =
            serde_json::from_str(&text).map_err(|e| ProvisionError::Parse(e.to_string()))?;
        if parsed.operation_id.is_empty() {
            return Err(ProvisionError::Parse("missing operationId".into()));
        }
        Ok(parsed.operation_id)
    }

    async fn poll_assignment(
        &self,
        base: &str,
        device_id: &str,
        operation_id: &str,
        token: &str,
    ) -> Result<String, ProvisionError> {
        let url = format!("{base}/operations/{operation_id}?api-version={API_VERSION}");

        for attempt in 1..=self.max_attempts {
            let response = self
                .http
                .get(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("Encoding", "utf-8")
                .header(reqwest::header::AUTHORIZATION, token)
                .send()
                .await
                .map_err(|e| ProvisionError::Request(e.to_string()))?;

            if response.status() == reqwest::StatusCode::ACCEPTED {
                let backoff = retry_after(response.headers());
                tracing::trace!(device_id, attempt, backoff_secs = backoff.as_secs(), "registration pending");
                tokio::time::sleep(backoff).await;
                continue;
            }

            let status = response.status();
            let text = response.text().await.map_err(|e| ProvisionError::Request(e.to_string()))?;
            if !status.is_success() {
                return Err(ProvisionError::Status { status: status.as_u16(), body: text });
            }
            return assigned_hub(&text);
        }

        Err(ProvisionError::AttemptsExhausted(self.max_attempts))
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    let secs = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(secs)
}

fn assigned_hub(body: &str) -> Result<String, ProvisionError> {
    let result: RegistrationResult = serde_json::from_str(body).map_err(|e| ProvisionError::Parse(e.to_string()))?;
    let state = result.registration_state.unwrap_or_default();
    if state.assigned_hub.is_empty() {
        let status = if state.status.is_empty() { result.status } else { state.status };
        return Err(ProvisionError::NotAssigned(status));
    }
    Ok(state.assigned_hub)
}

#[cfg(test)]
#[path = "provision_test.rs"]
mod tests;
