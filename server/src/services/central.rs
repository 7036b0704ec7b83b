//! IoT Central REST client.
//!
//! Thin HTTP wrapper for the two Central calls the simulator needs: listing
//! device templates (model import) and deleting devices (deprovisioning).
//! Template parsing is a pure function for testability.

use std::time::Duration;

use crate::services::device_model::scrub_model_name;
use crate::types::{DeviceModel, Target};

const API_VERSION: &str = "1.0";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CentralError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} answered {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("unexpected device template response: {0}")]
    Parse(String),
    #[error("could not find displayName in capability model")]
    MissingDisplayName,
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Clone)]
pub struct CentralClient {
    http: reqwest::Client,
}

impl CentralClient {
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, CentralError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CentralError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http })
    }

    /// Download every device template of the target application as a device model.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures, non-success statuses, or an
    /// unparseable template list.
    pub async fn download_models(&self, target: &Target) -> Result<Vec<DeviceModel>, CentralError> {
        let url = format!("{}/api/deviceTemplates?api-version={API_VERSION}", https_base_url(&target.app_url));
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &target.app_token)
            .send()
            .await
            .map_err(|e| CentralError::Request { url: url.clone(), message: e.to_string() })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CentralError::Request { url: url.clone(), message: e.to_string() })?;
        if !status.is_success() {
            return Err(CentralError::Status { url, status: status.as_u16(), body });
        }

        parse_device_templates(&body)
    }

    /// Delete a device from the target application.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures or non-success statuses.
    pub async fn delete_device(&self, target: &Target, device_id: &str) -> Result<(), CentralError> {
        let url = format!(
            "{}/api/devices/{}?api-version={API_VERSION}",
            https_base_url(&target.app_url),
            urlencoding::encode(device_id)
        );
        let response = self
            .http
            .delete(&url)
            .header(reqwest::header::AUTHORIZATION, &target.app_token)
            .send()
            .await
            .map_err(|e| CentralError::Request { url: url.clone(), message: e.to_string() })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CentralError::Status { url, status: status.as_u16(), body })
    }

    /// True when anything answers HTTP at `url`.
    pub async fn probe(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(%url, error = %e, "probe failed");
                false
            }
        }
    }
}

/// `https://<host>` unless the configured value already carries a scheme.
#[must_use]
pub fn https_base_url(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    }
}

// =============================================================================
// PARSING
// =============================================================================

#[derive(serde::Deserialize)]
struct TemplateList {
    #[serde(default)]
    value: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Convert a `deviceTemplates` response into device models. Templates without
/// a capability model are skipped; ids and names are the scrubbed display name.
///
/// # Errors
///
/// Returns `Parse` for malformed JSON and `MissingDisplayName` for templates
/// without a display name.
pub fn parse_device_templates(body: &str) -> Result<Vec<DeviceModel>, CentralError> {
    let list: TemplateList = serde_json::from_str(body).map_err(|e| CentralError::Parse(e.to_string()))?;

    let mut models = Vec::with_capacity(list.value.len());
    for template in list.value {
        let Some(capability_model) = template.get("capabilityModel").filter(|v| v.is_object()) else {
            continue;
        };
        let name = template
            .get("displayName")
            .and_then(serde_json::Value::as_str)
            .ok_or(CentralError::MissingDisplayName)?;
        let id = scrub_model_name(name);
        models.push(DeviceModel { id: id.clone(), name: id, capability_model: vec![capability_model.clone()] });
    }
    Ok(models)
}

#[cfg(test)]
#[path = "central_test.rs"]
mod tests;
