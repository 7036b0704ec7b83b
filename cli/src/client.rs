//! HTTP client for the simulator's `/webapi` surface.
//!
//! ERROR HANDLING
//! ==============
//! Every failed call is reduced to one display string: the server's message
//! body when it sent one, else the transport error text, else a per-call
//! default. Connection failures are rewritten to point at the backend not
//! running. Nothing is retried.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

const NETWORK_ERROR: &str = "Network Error. Make sure that the devsim server is running.";

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// A failed REST call, already reduced to its display string.
    #[error("{0}")]
    Api(String),
    /// A client-side status guard refused the command.
    #[error("{0}")]
    Rejected(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("cannot access {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid device count '{0}', expected MODEL=N")]
    InvalidCount(String),
}

/// Reduce a failed call to the message shown to the user.
#[must_use]
pub fn describe_failure(body: Option<&str>, transport: Option<&str>, network: bool, default: &str) -> String {
    if let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) {
        return body.to_owned();
    }
    if network {
        return NETWORK_ERROR.to_owned();
    }
    match transport.map(str::trim).filter(|t| !t.is_empty()) {
        Some(message) => message.to_owned(),
        None => default.to_owned(),
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot be initialized.
    pub fn new(base_url: &str) -> Result<Self, CliError> {
        let http = reqwest::Client::builder().build().map_err(|e| CliError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned() })
    }

    /// Send one request and return the response body text.
    ///
    /// # Errors
    ///
    /// Returns `Api` with the reduced display string for transport failures
    /// and non-success statuses.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>, default: &str) -> Result<String, CliError> {
        let url = format!("{}/webapi{path}", self.base_url);
        let request = self.http.request(method, &url);
        let request = match body {
            Some(json) => request.json(json),
            None => request,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                return Err(CliError::Api(describe_failure(None, Some(&message), e.is_connect(), default)));
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(text);
        }
        let fallback = format!("{default} (HTTP {})", status.as_u16());
        Err(CliError::Api(describe_failure(Some(&text), None, false, &fallback)))
    }

    /// `GET` a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Api` for failed calls and `InvalidJson` for unparseable bodies.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, default: &str) -> Result<T, CliError> {
        let text = self.send(Method::GET, path, None, default).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
