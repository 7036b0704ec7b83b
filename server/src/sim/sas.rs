//! Shared access signatures for DPS and IoT Hub.
//!
//! Keys are base64 strings; signatures are HMAC-SHA256 over
//! `<url-encoded resource>\n<expiry>`.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SasError {
    #[error("key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("key cannot be used for HMAC")]
    KeyLength,
}

/// Base64 HMAC-SHA256 of `data` keyed by the base64-decoded `secret`.
///
/// # Errors
///
/// Returns `InvalidKey` when `secret` is not base64.
pub fn compute_hmac(secret: &str, data: &str) -> Result<String, SasError> {
    let key = STANDARD.decode(secret.trim())?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| SasError::KeyLength)?;
    mac.update(data.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Per-device symmetric key derived from a group enrollment key.
///
/// # Errors
///
/// Returns `InvalidKey` when the master key is not base64.
pub fn derive_device_key(master_key: &str, device_id: &str) -> Result<String, SasError> {
    compute_hmac(master_key, device_id)
}

/// SAS token for `resource` valid for `ttl` from now.
///
/// # Errors
///
/// Returns `InvalidKey` when `key` is not base64.
pub fn create_sas_token(key: &str, resource: &str, key_name: Option<&str>, ttl: Duration) -> Result<String, SasError> {
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let expiry = OffsetDateTime::now_utc().unix_timestamp().saturating_add(ttl_secs);
    create_sas_token_at(key, resource, key_name, expiry)
}

/// SAS token for `resource` expiring at the given unix timestamp.
///
/// # Errors
///
/// Returns `InvalidKey` when `key` is not base64.
pub fn create_sas_token_at(key: &str, resource: &str, key_name: Option<&str>, expiry: i64) -> Result<String, SasError> {
    let sr = urlencoding::encode(resource);
    let se = expiry.to_string();
    let signature = compute_hmac(key, &format!("{sr}\n{se}"))?;
    let sig = urlencoding::encode(&signature);

    let mut token = format!("SharedAccessSignature sr={sr}&sig={sig}&se={se}");
    if let Some(name) = key_name.filter(|n| !n.is_empty()) {
        token.push_str("&skn=");
        token.push_str(&urlencoding::encode(name));
    }
    Ok(token)
}

#[cfg(test)]
#[path = "sas_test.rs"]
mod tests;
