//! Configuration routes.

use axum::extract::State;
use axum::response::Json;

use crate::config::{self as settings, GlobalConfig};
use crate::routes::ApiError;
use crate::state::AppState;
use crate::types::MetricsStatus;

/// `GET /webapi/config`: the live configuration.
pub async fn get_config(State(state): State<AppState>) -> Json<GlobalConfig> {
    Json(state.config.read().await.clone())
}

/// `PUT /webapi/config`: replace the configuration and rewrite the file.
///
/// Simulation settings reach simulations started afterwards; logger and
/// HTTP settings take effect on restart.
pub async fn update_config(
    State(state): State<AppState>,
    Json(body): Json<GlobalConfig>,
) -> Result<Json<GlobalConfig>, ApiError> {
    // The lock orders concurrent updates so the file and the live copy agree.
    let mut live = state.config.write().await;
    settings::save_async(&state.config_path, &body).await?;
    *live = body.clone();
    tracing::info!(path = %state.config_path.display(), "configuration updated");
    Ok(Json(body))
}

/// `GET /webapi/config/metricsStatus`: whether Grafana and Prometheus answer.
pub async fn metrics_status(State(state): State<AppState>) -> Json<MetricsStatus> {
    Json(state.controller.metrics_status().await)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
