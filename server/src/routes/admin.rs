//! Admin routes under `/api`.
//!
//! These are raw record upserts with no status checks or cross-record
//! bookkeeping. Exported seed scripts replay against them, and they are
//! handy for scripting test fixtures.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use crate::routes::ApiError;
use crate::services::{device_model, simulation, target};
use crate::state::AppState;
use crate::types::{DeviceConfig, DeviceModel, Simulation, Target, TargetDevice, TargetModels};

/// `PUT /api/target`
pub async fn upsert_target(State(state): State<AppState>, Json(body): Json<Target>) -> Result<Json<Target>, ApiError> {
    target::upsert_target(&state.pool, &body).await?;
    Ok(Json(body))
}

/// `GET /api/target/:id/models`
pub async fn get_target_models(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TargetModels>, ApiError> {
    target::get_target_models(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("model binding", &id))
}

/// `PUT /api/target/:id/models`: body is the full list of model ids.
pub async fn put_target_models(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(models): Json<Vec<String>>,
) -> Result<Json<TargetModels>, ApiError> {
    let binding = TargetModels { target_id: id, models };
    target::set_target_models(&state.pool, &binding).await?;
    Ok(Json(binding))
}

/// `DELETE /api/target/:id/models`
pub async fn delete_target_models(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    target::delete_target_models(&state.pool, &id).await?;
    Ok(StatusCode::OK)
}

/// `GET /api/target/:id/device`: cached device registrations.
pub async fn list_target_devices(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TargetDevice>>, ApiError> {
    Ok(Json(target::list_target_devices(&state.pool, &id).await?))
}

/// `DELETE /api/target/:id/device`: drop every cached registration.
pub async fn delete_target_devices(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let removed = target::delete_all_target_devices(&state.pool, &id).await?;
    tracing::info!(target_id = %id, removed, "device cache cleared");
    Ok(StatusCode::OK)
}

/// `PUT /api/model`
pub async fn upsert_model(
    State(state): State<AppState>,
    Json(body): Json<DeviceModel>,
) -> Result<Json<DeviceModel>, ApiError> {
    if body.id.is_empty() {
        return Err(ApiError::BadRequest("Model ID is required.".into()));
    }
    device_model::upsert_device_model(&state.pool, &body).await?;
    Ok(Json(body))
}

/// `GET /api/simulation`: stored records without device counts.
pub async fn list_simulations(State(state): State<AppState>) -> Result<Json<Vec<Simulation>>, ApiError> {
    Ok(Json(simulation::list_simulations(&state.pool).await?))
}

/// `PUT /api/simulation`
pub async fn upsert_simulation(
    State(state): State<AppState>,
    Json(body): Json<Simulation>,
) -> Result<Json<Simulation>, ApiError> {
    if body.id.is_empty() {
        return Err(ApiError::BadRequest("Simulation ID is required.".into()));
    }
    simulation::upsert_simulation(&state.pool, &body).await?;
    Ok(Json(body))
}

/// `GET /api/simulation/:id/deviceConfig`
pub async fn list_device_configs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeviceConfig>>, ApiError> {
    Ok(Json(simulation::list_device_configs(&state.pool, &id).await?))
}

/// `PUT /api/simulation/:id/deviceConfig`
pub async fn upsert_device_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DeviceConfig>,
) -> Result<Json<DeviceConfig>, ApiError> {
    if simulation::get_simulation(&state.pool, &id).await?.is_none() {
        return Err(ApiError::not_found("simulation", &id));
    }
    simulation::upsert_device_config(&state.pool, &id, &body).await?;
    Ok(Json(body))
}

/// `GET /api/simulation/:id/deviceConfig/:config_id`
pub async fn get_device_config(
    State(state): State<AppState>,
    Path((id, config_id)): Path<(String, String)>,
) -> Result<Json<DeviceConfig>, ApiError> {
    simulation::get_device_config(&state.pool, &id, &config_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("device config", &config_id))
}

/// `DELETE /api/simulation/:id/deviceConfig/:config_id`
pub async fn delete_device_config(
    State(state): State<AppState>,
    Path((id, config_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    simulation::delete_device_config(&state.pool, &id, &config_id).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
#[path = "admin_test.rs"]
mod tests;
