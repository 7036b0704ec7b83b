//! Device model routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use crate::routes::ApiError;
use crate::services::{device_model, simulation, target};
use crate::state::AppState;
use crate::types::DeviceModel;

/// `GET /webapi/model`: list every device model.
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<DeviceModel>>, ApiError> {
    Ok(Json(device_model::list_device_models(&state.pool).await?))
}

/// `GET /webapi/model/:id`: fetch one device model.
pub async fn get_model(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DeviceModel>, ApiError> {
    device_model::get_device_model(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("device model", &id))
}

/// `POST /webapi/model`: add a device model and bind it to every
/// application. An empty id is derived from the name.
pub async fn add_model(
    State(state): State<AppState>,
    Json(mut model): Json<DeviceModel>,
) -> Result<Json<DeviceModel>, ApiError> {
    if model.id.is_empty() {
        model.id = device_model::generate_model_id(&state.pool, &model.name).await?;
    } else if device_model::get_device_model(&state.pool, &model.id).await?.is_some() {
        return Err(ApiError::BadRequest(format!(
            "Another device model exists with Model ID '{}'. Try again with another ID.",
            model.id
        )));
    }

    device_model::upsert_device_model(&state.pool, &model).await?;
    target::bind_model_to_all_targets(&state.pool, &model.id).await?;
    tracing::info!(model_id = %model.id, "device model added");
    Ok(Json(model))
}

/// `PUT /webapi/model`: add or replace a device model.
pub async fn update_model(
    State(state): State<AppState>,
    Json(model): Json<DeviceModel>,
) -> Result<Json<DeviceModel>, ApiError> {
    if model.id.is_empty() {
        return Err(ApiError::BadRequest("Model ID is required.".into()));
    }
    device_model::upsert_device_model(&state.pool, &model).await?;
    Ok(Json(model))
}

/// `DELETE /webapi/model/:id`: delete a model no simulation references.
pub async fn delete_model(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    if let Some(sim) = simulation::find_simulation_using_model(&state.pool, &id).await? {
        return Err(ApiError::BadRequest(format!(
            "device model '{id}' cannot be deleted as there are simulations using this model. Delete the simulation '{}' and try again.",
            sim.name
        )));
    }

    device_model::delete_device_model(&state.pool, &id).await?;
    target::unbind_model_from_all_targets(&state.pool, &id).await?;
    tracing::info!(model_id = %id, "device model deleted");
    Ok(StatusCode::OK)
}

#[cfg(test)]
#[path = "device_models_test.rs"]
mod tests;
