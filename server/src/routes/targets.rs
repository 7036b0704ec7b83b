//! Application (target) routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;

use crate::routes::ApiError;
use crate::services::{device_model, simulation, target};
use crate::state::AppState;
use crate::types::{NewTarget, Target};

/// `GET /webapi/target`: list every application.
pub async fn list_targets(State(state): State<AppState>) -> Result<Json<Vec<Target>>, ApiError> {
    Ok(Json(target::list_targets(&state.pool).await?))
}

/// `GET /webapi/target/:id`: fetch one application.
pub async fn get_target(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Target>, ApiError> {
    target::get_target(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("application", &id))
}

/// `POST /webapi/target`: add an application, optionally importing its
/// device templates, and bind every known model to it.
pub async fn add_target(State(state): State<AppState>, Json(body): Json<NewTarget>) -> Result<Json<Target>, ApiError> {
    let new = body.target;
    if new.id.trim().is_empty() {
        return Err(ApiError::BadRequest("Application ID is required.".into()));
    }
    if target::get_target(&state.pool, &new.id).await?.is_some() {
        return Err(ApiError::BadRequest(format!(
            "Another application exists with Application ID '{}'. Try again with another ID.",
            new.id
        )));
    }

    target::upsert_target(&state.pool, &new).await?;
    if body.import_models {
        store_models_from(&state, &new).await?;
    }

    let model_ids: Vec<String> =
        device_model::list_device_models(&state.pool).await?.into_iter().map(|m| m.id).collect();
    target::bind_models(&state.pool, &new.id, &model_ids).await?;

    tracing::info!(target_id = %new.id, models = model_ids.len(), "application added");
    Ok(Json(new))
}

/// `PUT /webapi/target`: update an application in place.
pub async fn update_target(State(state): State<AppState>, Json(body): Json<Target>) -> Result<Json<Target>, ApiError> {
    if target::get_target(&state.pool, &body.id).await?.is_none() {
        return Err(ApiError::not_found("application", &body.id));
    }
    target::upsert_target(&state.pool, &body).await?;
    Ok(Json(body))
}

/// `DELETE /webapi/target/:id`: delete an application no simulation uses.
pub async fn delete_target(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    if let Some(sim) = simulation::find_simulation_using_target(&state.pool, &id).await? {
        return Err(ApiError::BadRequest(format!(
            "application '{id}' cannot be deleted as there are simulations using this model. Delete the simulation '{}' and try again.",
            sim.name
        )));
    }
    target::delete_target(&state.pool, &id).await?;
    tracing::info!(target_id = %id, "application deleted");
    Ok(StatusCode::OK)
}

/// `POST /webapi/target/:id/import`: import device templates from the
/// application and bind them to it.
pub async fn import_models(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let existing = target::get_target(&state.pool, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("application", &id))?;
    store_models_from(&state, &existing).await?;
    Ok(StatusCode::OK)
}

/// Download the application's templates, store them and bind them to it.
async fn store_models_from(state: &AppState, app: &Target) -> Result<(), ApiError> {
    let models = state.central.download_models(app).await?;
    let mut ids = Vec::with_capacity(models.len());
    for model in &models {
        device_model::upsert_device_model(&state.pool, model).await?;
        ids.push(model.id.clone());
    }
    target::bind_models(&state.pool, &app.id, &ids).await?;
    tracing::info!(target_id = %app.id, imported = ids.len(), "device models imported");
    Ok(())
}

#[cfg(test)]
#[path = "targets_test.rs"]
mod tests;
