//! Simulation routes.
//!
//! DESIGN
//! ======
//! Reads return `SimulationView`s: the stored simulation plus a per-model
//! row of provisioned, simulated and connected counts. Every known model
//! gets a row, so models added after the simulation was created show up
//! with zero counts and can be provisioned from the console.
//!
//! Only `ready` simulations may be edited, deleted, provisioned or started;
//! only running ones may be stopped. Leaving `ready` is a single conditional
//! update, so of two concurrent requests exactly one wins and the other gets
//! `400`. Delete and provision run in the background: the handler moves the
//! record into its transient status before answering `202`, so the next poll
//! already shows it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Json, Response};
use time::OffsetDateTime;

use crate::routes::ApiError;
use crate::services::{device_model, export, simulation, target};
use crate::sim::controller::ControllerError;
use crate::state::AppState;
use crate::types::{DeviceModel, Simulation, SimulationStatus, SimulationView, SimulationViewDeviceConfig};

async fn load(state: &AppState, id: &str) -> Result<Simulation, ApiError> {
    simulation::get_simulation(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::not_found("simulation", id))
}

async fn view_of(state: &AppState, sim: Simulation, models: &[DeviceModel]) -> Result<SimulationView, ApiError> {
    let connected = state.controller.connected_counts(&sim.id).await;
    Ok(simulation::build_view(&state.pool, sim, models, &connected).await?)
}

fn not_ready(action: &str, status: SimulationStatus) -> ApiError {
    ApiError::BadRequest(format!("Simulation cannot be {action} while it is in '{status}' status."))
}

fn not_provisionable(status: SimulationStatus) -> ApiError {
    ApiError::BadRequest(format!("Devices cannot be provisioned while the simulation is in '{status}' status."))
}

/// Atomically move a `ready` simulation to `to`. When another request got
/// there first, `refuse` builds the error from the status it left behind.
async fn claim(
    state: &AppState,
    id: &str,
    to: SimulationStatus,
    refuse: impl FnOnce(SimulationStatus) -> ApiError,
) -> Result<(), ApiError> {
    if simulation::transition_status(&state.pool, id, SimulationStatus::Ready, to).await? {
        return Ok(());
    }
    Err(refuse(load(state, id).await?.status))
}

// =============================================================================
// CRUD
// =============================================================================

/// `GET /webapi/simulation`: every simulation as a view.
pub async fn list_simulations(State(state): State<AppState>) -> Result<Json<Vec<SimulationView>>, ApiError> {
    let models = device_model::list_device_models(&state.pool).await?;
    let sims = simulation::list_simulations(&state.pool).await?;

    let mut views = Vec::with_capacity(sims.len());
    for sim in sims {
        views.push(view_of(&state, sim, &models).await?);
    }
    Ok(Json(views))
}

/// `GET /webapi/simulation/:id`: one simulation as a view.
pub async fn get_simulation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SimulationView>, ApiError> {
    let sim = load(&state, &id).await?;
    let models = device_model::list_device_models(&state.pool).await?;
    Ok(Json(view_of(&state, sim, &models).await?))
}

/// `POST /webapi/simulation`: create a `ready` simulation and its device
/// configs from `devices[].simulatedCount`.
pub async fn add_simulation(
    State(state): State<AppState>,
    Json(body): Json<SimulationView>,
) -> Result<Json<SimulationView>, ApiError> {
    let mut sim = body.simulation.clone();
    if sim.id.trim().is_empty() {
        return Err(ApiError::BadRequest("Simulation ID is required.".into()));
    }
    if simulation::get_simulation(&state.pool, &sim.id).await?.is_some() {
        return Err(ApiError::BadRequest(format!(
            "Another simulation exists with Simulation ID '{}'. Try again with another ID.",
            sim.id
        )));
    }

    sim.status = SimulationStatus::Ready;
    sim.last_updated_time = OffsetDateTime::now_utc();
    simulation::upsert_simulation(&state.pool, &sim).await?;
    simulation::replace_device_configs(&state.pool, &sim.id, &body.device_configs()).await?;
    tracing::info!(sim_id = %sim.id, target_id = %sim.target_id, "simulation added");

    let models = device_model::list_device_models(&state.pool).await?;
    Ok(Json(view_of(&state, sim, &models).await?))
}

/// `PUT /webapi/simulation`: update a `ready` simulation and replace its
/// device configs.
pub async fn update_simulation(
    State(state): State<AppState>,
    Json(body): Json<SimulationView>,
) -> Result<Json<SimulationView>, ApiError> {
    let mut sim = body.simulation.clone();
    if sim.id.trim().is_empty() {
        return Err(ApiError::BadRequest("Simulation ID is required.".into()));
    }

    sim.status = SimulationStatus::Ready;
    sim.last_updated_time = OffsetDateTime::now_utc();
    let configs = body.device_configs();
    match simulation::get_simulation(&state.pool, &sim.id).await? {
        Some(_) => {
            if !simulation::update_ready_simulation(&state.pool, &sim, &configs).await? {
                return Err(not_ready("updated", load(&state, &sim.id).await?.status));
            }
        }
        None => {
            simulation::upsert_simulation(&state.pool, &sim).await?;
            simulation::replace_device_configs(&state.pool, &sim.id, &configs).await?;
        }
    }
    tracing::info!(sim_id = %sim.id, "simulation updated");

    let models = device_model::list_device_models(&state.pool).await?;
    Ok(Json(view_of(&state, sim, &models).await?))
}

/// `DELETE /webapi/simulation/:id`: deprovision and delete in the background.
pub async fn delete_simulation(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let sim = load(&state, &id).await?;
    let app = target::get_target(&state.pool, &sim.target_id).await?;
    claim(&state, &id, SimulationStatus::Deleting, |status| not_ready("deleted", status)).await?;

    let controller = state.controller.clone();
    tokio::spawn(async move {
        if let Err(e) = controller.delete_simulation(&sim, app.as_ref()).await {
            tracing::error!(sim_id = %sim.id, error = %e, "background delete failed");
        }
    });

    Ok((StatusCode::ACCEPTED, "simulation is getting deleted in background").into_response())
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// `POST /webapi/simulation/:id/start`
pub async fn start_simulation(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let sim = load(&state, &id).await?;
    claim(&state, &id, SimulationStatus::Running, |status| not_ready("started", status)).await?;
    match state.controller.start_simulation(sim).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e @ ControllerError::AlreadyRunning(_)) => Err(e.into()),
        Err(e) => {
            simulation::transition_status(&state.pool, &id, SimulationStatus::Running, SimulationStatus::Ready).await?;
            Err(e.into())
        }
    }
}

/// `POST /webapi/simulation/:id/stop`
pub async fn stop_simulation(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let sim = load(&state, &id).await?;
    // The registry, not the stored status, decides whether there is
    // anything to stop.
    match state.controller.stop_simulation(&sim.id).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(ControllerError::NotRunning(_)) => Err(not_ready("stopped", sim.status)),
        Err(e) => Err(e.into()),
    }
}

/// `POST /webapi/simulation/:id/provision`: bring provisioned device counts
/// to the requested `provisionedCount` per model, in the background.
pub async fn provision_devices(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(requested): Json<Vec<SimulationViewDeviceConfig>>,
) -> Result<Response, ApiError> {
    let sim = load(&state, &id).await?;
    if sim.status != SimulationStatus::Ready {
        return Err(not_provisionable(sim.status));
    }
    let app = target::get_target(&state.pool, &sim.target_id)
        .await?
        .ok_or_else(|| ApiError::not_found("application", &sim.target_id))?;
    claim(&state, &id, SimulationStatus::Provisioning, not_provisionable).await?;

    let controller = state.controller.clone();
    tokio::spawn(async move {
        // Failures are logged by the controller, which also restores `ready`.
        let _ = controller.reconcile_provisioning(&sim, &app, &requested).await;
    });

    Ok((StatusCode::ACCEPTED, "device provisioning started in background").into_response())
}

/// `GET /webapi/simulation/:id/export`: seed script download.
pub async fn export_simulation(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let sim = load(&state, &id).await?;
    let script = export::export_simulation(&state.pool, &sim, state.admin_port().await).await?;

    let disposition = format!("filename=loadData-{}.sh", sim.id);
    Ok(([(CONTENT_TYPE, "application/x-sh".to_owned()), (CONTENT_DISPOSITION, disposition)], script).into_response())
}

#[cfg(test)]
#[path = "simulations_test.rs"]
mod tests;
