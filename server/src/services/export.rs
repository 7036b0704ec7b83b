//! Simulation export as a replayable shell script.
//!
//! DESIGN
//! ======
//! The script recreates everything a simulation needs through the `/api`
//! admin routes: target, models, target/model binding, the simulation itself
//! and its device configs. Start/stop commands are emitted commented out.
//! Rendering is a pure function over loaded records; `export_simulation`
//! only gathers them from the store.

use std::fmt::Write as _;

use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::db::StoreError;
use crate::services::{device_model, simulation, target};
use crate::types::{DeviceConfig, DeviceModel, Simulation, SimulationStatus, Target};

const RULE: &str = "#####################################################################################\n";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("target '{0}' not found")]
    MissingTarget(String),
    #[error("device model '{0}' not found")]
    MissingModel(String),
    #[error("export serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything the script is rendered from.
pub struct ExportBundle<'a> {
    pub simulation: &'a Simulation,
    pub target: &'a Target,
    pub models: &'a [DeviceModel],
    pub configs: &'a [DeviceConfig],
    pub admin_port: u16,
    pub generated_at: OffsetDateTime,
}

/// Load the simulation's target, models and device configs and render the script.
///
/// # Errors
///
/// Returns `MissingTarget`/`MissingModel` for dangling references and store
/// errors for failed lookups.
pub async fn export_simulation(pool: &SqlitePool, sim: &Simulation, admin_port: u16) -> Result<String, ExportError> {
    let target = target::get_target(pool, &sim.target_id)
        .await?
        .ok_or_else(|| ExportError::MissingTarget(sim.target_id.clone()))?;
    let configs = simulation::list_device_configs(pool, &sim.id).await?;

    let mut models = Vec::with_capacity(configs.len());
    for config in &configs {
        let model = device_model::get_device_model(pool, &config.model_id)
            .await?
            .ok_or_else(|| ExportError::MissingModel(config.model_id.clone()))?;
        models.push(model);
    }

    render_script(&ExportBundle {
        simulation: sim,
        target: &target,
        models: &models,
        configs: &configs,
        admin_port,
        generated_at: OffsetDateTime::now_utc(),
    })
}

/// Render the seed script.
///
/// # Errors
///
/// Returns `Json` if a record fails to serialize.
pub fn render_script(bundle: &ExportBundle<'_>) -> Result<String, ExportError> {
    let sim = bundle.simulation;
    let mut out = String::new();

    let generated = bundle.generated_at.format(&Rfc3339).unwrap_or_default();
    out.push_str("#!/bin/sh\n");
    out.push_str(RULE);
    let _ = writeln!(out, "## Generated by devsim at: {generated}");
    out.push_str("##\n");
    out.push_str("## Seeds all the data this simulation needs.\n");
    out.push_str("## Start the devsim server, then run this script.\n");
    out.push_str("##\n");
    out.push_str("## Start/stop commands are commented out at the bottom of the file.\n");
    out.push_str(RULE);
    out.push('\n');
    out.push_str("## Change this parameter based on your setup\n");
    let _ = writeln!(out, "BASE_URL=\"http://localhost:{}/api\"       # devsim admin endpoint\n", bundle.admin_port);

    out.push_str(RULE);
    out.push_str("## Add the IoT Central application the simulated devices are created in.\n");
    let _ = writeln!(out, "## Target application: '{}'", bundle.target.name);
    push_curl(&mut out, "PUT", "$BASE_URL/target", bundle.target)?;

    out.push_str(RULE);
    out.push_str("## Add device models. Models are shared by all simulations.\n");
    for model in bundle.models {
        let _ = writeln!(out, "## Device model: {}", model.name);
        push_curl(&mut out, "PUT", "$BASE_URL/model", model)?;
    }

    let model_ids: Vec<&str> = bundle.configs.iter().map(|c| c.model_id.as_str()).collect();
    out.push_str(RULE);
    out.push_str("## Bind the models to the target application so devices of these types\n");
    out.push_str("## can be simulated against it.\n");
    out.push_str("##\n");
    out.push_str("## NOTE: the models must also exist as device templates in the IoT Central\n");
    out.push_str("##       application before the simulation is started.\n");
    push_curl(&mut out, "PUT", &format!("$BASE_URL/target/{}/models", bundle.target.id), &model_ids)?;

    let mut exported = sim.clone();
    exported.status = SimulationStatus::Ready;
    out.push_str(RULE);
    out.push_str("## Add the simulation.\n");
    let _ = writeln!(out, "## Devices are distributed into {} wave group(s), {} second(s) apart.", sim.wave_group_count, sim.wave_group_interval);
    let _ = writeln!(
        out,
        "## Telemetry is sent every {} second(s) in batches of {} message(s).",
        sim.telemetry_interval, sim.telemetry_batch_size
    );
    let _ = writeln!(out, "## Reported properties are sent every {} second(s).", sim.reported_property_interval);
    out.push_str("## Set disconnectBehavior to 'telemetry' to disconnect devices after every batch.\n");
    let _ = writeln!(out, "## Simulation: {}", sim.name);
    push_curl(&mut out, "PUT", "$BASE_URL/simulation", &exported)?;

    out.push_str(RULE);
    out.push_str("## Configure the number of devices per model.\n");
    for config in bundle.configs {
        let _ = writeln!(out, "## Set up {} {} devices in simulation {}", config.device_count, config.model_id, sim.name);
        push_curl(&mut out, "PUT", &format!("$BASE_URL/simulation/{}/deviceConfig", sim.id), config)?;
    }

    for (verb, action) in [("Start", "start"), ("Stop", "stop")] {
        out.push_str(RULE);
        let _ = writeln!(out, "## {verb} this simulation.");
        let _ = writeln!(out, "# curl --location --request POST \"$BASE_URL/simulation/{}/{action}\"", sim.id);
        out.push('\n');
    }

    Ok(out)
}

fn push_curl<T: Serialize + ?Sized>(out: &mut String, method: &str, url: &str, body: &T) -> Result<(), ExportError> {
    let json = serde_json::to_string_pretty(body)?;
    let _ = writeln!(out, "curl --location --request {method} \"{url}\" \\");
    out.push_str("--header 'Content-Type: application/json' \\\n");
    out.push_str("--data-raw '\n");
    out.push_str(&shell_quote_body(&json));
    out.push_str("\n'\n\n");
    Ok(())
}

/// Escape single quotes for embedding inside a single-quoted shell word.
fn shell_quote_body(json: &str) -> String {
    json.replace('\'', r"'\''")
}

#[cfg(test)]
#[path = "export_test.rs"]
mod tests;
