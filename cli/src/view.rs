//! Simulation views as the console shows them: status guards, the
//! provisioning request and the fleet table.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::client::CliError;

pub const READY: &str = "ready";
pub const RUNNING: &str = "running";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceRow {
    pub id: String,
    pub model_id: String,
    pub provisioned_count: u32,
    pub simulated_count: u32,
    pub connected_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationSummary {
    pub id: String,
    pub name: String,
    pub target_id: String,
    pub status: String,
    pub devices: Vec<DeviceRow>,
}

/// Refuse `action` unless the simulation is in `required` status.
///
/// # Errors
///
/// Returns `Rejected` with the same wording the server uses.
pub fn require_status(sim: &SimulationSummary, required: &str, action: &str) -> Result<(), CliError> {
    if sim.status == required {
        return Ok(());
    }
    Err(CliError::Rejected(format!("Simulation cannot be {action} while it is in '{}' status.", sim.status)))
}

/// Parse `MODEL=N` arguments.
///
/// # Errors
///
/// Returns `InvalidCount` for a malformed argument.
pub fn parse_counts(args: &[String]) -> Result<HashMap<String, u32>, CliError> {
    let mut counts = HashMap::with_capacity(args.len());
    for arg in args {
        let (model, count) = arg.split_once('=').ok_or_else(|| CliError::InvalidCount(arg.clone()))?;
        let count = count.trim().parse().map_err(|_| CliError::InvalidCount(arg.clone()))?;
        if model.trim().is_empty() {
            return Err(CliError::InvalidCount(arg.clone()));
        }
        counts.insert(model.trim().to_owned(), count);
    }
    Ok(counts)
}

/// Provisioning body: every row of the view, with `provisionedCount`
/// replaced for the models named in `counts`. Unknown model ids are appended.
#[must_use]
pub fn provisioning_request(sim: &SimulationSummary, counts: &HashMap<String, u32>) -> Vec<DeviceRow> {
    let mut rows = sim.devices.clone();
    for row in &mut rows {
        if let Some(&count) = counts.get(&row.model_id) {
            row.provisioned_count = count;
        }
    }

    let mut extra: Vec<_> = counts.iter().filter(|(model, _)| !rows.iter().any(|r| &r.model_id == *model)).collect();
    extra.sort();
    for (model, &count) in extra {
        rows.push(DeviceRow { id: model.clone(), model_id: model.clone(), provisioned_count: count, ..DeviceRow::default() });
    }
    rows
}

/// One line per simulation and model.
#[must_use]
pub fn render_table(sims: &[SimulationSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<20} {:<14} {:<13} {:<16} {:>11} {:>9} {:>9}",
        "ID", "NAME", "APPLICATION", "STATUS", "MODEL", "PROVISIONED", "SIMULATED", "CONNECTED"
    );
    for sim in sims {
        if sim.devices.is_empty() {
            let _ = writeln!(out, "{:<16} {:<20} {:<14} {:<13} {:<16}", sim.id, sim.name, sim.target_id, sim.status, "-");
            continue;
        }
        for device in &sim.devices {
            let _ = writeln!(
                out,
                "{:<16} {:<20} {:<14} {:<13} {:<16} {:>11} {:>9} {:>9}",
                sim.id,
                sim.name,
                sim.target_id,
                sim.status,
                device.model_id,
                device.provisioned_count,
                device.simulated_count,
                device.connected_count
            );
        }
    }
    out
}

#[cfg(test)]
#[path = "view_test.rs"]
mod tests;
