//! Simulation service: simulation records, their device configs, and the
//! aggregated views served to the console.
//!
//! DESIGN
//! ======
//! A view joins three sources: the device configs (simulated counts), the
//! target device cache (provisioned counts, matched by device-id prefix) and
//! the running simulator (connected counts, passed in by the caller). Models
//! created after the simulation are appended with zero counts so the console
//! can offer them for provisioning.

use std::collections::HashMap;

use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::db::StoreError;
use crate::services::target;
use crate::types::{DeviceConfig, DeviceModel, Simulation, SimulationStatus, SimulationView, SimulationViewDeviceConfig};

#[derive(sqlx::FromRow)]
struct SimulationRow {
    id: String,
    name: String,
    target_id: String,
    status: String,
    wave_group_count: i64,
    wave_group_interval: i64,
    telemetry_batch_size: i64,
    telemetry_interval: i64,
    reported_property_interval: i64,
    disconnect_behavior: String,
    telemetry_format: String,
    last_updated_time: String,
}

const SIMULATION_COLUMNS: &str = "id, name, target_id, status, wave_group_count, wave_group_interval, \
     telemetry_batch_size, telemetry_interval, reported_property_interval, disconnect_behavior, \
     telemetry_format, last_updated_time";

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

impl TryFrom<SimulationRow> for Simulation {
    type Error = StoreError;

    fn try_from(row: SimulationRow) -> Result<Self, Self::Error> {
        let last_updated_time = if row.last_updated_time.is_empty() {
            OffsetDateTime::UNIX_EPOCH
        } else {
            OffsetDateTime::parse(&row.last_updated_time, &Rfc3339).map_err(|e| StoreError::corrupt(&row.id, e))?
        };
        Ok(Self {
            status: row.status.parse().map_err(|e| StoreError::corrupt(&row.id, e))?,
            disconnect_behavior: row.disconnect_behavior.parse().map_err(|e| StoreError::corrupt(&row.id, e))?,
            telemetry_format: row.telemetry_format.parse().map_err(|e| StoreError::corrupt(&row.id, e))?,
            wave_group_count: to_u32(row.wave_group_count),
            wave_group_interval: to_u32(row.wave_group_interval),
            telemetry_batch_size: to_u32(row.telemetry_batch_size),
            telemetry_interval: to_u32(row.telemetry_interval),
            reported_property_interval: to_u32(row.reported_property_interval),
            last_updated_time,
            id: row.id,
            name: row.name,
            target_id: row.target_id,
        })
    }
}

fn format_time(id: &str, at: OffsetDateTime) -> Result<String, StoreError> {
    at.format(&Rfc3339).map_err(|e| StoreError::corrupt(id, e))
}

// =============================================================================
// SIMULATIONS
// =============================================================================

/// Fetch one simulation.
///
/// # Errors
///
/// Returns a database error, or `Corrupt` for unreadable rows.
pub async fn get_simulation(pool: &SqlitePool, id: &str) -> Result<Option<Simulation>, StoreError> {
    let row = sqlx::query_as::<_, SimulationRow>(&format!("SELECT {SIMULATION_COLUMNS} FROM simulations WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(Simulation::try_from).transpose()
}

/// List all simulations ordered by id.
///
/// # Errors
///
/// Returns a database error, or `Corrupt` for unreadable rows.
pub async fn list_simulations(pool: &SqlitePool) -> Result<Vec<Simulation>, StoreError> {
    let rows = sqlx::query_as::<_, SimulationRow>(&format!("SELECT {SIMULATION_COLUMNS} FROM simulations ORDER BY id"))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Simulation::try_from).collect()
}

/// Insert or replace a simulation record.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn upsert_simulation(pool: &SqlitePool, sim: &Simulation) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT OR REPLACE INTO simulations ({SIMULATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&sim.id)
    .bind(&sim.name)
    .bind(&sim.target_id)
    .bind(sim.status.as_str())
    .bind(i64::from(sim.wave_group_count))
    .bind(i64::from(sim.wave_group_interval))
    .bind(i64::from(sim.telemetry_batch_size))
    .bind(i64::from(sim.telemetry_interval))
    .bind(i64::from(sim.reported_property_interval))
    .bind(sim.disconnect_behavior.as_str())
    .bind(sim.telemetry_format.as_str())
    .bind(format_time(&sim.id, sim.last_updated_time)?)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a simulation together with its device configs.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_simulation(pool: &SqlitePool, id: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM device_configs WHERE simulation_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM simulations WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Set a simulation's status and stamp `last_updated_time`.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn set_simulation_status(pool: &SqlitePool, id: &str, status: SimulationStatus) -> Result<(), StoreError> {
    sqlx::query("UPDATE simulations SET status = ?, last_updated_time = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(format_time(id, OffsetDateTime::now_utc())?)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a simulation from `from` to `to` in one statement. Returns `false`,
/// leaving the row untouched, when the simulation is missing or not in `from`.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn transition_status(
    pool: &SqlitePool,
    id: &str,
    from: SimulationStatus,
    to: SimulationStatus,
) -> Result<bool, StoreError> {
    let forms = from.stored_forms();
    let sql = format!(
        "UPDATE simulations SET status = ?, last_updated_time = ? WHERE id = ? AND status IN ({})",
        vec!["?"; forms.len()].join(", ")
    );
    let mut query = sqlx::query(&sql).bind(to.as_str()).bind(format_time(id, OffsetDateTime::now_utc())?).bind(id);
    for form in forms {
        query = query.bind(*form);
    }
    let result = query.execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// Replace a `ready` simulation's record and device configs in one
/// transaction. Returns `false`, writing nothing, when the stored simulation
/// is missing or not `ready`.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn update_ready_simulation(
    pool: &SqlitePool,
    sim: &Simulation,
    configs: &[DeviceConfig],
) -> Result<bool, StoreError> {
    let forms = SimulationStatus::Ready.stored_forms();
    let sql = format!(
        "UPDATE simulations SET name = ?, target_id = ?, status = ?, wave_group_count = ?, wave_group_interval = ?, \
         telemetry_batch_size = ?, telemetry_interval = ?, reported_property_interval = ?, disconnect_behavior = ?, \
         telemetry_format = ?, last_updated_time = ? WHERE id = ? AND status IN ({})",
        vec!["?"; forms.len()].join(", ")
    );
    let mut query = sqlx::query(&sql)
        .bind(&sim.name)
        .bind(&sim.target_id)
        .bind(sim.status.as_str())
        .bind(i64::from(sim.wave_group_count))
        .bind(i64::from(sim.wave_group_interval))
        .bind(i64::from(sim.telemetry_batch_size))
        .bind(i64::from(sim.telemetry_interval))
        .bind(i64::from(sim.reported_property_interval))
        .bind(sim.disconnect_behavior.as_str())
        .bind(sim.telemetry_format.as_str())
        .bind(format_time(&sim.id, sim.last_updated_time)?)
        .bind(&sim.id);
    for form in forms {
        query = query.bind(*form);
    }

    let mut tx = pool.begin().await?;
    if query.execute(&mut *tx).await?.rows_affected() == 0 {
        return Ok(false);
    }
    write_device_configs(&mut tx, &sim.id, configs).await?;
    tx.commit().await?;
    Ok(true)
}

/// Mark every simulation `ready`. Used at start-up since no simulator survives a restart.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn reset_all_to_ready(pool: &SqlitePool) -> Result<u64, StoreError> {
    let result = sqlx::query("UPDATE simulations SET status = ?, last_updated_time = ?")
        .bind(SimulationStatus::Ready.as_str())
        .bind(format_time("*", OffsetDateTime::now_utc())?)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// First simulation that runs against `target_id`, if any.
///
/// # Errors
///
/// Returns a store error if the lookup fails.
pub async fn find_simulation_using_target(pool: &SqlitePool, target_id: &str) -> Result<Option<Simulation>, StoreError> {
    let row = sqlx::query_as::<_, SimulationRow>(&format!(
        "SELECT {SIMULATION_COLUMNS} FROM simulations WHERE target_id = ? ORDER BY id LIMIT 1"
    ))
    .bind(target_id)
    .fetch_optional(pool)
    .await?;
    row.map(Simulation::try_from).transpose()
}

/// First simulation with a device config referencing `model_id`, if any.
///
/// # Errors
///
/// Returns a store error if the lookup fails.
pub async fn find_simulation_using_model(pool: &SqlitePool, model_id: &str) -> Result<Option<Simulation>, StoreError> {
    let row = sqlx::query_as::<_, SimulationRow>(&format!(
        "SELECT {SIMULATION_COLUMNS} FROM simulations
         WHERE id IN (SELECT simulation_id FROM device_configs WHERE model_id = ?)
         ORDER BY id LIMIT 1"
    ))
    .bind(model_id)
    .fetch_optional(pool)
    .await?;
    row.map(Simulation::try_from).transpose()
}

// =============================================================================
// DEVICE CONFIGS
// =============================================================================

/// List a simulation's device configs ordered by id.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_device_configs(pool: &SqlitePool, sim_id: &str) -> Result<Vec<DeviceConfig>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String, i64)>(
        "SELECT id, model_id, device_count FROM device_configs WHERE simulation_id = ? ORDER BY id",
    )
    .bind(sim_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, model_id, count)| DeviceConfig { id, model_id, device_count: to_u32(count) })
        .collect())
}

/// Fetch one device config.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn get_device_config(pool: &SqlitePool, sim_id: &str, id: &str) -> Result<Option<DeviceConfig>, StoreError> {
    let row = sqlx::query_as::<_, (String, i64)>(
        "SELECT model_id, device_count FROM device_configs WHERE simulation_id = ? AND id = ?",
    )
    .bind(sim_id)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(model_id, count)| DeviceConfig { id: id.to_owned(), model_id, device_count: to_u32(count) }))
}

/// Insert or replace one device config.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn upsert_device_config(pool: &SqlitePool, sim_id: &str, config: &DeviceConfig) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO device_configs (simulation_id, id, model_id, device_count) VALUES (?, ?, ?, ?)
         ON CONFLICT (simulation_id, id) DO UPDATE SET
            model_id = excluded.model_id,
            device_count = excluded.device_count",
    )
    .bind(sim_id)
    .bind(&config.id)
    .bind(&config.model_id)
    .bind(i64::from(config.device_count))
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete one device config.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_device_config(pool: &SqlitePool, sim_id: &str, id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM device_configs WHERE simulation_id = ? AND id = ?")
        .bind(sim_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace all device configs of a simulation atomically.
///
/// # Errors
///
/// Returns a database error if the transaction fails.
pub async fn replace_device_configs(pool: &SqlitePool, sim_id: &str, configs: &[DeviceConfig]) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    write_device_configs(&mut tx, sim_id, configs).await?;
    tx.commit().await?;
    Ok(())
}

async fn write_device_configs(conn: &mut SqliteConnection, sim_id: &str, configs: &[DeviceConfig]) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM device_configs WHERE simulation_id = ?")
        .bind(sim_id)
        .execute(&mut *conn)
        .await?;
    for config in configs {
        sqlx::query("INSERT OR REPLACE INTO device_configs (simulation_id, id, model_id, device_count) VALUES (?, ?, ?, ?)")
            .bind(sim_id)
            .bind(&config.id)
            .bind(&config.model_id)
            .bind(i64::from(config.device_count))
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// =============================================================================
// VIEWS
// =============================================================================

/// Number of cached devices this simulation provisioned for a model.
///
/// # Errors
///
/// Returns a store error if the cache lookup fails.
pub async fn provisioned_count(pool: &SqlitePool, sim: &Simulation, model_id: &str) -> Result<u32, StoreError> {
    let devices = target::list_target_devices_with_prefix(pool, &sim.target_id, &sim.device_prefix(model_id)).await?;
    Ok(u32::try_from(devices.len()).unwrap_or(u32::MAX))
}

/// Build the console view of one simulation.
///
/// `connected` maps model id to the number of currently connected devices.
///
/// # Errors
///
/// Returns a store error if any lookup fails.
pub async fn build_view(
    pool: &SqlitePool,
    sim: Simulation,
    all_models: &[DeviceModel],
    connected: &HashMap<String, u32>,
) -> Result<SimulationView, StoreError> {
    let configs = list_device_configs(pool, &sim.id).await?;

    let mut devices = Vec::with_capacity(configs.len() + all_models.len());
    for config in configs {
        devices.push(SimulationViewDeviceConfig {
            provisioned_count: provisioned_count(pool, &sim, &config.model_id).await?,
            simulated_count: config.device_count,
            connected_count: connected.get(&config.model_id).copied().unwrap_or(0),
            id: config.id,
            model_id: config.model_id,
        });
    }

    for model in all_models {
        if !devices.iter().any(|d| d.model_id == model.id) {
            devices.push(SimulationViewDeviceConfig {
                id: model.id.clone(),
                model_id: model.id.clone(),
                ..SimulationViewDeviceConfig::default()
            });
        }
    }

    Ok(SimulationView { simulation: sim, devices })
}

#[cfg(test)]
#[path = "simulation_test.rs"]
mod tests;
