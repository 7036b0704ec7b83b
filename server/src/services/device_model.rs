//! Device model service: DTDL capability models available to simulations.

use sqlx::SqlitePool;

use crate::db::StoreError;
use crate::types::DeviceModel;

const FALLBACK_MODEL_ID: &str = "model";

fn model_from_row(id: String, name: String, raw: &str) -> Result<DeviceModel, StoreError> {
    let capability_model = serde_json::from_str(raw).map_err(|e| StoreError::corrupt(&id, e))?;
    Ok(DeviceModel { id, name, capability_model })
}

/// Fetch one device model.
///
/// # Errors
///
/// Returns a database error, or `Corrupt` when the stored capability model is not JSON.
pub async fn get_device_model(pool: &SqlitePool, id: &str) -> Result<Option<DeviceModel>, StoreError> {
    let row = sqlx::query_as::<_, (String, String, String)>(
        "SELECT id, name, capability_model FROM device_models WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|(id, name, raw)| model_from_row(id, name, &raw)).transpose()
}

/// List all device models ordered by id.
///
/// # Errors
///
/// Returns a database error, or `Corrupt` when a stored capability model is not JSON.
pub async fn list_device_models(pool: &SqlitePool) -> Result<Vec<DeviceModel>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String, String)>(
        "SELECT id, name, capability_model FROM device_models ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|(id, name, raw)| model_from_row(id, name, &raw)).collect()
}

/// Insert or replace a device model.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn upsert_device_model(pool: &SqlitePool, model: &DeviceModel) -> Result<(), StoreError> {
    let capability_model =
        serde_json::to_string(&model.capability_model).map_err(|e| StoreError::corrupt(&model.id, e))?;
    sqlx::query(
        "INSERT INTO device_models (id, name, capability_model) VALUES (?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET name = excluded.name, capability_model = excluded.capability_model",
    )
    .bind(&model.id)
    .bind(&model.name)
    .bind(capability_model)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a device model. Missing ids are not an error.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_device_model(pool: &SqlitePool, id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM device_models WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Lower-case a display name and keep only `[a-z0-9]`.
#[must_use]
pub fn scrub_model_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Derive an unused model id from a display name: scrubbed name, `model` when
/// nothing survives scrubbing, then a numeric suffix until the id is free.
///
/// # Errors
///
/// Returns a store error if an existence check fails.
pub async fn generate_model_id(pool: &SqlitePool, name: &str) -> Result<String, StoreError> {
    let mut base = scrub_model_name(name);
    if base.is_empty() {
        base = FALLBACK_MODEL_ID.to_owned();
    }

    let mut candidate = base.clone();
    let mut suffix = 0_u32;
    while get_device_model(pool, &candidate).await?.is_some() {
        suffix += 1;
        candidate = format!("{base}{suffix}");
    }
    Ok(candidate)
}

#[cfg(test)]
#[path = "device_model_test.rs"]
mod tests;
