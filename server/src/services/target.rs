//! Target service: applications, their model bindings, and the device cache.
//!
//! DESIGN
//! ======
//! A target is an IoT Central application. Each target has one binding row
//! listing the device models that may be simulated against it, and a cache of
//! provisioned devices (`target_devices`) holding the connection strings DPS
//! handed out. The cache is what "provisioned count" is computed from.

use sqlx::SqlitePool;

use crate::db::StoreError;
use crate::types::{Target, TargetDevice, TargetModels};

type TargetTuple = (String, String, String, String, String, String, String);

fn target_from_row(row: TargetTuple) -> Target {
    let (id, name, provisioning_url, id_scope, master_key, app_url, app_token) = row;
    Target { id, name, provisioning_url, id_scope, master_key, app_url, app_token }
}

// =============================================================================
// TARGETS
// =============================================================================

/// Fetch one target.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn get_target(pool: &SqlitePool, id: &str) -> Result<Option<Target>, StoreError> {
    let row = sqlx::query_as::<_, TargetTuple>(
        "SELECT id, name, provisioning_url, id_scope, master_key, app_url, app_token
         FROM targets WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(target_from_row))
}

/// List all targets ordered by id.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_targets(pool: &SqlitePool) -> Result<Vec<Target>, StoreError> {
    let rows = sqlx::query_as::<_, TargetTuple>(
        "SELECT id, name, provisioning_url, id_scope, master_key, app_url, app_token
         FROM targets ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(target_from_row).collect())
}

/// Insert or replace a target.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn upsert_target(pool: &SqlitePool, target: &Target) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO targets (id, name, provisioning_url, id_scope, master_key, app_url, app_token)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            provisioning_url = excluded.provisioning_url,
            id_scope = excluded.id_scope,
            master_key = excluded.master_key,
            app_url = excluded.app_url,
            app_token = excluded.app_token",
    )
    .bind(&target.id)
    .bind(&target.name)
    .bind(&target.provisioning_url)
    .bind(&target.id_scope)
    .bind(&target.master_key)
    .bind(&target.app_url)
    .bind(&target.app_token)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a target and its model binding. Missing ids are not an error.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_target(pool: &SqlitePool, id: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM target_models WHERE target_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM targets WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// =============================================================================
// MODEL BINDINGS
// =============================================================================

/// Fetch the models bound to a target.
///
/// # Errors
///
/// Returns a database error, or `Corrupt` if the stored list is not JSON.
pub async fn get_target_models(pool: &SqlitePool, target_id: &str) -> Result<Option<TargetModels>, StoreError> {
    let row = sqlx::query_as::<_, (String,)>("SELECT models FROM target_models WHERE target_id = ?")
        .bind(target_id)
        .fetch_optional(pool)
        .await?;

    let Some((raw,)) = row else {
        return Ok(None);
    };
    let models: Vec<String> = serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(target_id, e))?;
    Ok(Some(TargetModels { target_id: target_id.to_owned(), models }))
}

/// Replace the model list bound to a target.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn set_target_models(pool: &SqlitePool, binding: &TargetModels) -> Result<(), StoreError> {
    let models = serde_json::to_string(&binding.models).map_err(|e| StoreError::corrupt(&binding.target_id, e))?;
    sqlx::query(
        "INSERT INTO target_models (target_id, models) VALUES (?, ?)
         ON CONFLICT (target_id) DO UPDATE SET models = excluded.models",
    )
    .bind(&binding.target_id)
    .bind(models)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove a target's model binding.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_target_models(pool: &SqlitePool, target_id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM target_models WHERE target_id = ?")
        .bind(target_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Append model ids to a target's binding, creating it when missing and
/// skipping ids already bound.
///
/// # Errors
///
/// Returns a store error if the read or write fails.
pub async fn bind_models(pool: &SqlitePool, target_id: &str, model_ids: &[String]) -> Result<TargetModels, StoreError> {
    let mut binding = get_target_models(pool, target_id)
        .await?
        .unwrap_or_else(|| TargetModels { target_id: target_id.to_owned(), models: Vec::new() });
    for id in model_ids {
        if !binding.models.contains(id) {
            binding.models.push(id.clone());
        }
    }
    set_target_models(pool, &binding).await?;
    Ok(binding)
}

/// Bind a model to every target that already has a binding.
///
/// # Errors
///
/// Returns a store error if any read or write fails.
pub async fn bind_model_to_all_targets(pool: &SqlitePool, model_id: &str) -> Result<(), StoreError> {
    for target in list_targets(pool).await? {
        if get_target_models(pool, &target.id).await?.is_some() {
            bind_models(pool, &target.id, &[model_id.to_owned()]).await?;
        }
    }
    Ok(())
}

/// Drop a model id from every target binding.
///
/// # Errors
///
/// Returns a store error if any read or write fails.
pub async fn unbind_model_from_all_targets(pool: &SqlitePool, model_id: &str) -> Result<(), StoreError> {
    for target in list_targets(pool).await? {
        if let Some(mut binding) = get_target_models(pool, &target.id).await? {
            let before = binding.models.len();
            binding.models.retain(|m| m != model_id);
            if binding.models.len() != before {
                set_target_models(pool, &binding).await?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// DEVICE CACHE
// =============================================================================

/// List cached devices for a target.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_target_devices(pool: &SqlitePool, target_id: &str) -> Result<Vec<TargetDevice>, StoreError> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT device_id, connection_string FROM target_devices WHERE target_id = ? ORDER BY device_id",
    )
    .bind(target_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(device_id, connection_string)| TargetDevice { target_id: target_id.to_owned(), device_id, connection_string })
        .collect())
}

/// List cached devices of a target whose id starts with `prefix`.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_target_devices_with_prefix(
    pool: &SqlitePool,
    target_id: &str,
    prefix: &str,
) -> Result<Vec<TargetDevice>, StoreError> {
    // substr() instead of LIKE so '_' and '%' in ids match literally.
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT device_id, connection_string FROM target_devices
         WHERE target_id = ? AND substr(device_id, 1, length(?)) = ?
         ORDER BY device_id",
    )
    .bind(target_id)
    .bind(prefix)
    .bind(prefix)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(device_id, connection_string)| TargetDevice { target_id: target_id.to_owned(), device_id, connection_string })
        .collect())
}

/// Fetch one cached device.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn get_target_device(
    pool: &SqlitePool,
    target_id: &str,
    device_id: &str,
) -> Result<Option<TargetDevice>, StoreError> {
    let row = sqlx::query_as::<_, (String,)>(
        "SELECT connection_string FROM target_devices WHERE target_id = ? AND device_id = ?",
    )
    .bind(target_id)
    .bind(device_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(connection_string,)| TargetDevice {
        target_id: target_id.to_owned(),
        device_id: device_id.to_owned(),
        connection_string,
    }))
}

/// Cache a device connection string.
///
/// # Errors
///
/// Returns a database error if the write fails.
pub async fn upsert_target_device(pool: &SqlitePool, device: &TargetDevice) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO target_devices (target_id, device_id, connection_string) VALUES (?, ?, ?)
         ON CONFLICT (target_id, device_id) DO UPDATE SET connection_string = excluded.connection_string",
    )
    .bind(&device.target_id)
    .bind(&device.device_id)
    .bind(&device.connection_string)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop one cached device.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_target_device(pool: &SqlitePool, target_id: &str, device_id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM target_devices WHERE target_id = ? AND device_id = ?")
        .bind(target_id)
        .bind(device_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop every cached device of a target.
///
/// # Errors
///
/// Returns a database error if the delete fails.
pub async fn delete_all_target_devices(pool: &SqlitePool, target_id: &str) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM target_devices WHERE target_id = ?")
        .bind(target_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
#[path = "target_test.rs"]
mod tests;
