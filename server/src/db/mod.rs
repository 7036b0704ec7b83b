//! Database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! Startup uses this module to open the embedded `SQLite` database under the
//! configured data directory and enforce schema migrations before the admin
//! API accepts traffic. Every service module shares the resulting pool.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::config::env_parse;

const DB_FILE_NAME: &str = "devsim.db";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Errors shared by every store module.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored record '{key}' is unreadable: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub(crate) fn corrupt(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Corrupt { key: key.into(), message: message.to_string() }
    }
}

/// Open the `SQLite` database in `data_dir` and run migrations.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the database cannot
/// be opened, or migrations fail.
pub async fn init_pool(data_dir: &Path) -> Result<SqlitePool, sqlx::Error> {
    std::fs::create_dir_all(data_dir)?;

    let options = SqliteConnectOptions::new()
        .filename(data_dir.join(DB_FILE_NAME))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS))
        .connect_with(options)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

/// In-memory database with the full schema, for tests.
///
/// A single connection that never expires keeps the memory database alive
/// for the lifetime of the pool.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("memory database should open");
    sqlx::migrate!("src/db/migrations")
        .run(&pool)
        .await
        .expect("migrations should apply");
    pool
}
