//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the store pool, the live configuration (plus the file it is saved
//! to), the simulation controller and the IoT Central client. The controller
//! shares the same configuration lock, so a `PUT /webapi/config` is seen by
//! every simulation started afterwards.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::config::GlobalConfig;
use crate::services::central::CentralClient;
use crate::sim::controller::Controller;

/// Shared application state. Clone is required by Axum; every field is
/// either Arc-wrapped or a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<RwLock<GlobalConfig>>,
    /// YAML file `PUT /webapi/config` rewrites.
    pub config_path: Arc<PathBuf>,
    pub controller: Controller,
    pub central: CentralClient,
}

impl AppState {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        config: Arc<RwLock<GlobalConfig>>,
        config_path: PathBuf,
        controller: Controller,
        central: CentralClient,
    ) -> Self {
        Self { pool, config, config_path: Arc::new(config_path), controller, central }
    }

    pub async fn admin_port(&self) -> u16 {
        self.config.read().await.http.admin_port
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
