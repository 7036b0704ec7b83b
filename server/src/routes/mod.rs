//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router on the admin port carries two surfaces: `/webapi` is the
//! console's REST contract and `/api` is the lower-level admin surface that
//! exported seed scripts replay against. When `HTTP.uiDir` is configured the
//! static console is served as the fallback for every other path.
//!
//! ERROR HANDLING
//! ==============
//! Handlers return `ApiError`, whose body is always a plain-text message the
//! console can show verbatim. Store, transport and controller errors convert
//! into it through `From`, so handlers can use `?` throughout.

pub mod admin;
pub mod config;
pub mod device_models;
pub mod simulations;
pub mod targets;

use std::path::PathBuf;

use axum::Router;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::ConfigError;
use crate::db::StoreError;
use crate::services::central::CentralError;
use crate::services::export::ExportError;
use crate::sim::controller::ControllerError;
use crate::state::AppState;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound(format!("{kind} '{id}' not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<CentralError> for ApiError {
    fn from(err: CentralError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::AlreadyRunning(_) | ControllerError::NotRunning(_) => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::MissingTarget(_) | ExportError::MissingModel(_) => Self::NotFound(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

// =============================================================================
// ROUTER
// =============================================================================

/// Console REST contract, nested under `/webapi`.
fn webapi_routes() -> Router<AppState> {
    Router::new()
        .route("/target", get(targets::list_targets).post(targets::add_target).put(targets::update_target))
        .route("/target/{id}", get(targets::get_target).delete(targets::delete_target))
        .route("/target/{id}/import", post(targets::import_models))
        .route(
            "/model",
            get(device_models::list_models).post(device_models::add_model).put(device_models::update_model),
        )
        .route("/model/{id}", get(device_models::get_model).delete(device_models::delete_model))
        .route(
            "/simulation",
            get(simulations::list_simulations)
                .post(simulations::add_simulation)
                .put(simulations::update_simulation),
        )
        .route("/simulation/{id}", get(simulations::get_simulation).delete(simulations::delete_simulation))
        .route("/simulation/{id}/start", post(simulations::start_simulation))
        .route("/simulation/{id}/stop", post(simulations::stop_simulation))
        .route("/simulation/{id}/provision", post(simulations::provision_devices))
        .route("/simulation/{id}/export", get(simulations::export_simulation))
        .route("/config", get(config::get_config).put(config::update_config))
        .route("/config/metricsStatus", get(config::metrics_status))
}

/// Admin surface, nested under `/api`.
fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/target", get(targets::list_targets).put(admin::upsert_target))
        .route(
            "/target/{id}/models",
            get(admin::get_target_models).put(admin::put_target_models).delete(admin::delete_target_models),
        )
        .route("/target/{id}/device", get(admin::list_target_devices).delete(admin::delete_target_devices))
        .route("/model", get(device_models::list_models).put(admin::upsert_model))
        .route("/simulation", get(admin::list_simulations).put(admin::upsert_simulation))
        .route(
            "/simulation/{id}/deviceConfig",
            get(admin::list_device_configs).put(admin::upsert_device_config),
        )
        .route(
            "/simulation/{id}/deviceConfig/{config_id}",
            get(admin::get_device_config).delete(admin::delete_device_config),
        )
        .route("/simulation/{id}/start", post(simulations::start_simulation))
        .route("/simulation/{id}/stop", post(simulations::stop_simulation))
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::HEAD, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("x-requested-with"),
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ])
}

/// Build the admin-port router. `ui_dir` enables the static console fallback.
pub fn app(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let router = Router::new()
        .nest("/webapi", webapi_routes())
        .nest("/api", admin_routes())
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(state);

    match ui_dir {
        Some(dir) => {
            tracing::info!(dir = %dir.display(), "serving console from directory");
            router.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true))
        }
        None => router,
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
pub(crate) mod test_server {
    use super::*;

    /// Serve `app` on an ephemeral local port and return its base URL.
    pub async fn spawn(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app(state, None)).await.unwrap();
        });
        format!("http://{addr}")
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
