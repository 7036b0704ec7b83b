mod config;
mod db;
mod logging;
mod metrics;
mod routes;
mod services;
mod sim;
mod state;
mod types;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config_path = config::config_path();
    let global = config::load_or_create(&config_path).expect("config load failed");
    let _log_guard = logging::init(&global.logger);
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let pool = db::init_pool(&global.data.directory()).await.expect("database init failed");

    let registry = Arc::new(prometheus::Registry::new());
    let sim_metrics = Arc::new(metrics::SimMetrics::new(&registry).expect("metrics registration failed"));
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], global.http.metrics_port));
    let metrics_server = metrics::spawn_http_server(Arc::clone(&registry), metrics_addr)
        .await
        .expect("failed to bind metrics port");
    tracing::info!(address = %metrics_server.addr(), "serving prometheus metrics");

    let central = services::central::CentralClient::new().expect("http client init failed");
    let transport = sim::hub::transport_for(global.simulation.transport);
    tracing::info!(transport = ?global.simulation.transport, "device transport selected");

    let admin_port = global.http.admin_port;
    let ui_dir = global.http.ui_dir.clone().filter(|d| !d.trim().is_empty()).map(PathBuf::from);
    let shared_config = Arc::new(RwLock::new(global));

    let controller = sim::controller::Controller::new(
        pool.clone(),
        Arc::clone(&shared_config),
        sim_metrics,
        central.clone(),
        transport,
    );
    // No simulator survives a restart.
    if let Err(e) = controller.reset_simulation_status().await {
        tracing::error!(error = %e, "failed to reset simulation statuses");
    }

    let state = state::AppState::new(pool, shared_config, config_path, controller.clone(), central);
    let app = routes::app(state, ui_dir);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{admin_port}"))
        .await
        .expect("failed to bind admin port");

    tracing::info!(%admin_port, "serving console API at http://localhost:{admin_port}/webapi");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    controller.stop_all().await;
    metrics_server.shutdown().await;
    tracing::info!("devsim stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
