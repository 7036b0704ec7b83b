use super::*;
use axum::Router;
use axum::extract::Path;
use axum::routing::{get, put};
use serde_json::json;

use crate::config::HttpConfig;
use crate::db::memory_pool;
use crate::sim::hub::loopback::LoopbackTransport;
use crate::sim::test_helpers;

async fn controller(pool: &SqlitePool, config: GlobalConfig) -> Controller {
    let (_registry, metrics) = test_helpers::metrics();
    Controller::new(
        pool.clone(),
        Arc::new(RwLock::new(config)),
        metrics,
        CentralClient::new().unwrap(),
        Arc::new(LoopbackTransport::default()),
    )
}

fn global_config() -> GlobalConfig {
    GlobalConfig { simulation: test_helpers::config(), ..GlobalConfig::default() }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// DPS that assigns every registration on the first poll.
async fn start_dps() -> String {
    let app = Router::new()
        .route("/{scope}/registrations/{id}/register", put(|| async { r#"{"operationId":"op"}"# }))
        .route(
            "/{scope}/registrations/{id}/operations/{op}",
            get(|Path((_, _, _)): Path<(String, String, String)>| async {
                json!({"status": "assigned", "registrationState": {"assignedHub": test_helpers::HOST, "status": "assigned"}})
                    .to_string()
            }),
        );
    serve(app).await
}

fn view(model_id: &str, provisioned_count: u32) -> SimulationViewDeviceConfig {
    SimulationViewDeviceConfig { id: model_id.into(), model_id: model_id.into(), provisioned_count, ..Default::default() }
}

#[test]
fn device_indices_ignore_foreign_ids() {
    let ids = ["sim-app-thermo-1", "sim-app-thermo-12", "sim-app-thermo-x", "sim-app-thermostat-3", "other-1"];
    assert_eq!(device_indices("sim-app-thermo-", ids.into_iter()), vec![1, 12]);
}

#[tokio::test]
async fn start_and_stop_follow_the_registry() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 1).await;
    test_helpers::cache_devices(&pool, &sim, 1).await;
    let controller = controller(&pool, global_config()).await;

    controller.start_simulation(sim.clone()).await.unwrap();
    assert!(controller.is_running("sim").await);
    assert!(matches!(controller.start_simulation(sim.clone()).await, Err(ControllerError::AlreadyRunning(_))));

    controller.stop_simulation("sim").await.unwrap();
    assert!(!controller.is_running("sim").await);
    assert!(controller.connected_counts("sim").await.is_empty());
    assert!(matches!(controller.stop_simulation("sim").await, Err(ControllerError::NotRunning(_))));
}

#[tokio::test]
async fn concurrent_starts_register_one_simulator() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 1).await;
    test_helpers::cache_devices(&pool, &sim, 1).await;
    let controller = controller(&pool, global_config()).await;

    let (first, second) =
        tokio::join!(controller.start_simulation(sim.clone()), controller.start_simulation(sim.clone()));

    assert!(first.is_ok() ^ second.is_ok());
    assert!(matches!(first.or(second), Ok(())));
    assert!(controller.is_running("sim").await);
    controller.stop_simulation("sim").await.unwrap();
    assert!(matches!(controller.stop_simulation("sim").await, Err(ControllerError::NotRunning(_))));
}

#[tokio::test]
async fn finished_provisioning_leaves_other_statuses_alone() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 1).await;
    simulation::set_simulation_status(&pool, "sim", SimulationStatus::Running).await.unwrap();
    let controller = controller(&pool, global_config()).await;

    controller.reconcile_provisioning(&sim, &test_helpers::target(), &[]).await.unwrap();

    assert_eq!(simulation::get_simulation(&pool, "sim").await.unwrap().unwrap().status, SimulationStatus::Running);
}

#[tokio::test]
async fn provision_devices_extends_from_the_highest_id() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 0).await;
    test_helpers::cache_devices(&pool, &sim, 2).await;
    let controller = controller(&pool, global_config()).await;
    let target = Target { provisioning_url: start_dps().await, ..test_helpers::target() };

    let provisioned = controller.provision_devices(&sim, &target, &test_helpers::model(), 2, 3).await.unwrap();

    assert_eq!(provisioned, 3);
    let mut indices = controller.existing_device_indices(&sim, "thermo").await.unwrap();
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    let cached = target::get_target_device(&pool, "app", "sim-app-thermo-5").await.unwrap().unwrap();
    assert!(cached.connection_string.starts_with(&format!("HostName={};DeviceId=sim-app-thermo-5;", test_helpers::HOST)));
}

#[tokio::test]
async fn reconcile_removes_the_highest_devices() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 0).await;
    test_helpers::cache_devices(&pool, &sim, 5).await;
    let controller = controller(&pool, global_config()).await;

    controller.reconcile_provisioning(&sim, &test_helpers::target(), &[view("thermo", 2)]).await.unwrap();

    let mut indices = controller.existing_device_indices(&sim, "thermo").await.unwrap();
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2]);
    assert_eq!(simulation::get_simulation(&pool, "sim").await.unwrap().unwrap().status, SimulationStatus::Ready);
}

#[tokio::test]
async fn reconcile_lands_on_ready_when_registrations_fail() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 0).await;
    simulation::set_simulation_status(&pool, "sim", SimulationStatus::Provisioning).await.unwrap();
    let controller = controller(&pool, global_config()).await;

    controller
        .reconcile_provisioning(&sim, &test_helpers::target(), &[view("thermo", 2), view("unknown", 4)])
        .await
        .unwrap();

    assert!(controller.existing_device_indices(&sim, "thermo").await.unwrap().is_empty());
    assert_eq!(simulation::get_simulation(&pool, "sim").await.unwrap().unwrap().status, SimulationStatus::Ready);
}

#[tokio::test]
async fn delete_devices_counts_down_from_max_id() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 0).await;
    test_helpers::cache_devices(&pool, &sim, 4).await;
    let controller = controller(&pool, global_config()).await;

    assert_eq!(controller.delete_devices(&sim, &test_helpers::target(), "thermo", 4, 10).await, 4);
    assert!(controller.existing_device_indices(&sim, "thermo").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_simulation_removes_devices_and_record() {
    let pool = memory_pool().await;
    let sim = test_helpers::simulation();
    test_helpers::seed(&pool, &sim, 3).await;
    test_helpers::cache_devices(&pool, &sim, 3).await;
    let controller = controller(&pool, global_config()).await;

    controller.delete_simulation(&sim, Some(&test_helpers::target())).await.unwrap();

    assert!(simulation::get_simulation(&pool, "sim").await.unwrap().is_none());
    assert!(simulation::list_device_configs(&pool, "sim").await.unwrap().is_empty());
    assert!(target::list_target_devices(&pool, "app").await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_marks_every_simulation_ready() {
    let pool = memory_pool().await;
    let sim = Simulation { status: SimulationStatus::Running, ..test_helpers::simulation() };
    test_helpers::seed(&pool, &sim, 0).await;
    let controller = controller(&pool, global_config()).await;

    controller.reset_simulation_status().await.unwrap();
    assert_eq!(simulation::get_simulation(&pool, "sim").await.unwrap().unwrap().status, SimulationStatus::Ready);
}

#[tokio::test]
async fn metrics_status_probes_local_ports() {
    let grafana = serve(Router::new().route("/", get(|| async { "ok" }))).await;
    let grafana_port = grafana.rsplit(':').next().unwrap().parse().unwrap();
    let config = GlobalConfig {
        http: HttpConfig { grafana_port, prometheus_port: 1, ..HttpConfig::default() },
        ..global_config()
    };
    let pool = memory_pool().await;
    let controller = controller(&pool, config).await;

    assert_eq!(
        controller.metrics_status().await,
        MetricsStatus { grafana_server: true, prometheus_server: false }
    );
}
