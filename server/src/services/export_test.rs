use super::*;
use crate::db::memory_pool;
use crate::types::TelemetryFormat;
use serde_json::json;
use time::macros::datetime;

fn fixture() -> (Simulation, Target, Vec<DeviceModel>, Vec<DeviceConfig>) {
    let sim = Simulation {
        id: "s1".into(),
        name: "Fleet".into(),
        target_id: "app".into(),
        status: SimulationStatus::Running,
        wave_group_count: 2,
        wave_group_interval: 5,
        telemetry_batch_size: 3,
        telemetry_interval: 30,
        reported_property_interval: 60,
        telemetry_format: TelemetryFormat::Default,
        ..Simulation::default()
    };
    let target = Target { id: "app".into(), name: "O'Brien app".into(), ..Target::default() };
    let models = vec![DeviceModel {
        id: "thermo".into(),
        name: "Thermostat".into(),
        capability_model: vec![json!({"@id": "dtmi:t;1"})],
    }];
    let configs = vec![DeviceConfig { id: "thermo".into(), model_id: "thermo".into(), device_count: 4 }];
    (sim, target, models, configs)
}

fn render(admin_port: u16) -> String {
    let (sim, target, models, configs) = fixture();
    render_script(&ExportBundle {
        simulation: &sim,
        target: &target,
        models: &models,
        configs: &configs,
        admin_port,
        generated_at: datetime!(2024-05-01 10:00:00 UTC),
    })
    .unwrap()
}

#[test]
fn script_starts_with_shebang_and_base_url() {
    let script = render(7001);
    assert!(script.starts_with("#!/bin/sh\n"));
    assert!(script.contains("## Generated by devsim at: 2024-05-01T10:00:00Z"));
    assert!(script.contains("BASE_URL=\"http://localhost:7001/api\""));
}

#[test]
fn script_recreates_records_in_dependency_order() {
    let script = render(6001);
    let target = script.find("\"$BASE_URL/target\"").unwrap();
    let model = script.find("\"$BASE_URL/model\"").unwrap();
    let binding = script.find("\"$BASE_URL/target/app/models\"").unwrap();
    let simulation = script.find("\"$BASE_URL/simulation\"").unwrap();
    let config = script.find("\"$BASE_URL/simulation/s1/deviceConfig\"").unwrap();
    assert!(target < model && model < binding && binding < simulation && simulation < config);
}

#[test]
fn simulation_is_exported_ready_with_pretty_json() {
    let script = render(6001);
    assert!(script.contains("  \"status\": \"ready\""));
    assert!(!script.contains("\"running\""));
    assert!(script.contains("[\n  \"thermo\"\n]"));
}

#[test]
fn start_and_stop_are_commented_out() {
    let script = render(6001);
    assert!(script.contains("# curl --location --request POST \"$BASE_URL/simulation/s1/start\""));
    assert!(script.contains("# curl --location --request POST \"$BASE_URL/simulation/s1/stop\""));
}

#[test]
fn single_quotes_in_bodies_are_escaped() {
    let script = render(6001);
    assert!(script.contains(r#""name": "O'\''Brien app""#));
}

#[tokio::test]
async fn export_simulation_reports_missing_records() {
    let pool = memory_pool().await;
    let (sim, target, models, configs) = fixture();

    assert!(matches!(export_simulation(&pool, &sim, 6001).await, Err(ExportError::MissingTarget(_))));

    target::upsert_target(&pool, &target).await.unwrap();
    simulation::replace_device_configs(&pool, &sim.id, &configs).await.unwrap();
    assert!(matches!(export_simulation(&pool, &sim, 6001).await, Err(ExportError::MissingModel(id)) if id == "thermo"));

    device_model::upsert_device_model(&pool, &models[0]).await.unwrap();
    let script = export_simulation(&pool, &sim, 6001).await.unwrap();
    assert!(script.contains("## Device model: Thermostat"));
}
