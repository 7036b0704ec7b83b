use super::*;
use axum::Router;
use axum::routing::get;
use serde_json::json;

use crate::routes::test_server;
use crate::services::device_model;
use crate::sim::test_helpers;
use crate::state::test_helpers::test_app_state;
use crate::types::{DeviceModel, Simulation};

/// Central stand-in that answers the template list with one thermostat.
async fn central() -> String {
    let app = Router::new().route(
        "/api/deviceTemplates",
        get(|| async {
            json!({"value": [{"displayName": "Thermo Stat", "capabilityModel": {"@id": "dtmi:t;1", "contents": []}}]})
                .to_string()
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn add_target_binds_every_known_model() {
    let state = test_app_state().await;
    device_model::upsert_device_model(&state.pool, &test_helpers::model()).await.unwrap();
    let base = test_server::spawn(state.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webapi/target"))
        .json(&test_helpers::target())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let binding = target::get_target_models(&state.pool, "app").await.unwrap().unwrap();
    assert_eq!(binding.models, vec!["thermo".to_owned()]);
}

#[tokio::test]
async fn add_target_rejects_duplicate_ids() {
    let state = test_app_state().await;
    target::upsert_target(&state.pool, &test_helpers::target()).await.unwrap();
    let base = test_server::spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webapi/target"))
        .json(&test_helpers::target())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.text().await.unwrap(),
        "Another application exists with Application ID 'app'. Try again with another ID."
    );
}

#[tokio::test]
async fn add_target_with_import_stores_templates() {
    let state = test_app_state().await;
    let base = test_server::spawn(state.clone()).await;
    let app_url = central().await;

    let body = json!({"id": "app", "name": "App", "appUrl": app_url, "importModels": true});
    let response = reqwest::Client::new().post(format!("{base}/webapi/target")).json(&body).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert!(device_model::get_device_model(&state.pool, "thermostat").await.unwrap().is_some());
    let binding = target::get_target_models(&state.pool, "app").await.unwrap().unwrap();
    assert_eq!(binding.models, vec!["thermostat".to_owned()]);
}

#[tokio::test]
async fn import_models_for_unknown_target_is_not_found() {
    let base = test_server::spawn(test_app_state().await).await;
    let response = reqwest::Client::new().post(format!("{base}/webapi/target/nope/import")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn import_models_binds_imports_to_the_target() {
    let state = test_app_state().await;
    let app_url = central().await;
    target::upsert_target(&state.pool, &Target { app_url, ..test_helpers::target() }).await.unwrap();
    let base = test_server::spawn(state.clone()).await;

    let response = reqwest::Client::new().post(format!("{base}/webapi/target/app/import")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let models: Vec<DeviceModel> = device_model::list_device_models(&state.pool).await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(target::get_target_models(&state.pool, "app").await.unwrap().unwrap().models, vec!["thermostat"]);
}

#[tokio::test]
async fn get_and_list_targets() {
    let state = test_app_state().await;
    target::upsert_target(&state.pool, &test_helpers::target()).await.unwrap();
    let base = test_server::spawn(state).await;
    let client = reqwest::Client::new();

    let listed: Vec<Target> = client.get(format!("{base}/webapi/target")).send().await.unwrap().json().await.unwrap();
    assert_eq!(listed, vec![test_helpers::target()]);

    let one: Target = client.get(format!("{base}/webapi/target/app")).send().await.unwrap().json().await.unwrap();
    assert_eq!(one.id, "app");

    let missing = client.get(format!("{base}/webapi/target/other")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn update_target_requires_an_existing_target() {
    let state = test_app_state().await;
    let base = test_server::spawn(state.clone()).await;
    let client = reqwest::Client::new();

    let missing = client.put(format!("{base}/webapi/target")).json(&test_helpers::target()).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    target::upsert_target(&state.pool, &test_helpers::target()).await.unwrap();
    let renamed = Target { name: "Renamed".into(), ..test_helpers::target() };
    let ok = client.put(format!("{base}/webapi/target")).json(&renamed).send().await.unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(target::get_target(&state.pool, "app").await.unwrap().unwrap().name, "Renamed");
}

#[tokio::test]
async fn delete_target_in_use_is_rejected() {
    let state = test_app_state().await;
    let sim = Simulation { name: "Sim One".into(), ..test_helpers::simulation() };
    test_helpers::seed(&state.pool, &sim, 1).await;
    let base = test_server::spawn(state.clone()).await;
    let client = reqwest::Client::new();

    let response = client.delete(format!("{base}/webapi/target/app")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    assert!(response.text().await.unwrap().contains("Delete the simulation 'Sim One' and try again."));

    simulation::delete_simulation(&state.pool, "sim").await.unwrap();
    let response = client.delete(format!("{base}/webapi/target/app")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(target::get_target(&state.pool, "app").await.unwrap().is_none());
}
