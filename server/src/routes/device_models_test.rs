use super::*;
use serde_json::json;

use crate::routes::test_server;
use crate::sim::test_helpers;
use crate::state::test_helpers::test_app_state;
use crate::types::TargetModels;

#[tokio::test]
async fn add_model_generates_an_unused_id() {
    let state = test_app_state().await;
    device_model::upsert_device_model(&state.pool, &DeviceModel { id: "thermo".into(), ..test_helpers::model() })
        .await
        .unwrap();
    let base = test_server::spawn(state.clone()).await;

    let body = json!({"name": "Thermo!", "capabilityModel": []});
    let created: DeviceModel = reqwest::Client::new()
        .post(format!("{base}/webapi/model"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(created.id, "thermo1");
    assert!(device_model::get_device_model(&state.pool, "thermo1").await.unwrap().is_some());
}

#[tokio::test]
async fn add_model_rejects_duplicate_ids() {
    let state = test_app_state().await;
    device_model::upsert_device_model(&state.pool, &test_helpers::model()).await.unwrap();
    let base = test_server::spawn(state).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webapi/model"))
        .json(&test_helpers::model())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.text().await.unwrap(),
        "Another device model exists with Model ID 'thermo'. Try again with another ID."
    );
}

#[tokio::test]
async fn add_model_binds_to_existing_targets() {
    let state = test_app_state().await;
    target::upsert_target(&state.pool, &test_helpers::target()).await.unwrap();
    target::set_target_models(&state.pool, &TargetModels { target_id: "app".into(), models: vec!["other".into()] })
        .await
        .unwrap();
    let base = test_server::spawn(state.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webapi/model"))
        .json(&test_helpers::model())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let binding = target::get_target_models(&state.pool, "app").await.unwrap().unwrap();
    assert_eq!(binding.models, vec!["other", "thermo"]);
}

#[tokio::test]
async fn get_model_reports_missing_ids() {
    let state = test_app_state().await;
    device_model::upsert_device_model(&state.pool, &test_helpers::model()).await.unwrap();
    let base = test_server::spawn(state).await;
    let client = reqwest::Client::new();

    let found: DeviceModel = client.get(format!("{base}/webapi/model/thermo")).send().await.unwrap().json().await.unwrap();
    assert_eq!(found, test_helpers::model());
    assert_eq!(client.get(format!("{base}/webapi/model/none")).send().await.unwrap().status(), 404);
}

#[tokio::test]
async fn update_model_replaces_the_record() {
    let state = test_app_state().await;
    device_model::upsert_device_model(&state.pool, &test_helpers::model()).await.unwrap();
    let base = test_server::spawn(state.clone()).await;

    let renamed = DeviceModel { name: "Renamed".into(), ..test_helpers::model() };
    let response = reqwest::Client::new().put(format!("{base}/webapi/model")).json(&renamed).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(device_model::get_device_model(&state.pool, "thermo").await.unwrap().unwrap().name, "Renamed");
}

#[tokio::test]
async fn delete_model_in_use_is_rejected() {
    let state = test_app_state().await;
    test_helpers::seed(&state.pool, &test_helpers::simulation(), 1).await;
    let base = test_server::spawn(state).await;

    let response = reqwest::Client::new().delete(format!("{base}/webapi/model/thermo")).send().await.unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.text().await.unwrap(),
        "device model 'thermo' cannot be deleted as there are simulations using this model. Delete the simulation 'Sim' and try again."
    );
}

#[tokio::test]
async fn delete_model_unbinds_it_from_targets() {
    let state = test_app_state().await;
    target::upsert_target(&state.pool, &test_helpers::target()).await.unwrap();
    device_model::upsert_device_model(&state.pool, &test_helpers::model()).await.unwrap();
    target::bind_models(&state.pool, "app", &["thermo".into(), "other".into()]).await.unwrap();
    let base = test_server::spawn(state.clone()).await;

    let response = reqwest::Client::new().delete(format!("{base}/webapi/model/thermo")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert!(device_model::get_device_model(&state.pool, "thermo").await.unwrap().is_none());
    assert_eq!(target::get_target_models(&state.pool, "app").await.unwrap().unwrap().models, vec!["other"]);
}
