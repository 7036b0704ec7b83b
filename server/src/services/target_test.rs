use super::*;
use crate::db::memory_pool;

fn sample_target(id: &str) -> Target {
    Target {
        id: id.into(),
        name: format!("App {id}"),
        provisioning_url: "global.azure-devices-provisioning.net".into(),
        id_scope: "0ne000ABCDE".into(),
        master_key: "c2VjcmV0".into(),
        app_url: format!("{id}.azureiotcentral.com"),
        app_token: "SharedAccessSignature sr=x".into(),
    }
}

fn device(target: &str, id: &str) -> TargetDevice {
    TargetDevice { target_id: target.into(), device_id: id.into(), connection_string: format!("HostName=h;DeviceId={id};SharedAccessKey=k") }
}

#[tokio::test]
async fn upsert_get_list_and_delete_targets() {
    let pool = memory_pool().await;
    assert!(get_target(&pool, "a").await.unwrap().is_none());

    upsert_target(&pool, &sample_target("b")).await.unwrap();
    upsert_target(&pool, &sample_target("a")).await.unwrap();
    let mut changed = sample_target("a");
    changed.name = "Renamed".into();
    upsert_target(&pool, &changed).await.unwrap();

    assert_eq!(get_target(&pool, "a").await.unwrap(), Some(changed));
    let ids: Vec<_> = list_targets(&pool).await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec!["a", "b"]);

    delete_target(&pool, "a").await.unwrap();
    delete_target(&pool, "missing").await.unwrap();
    assert_eq!(list_targets(&pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_target_drops_its_binding() {
    let pool = memory_pool().await;
    upsert_target(&pool, &sample_target("a")).await.unwrap();
    bind_models(&pool, "a", &["m1".into()]).await.unwrap();
    delete_target(&pool, "a").await.unwrap();
    assert!(get_target_models(&pool, "a").await.unwrap().is_none());
}

#[tokio::test]
async fn bind_models_keeps_order_and_skips_duplicates() {
    let pool = memory_pool().await;
    bind_models(&pool, "a", &["m2".into(), "m1".into()]).await.unwrap();
    let binding = bind_models(&pool, "a", &["m1".into(), "m3".into()]).await.unwrap();
    assert_eq!(binding.models, vec!["m2", "m1", "m3"]);
    assert_eq!(get_target_models(&pool, "a").await.unwrap(), Some(binding));
}

#[tokio::test]
async fn bind_and_unbind_across_targets() {
    let pool = memory_pool().await;
    upsert_target(&pool, &sample_target("a")).await.unwrap();
    upsert_target(&pool, &sample_target("b")).await.unwrap();
    set_target_models(&pool, &TargetModels { target_id: "a".into(), models: vec!["m1".into()] })
        .await
        .unwrap();

    bind_model_to_all_targets(&pool, "m2").await.unwrap();
    assert_eq!(get_target_models(&pool, "a").await.unwrap().unwrap().models, vec!["m1", "m2"]);
    // Targets without a binding row stay unbound.
    assert!(get_target_models(&pool, "b").await.unwrap().is_none());

    unbind_model_from_all_targets(&pool, "m1").await.unwrap();
    assert_eq!(get_target_models(&pool, "a").await.unwrap().unwrap().models, vec!["m2"]);
}

#[tokio::test]
async fn device_cache_prefix_matches_literally() {
    let pool = memory_pool().await;
    upsert_target_device(&pool, &device("app", "s1-app-m_1-1")).await.unwrap();
    upsert_target_device(&pool, &device("app", "s1-app-m_1-2")).await.unwrap();
    upsert_target_device(&pool, &device("app", "s1-app-mx1-1")).await.unwrap();
    upsert_target_device(&pool, &device("other", "s1-app-m_1-3")).await.unwrap();

    let found = list_target_devices_with_prefix(&pool, "app", "s1-app-m_1-").await.unwrap();
    let ids: Vec<_> = found.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["s1-app-m_1-1", "s1-app-m_1-2"]);
    assert_eq!(list_target_devices(&pool, "app").await.unwrap().len(), 3);
}

#[tokio::test]
async fn device_cache_get_delete_and_clear() {
    let pool = memory_pool().await;
    upsert_target_device(&pool, &device("app", "d1")).await.unwrap();
    upsert_target_device(&pool, &device("app", "d2")).await.unwrap();

    let cached = get_target_device(&pool, "app", "d1").await.unwrap().unwrap();
    assert!(cached.connection_string.contains("DeviceId=d1"));

    delete_target_device(&pool, "app", "d1").await.unwrap();
    assert!(get_target_device(&pool, "app", "d1").await.unwrap().is_none());

    assert_eq!(delete_all_target_devices(&pool, "app").await.unwrap(), 1);
    assert!(list_target_devices(&pool, "app").await.unwrap().is_empty());
}
