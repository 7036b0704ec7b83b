use super::*;

fn labels() -> DeviceLabels {
    DeviceLabels::new("s1", "app", "thermo")
}

fn render(registry: &Registry) -> String {
    TextEncoder::new().encode_to_string(&registry.gather()).unwrap()
}

#[test]
fn collectors_use_namespaced_names() {
    let registry = Registry::new();
    let metrics = SimMetrics::new(&registry).unwrap();
    metrics.set_simulated(&labels(), 25);
    metrics.provision_succeeded(&labels(), 0.2);

    let text = render(&registry);
    assert!(text.contains(r#"devsim_simulating_device_total{model="thermo",sim="s1",target="app"} 25"#));
    assert!(text.contains(r#"devsim_provisioning_success_total{model="thermo",sim="s1",target="app"} 1"#));
    assert!(text.contains("devsim_provisioning_latency_seconds_bucket"));
}

#[test]
fn registering_twice_fails() {
    let registry = Registry::new();
    SimMetrics::new(&registry).unwrap();
    assert!(SimMetrics::new(&registry).is_err());
}

#[test]
fn connect_and_disconnect_balance_gauges() {
    let registry = Registry::new();
    let metrics = SimMetrics::new(&registry).unwrap();
    metrics.device_connected(&labels(), "hub-a", 0.1);
    metrics.device_connected(&labels(), "hub-a", 0.1);
    metrics.device_disconnected(&labels(), "hub-a");

    let text = render(&registry);
    assert!(text.contains(r#"devsim_simulating_connect_total{hub="hub-a",model="thermo",sim="s1",target="app"} 1"#));
    assert!(text.contains(r#"devsim_simulating_connect_total_by_model{model="thermo",sim="s1",target="app"} 1"#));
    assert!(text.contains(r#"devsim_simulating_connect_latency_seconds_count{model="thermo",sim="s1",target="app"} 2"#));
}

#[test]
fn message_metrics_track_bytes_and_errors() {
    let registry = Registry::new();
    let metrics = SimMetrics::new(&registry).unwrap();
    metrics.message_sent(&labels(), 0.01, 120, 3);
    metrics.message_sent(&labels(), 0.01, 80, 2);
    metrics.message_failed(&labels(), "throttled");

    let text = render(&registry);
    assert!(text.contains(r#"devsim_simulating_telemetry_sent_bytes{model="thermo",sim="s1",target="app"} 200"#));
    assert!(text.contains(r#"devsim_simulating_telemetry_datapoints_sent_total{model="thermo",sim="s1",target="app"} 5"#));
    assert!(text.contains(
        r#"devsim_simulating_telemetry_messages_failure_total{error="throttled",model="thermo",sim="s1",target="app"} 1"#
    ));
}

#[tokio::test]
async fn http_server_serves_registry_until_shutdown() {
    let registry = Arc::new(Registry::new());
    let metrics = SimMetrics::new(&registry).unwrap();
    metrics.command_acked(&labels());

    let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).await.unwrap();
    let url = format!("http://{}/metrics", server.addr());
    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("devsim_simulating_commands_success_total"));

    server.shutdown().await;
    assert!(reqwest::get(&url).await.is_err());
}
