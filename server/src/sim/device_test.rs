use super::*;
use crate::db::memory_pool;
use crate::sim::hub::loopback::{LoopbackStats, LoopbackTransport};
use crate::sim::test_helpers;

async fn device(
    sim: Simulation,
    config: SimulationConfig,
    cached: u32,
) -> (SimulatedDevice, LoopbackTransport, SqlitePool, prometheus::Registry) {
    let pool = memory_pool().await;
    test_helpers::seed(&pool, &sim, 1).await;
    test_helpers::cache_devices(&pool, &sim, cached).await;
    let transport = LoopbackTransport::default();
    let (registry, metrics) = test_helpers::metrics();
    let ctx = test_helpers::model_context(&pool, sim.clone(), config, Arc::new(transport.clone()), metrics);
    (SimulatedDevice::new(sim.device_id("thermo", 1), ctx), transport, pool, registry)
}

#[tokio::test]
async fn telemetry_connects_once_and_sends_the_batch() {
    let (device, transport, _pool, registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;

    device.send_telemetry().await;
    device.send_telemetry().await;

    let stats = transport.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.messages, 4);
    assert!(device.is_connected());
    assert_eq!(device.retry_count(), 0);
    assert!(test_helpers::render(&registry).contains("devsim_simulating_telemetry_batches_success_total"));
}

#[tokio::test]
async fn telemetry_disconnect_behavior_closes_after_each_batch() {
    let sim = Simulation { disconnect_behavior: DisconnectBehavior::Telemetry, ..test_helpers::simulation() };
    let (device, transport, _pool, _registry) = device(sim, test_helpers::config(), 1).await;

    device.send_telemetry().await;
    device.send_telemetry().await;

    let stats = transport.stats();
    assert_eq!((stats.connects, stats.closes), (2, 2));
    assert!(!device.is_connected());
}

#[tokio::test]
async fn concurrent_sends_are_skipped() {
    let (device, transport, _pool, registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;

    let _busy = InFlight::enter(&device.sending_telemetry).unwrap();
    device.send_telemetry().await;

    assert_eq!(transport.stats().messages, 0);
    assert!(test_helpers::render(&registry).contains("devsim_simulating_telemetry_batches_skipped_total"));
}

#[tokio::test]
async fn in_flight_flag_clears_on_drop() {
    let flag = AtomicBool::new(false);
    {
        let _guard = InFlight::enter(&flag).unwrap();
        assert!(InFlight::enter(&flag).is_none());
    }
    assert!(InFlight::enter(&flag).is_some());
}

#[tokio::test]
async fn repeated_failures_drop_the_cached_registration() {
    let (device, transport, pool, _registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;
    transport.set_fail_sends(true);

    device.send_telemetry().await;
    device.send_telemetry().await;
    assert_eq!(device.retry_count(), 2);

    // Third send drops the cache; DPS is unreachable so it fails again.
    device.send_telemetry().await;
    assert!(target::get_target_device(&pool, "app", device.id()).await.unwrap().is_none());
    assert!(!device.is_connected());
    assert_eq!(device.retry_count(), 1);
}

#[tokio::test]
async fn failover_refusal_reprovisions() {
    let (device, transport, _pool, registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;
    transport.refuse_next_connects(1);

    // Re-provisioning cannot reach DPS, so the connect fails after counting the fail-over.
    assert!(matches!(device.connect().await, Err(DeviceError::Provision(_))));
    let text = test_helpers::render(&registry);
    assert!(text.contains("devsim_simulating_failover_total"));
    assert!(text.contains("devsim_provisioning_failure_total"));
}

#[tokio::test]
async fn reported_properties_patch_read_only_properties() {
    let (device, transport, _pool, _registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;

    device.send_reported_properties().await;

    let patches = transport.reported_patches(device.id());
    assert_eq!(patches.len(), 1);
    assert!(patches[0].contains_key("serial"));
    assert!(!patches[0].contains_key("setpoint"));
}

#[tokio::test]
async fn listener_acks_desired_properties_and_methods() {
    let (device, transport, _pool, _registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;
    device.connect().await.unwrap();

    let desired = json!({"setpoint": 21.5, "$version": 3}).as_object().unwrap().clone();
    assert!(transport.push_event(device.id(), HubEvent::DesiredProperties(desired)));
    let call = HubEvent::MethodCall { request_id: "1".into(), name: "reboot".into(), payload: json!(null) };
    assert!(transport.push_event(device.id(), call));

    for _ in 0..50 {
        if transport.stats().method_responses == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let patches = transport.reported_patches(device.id());
    assert_eq!(patches[0]["setpoint"], json!({"value": 21.5, "ac": 200, "ad": "completed", "av": 3}));
    assert_eq!(transport.stats().method_responses, 1);
}

#[tokio::test]
async fn disconnect_keeps_the_registration() {
    let (device, transport, pool, _registry) = device(test_helpers::simulation(), test_helpers::config(), 1).await;
    device.connect().await.unwrap();
    device.disconnect().await;
    device.disconnect().await;

    assert_eq!(transport.stats(), LoopbackStats { connects: 1, closes: 1, ..LoopbackStats::default() });
    assert!(target::get_target_device(&pool, "app", device.id()).await.unwrap().is_some());
}
