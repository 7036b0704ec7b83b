use super::*;
use serde_json::json;
use time::OffsetDateTime;

fn creds(device_id: &str) -> DeviceCredentials {
    DeviceCredentials {
        host_name: "hub-7.azure-devices.net".into(),
        device_id: device_id.into(),
        shared_access_key: "a2V5".into(),
    }
}

fn message(body: &str) -> TelemetryMessage {
    TelemetryMessage {
        body: body.as_bytes().to_vec(),
        message_id: "m".into(),
        correlation_id: "c".into(),
        creation_time: OffsetDateTime::now_utc(),
        datapoints: 1,
    }
}

#[tokio::test]
async fn counts_traffic_until_closed() {
    let transport = LoopbackTransport::default();
    let session = transport.connect(&creds("d1"), &ConnectOptions::default()).await.unwrap();
    let conn = session.connection;
    assert_eq!(conn.hub_name(), "hub-7");
    assert!(transport.is_connected("d1"));

    conn.send_event(&message("{\"a\":1}"), Duration::ZERO).await.unwrap();
    conn.update_reported(&json!({"serial": "x"}).as_object().unwrap().clone(), Duration::ZERO).await.unwrap();
    conn.respond_method("1", 200, &json!({})).await.unwrap();
    conn.close().await;
    conn.close().await;

    assert_eq!(
        transport.stats(),
        LoopbackStats { connects: 1, closes: 1, messages: 1, bytes: 7, reported: 1, method_responses: 1 }
    );
    assert!(!transport.is_connected("d1"));
    assert_eq!(conn.send_event(&message("x"), Duration::ZERO).await, Err(HubError::ConnectionClosed));
    assert_eq!(transport.reported_patches("d1")[0]["serial"], "x");
}

#[tokio::test]
async fn refused_connects_are_consumed() {
    let transport = LoopbackTransport::default();
    transport.refuse_next_connects(1);
    assert!(matches!(
        transport.connect(&creds("d1"), &ConnectOptions::default()).await,
        Err(HubError::NotAuthorized)
    ));
    assert!(transport.connect(&creds("d1"), &ConnectOptions::default()).await.is_ok());
}

#[tokio::test]
async fn failing_sends_are_throttled() {
    let transport = LoopbackTransport::default();
    let session = transport.connect(&creds("d1"), &ConnectOptions::default()).await.unwrap();
    transport.set_fail_sends(true);
    let err = session.connection.send_event(&message("x"), Duration::ZERO).await.unwrap_err();
    assert_eq!(err.kind(), "throttled");
}

#[tokio::test]
async fn pushed_events_reach_the_session() {
    let transport = LoopbackTransport::default();
    let mut session = transport.connect(&creds("d1"), &ConnectOptions::default()).await.unwrap();
    let event = HubEvent::MethodCall { request_id: "9".into(), name: "reboot".into(), payload: json!(null) };
    assert!(transport.push_event("d1", event.clone()));
    assert!(!transport.push_event("nobody", event.clone()));
    assert_eq!(session.events.recv().await, Some(event));
}
