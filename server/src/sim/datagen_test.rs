use super::*;
use crate::sim::capability::{Component, Property, Telemetry};
use time::macros::datetime;

fn model() -> Arc<CapabilityModel> {
    let telemetry = ["temp:double", "count:integer", "where:geopoint", "blob:Object"]
        .iter()
        .map(|field| {
            let (name, schema) = field.split_once(':').unwrap();
            Telemetry { id: String::new(), name: name.into(), schema: schema.into() }
        })
        .collect();
    Arc::new(CapabilityModel {
        components: vec![Component {
            telemetry,
            properties: vec![
                Property { name: "serial".into(), schema: "string".into(), ..Property::default() },
                Property { name: "setpoint".into(), schema: "double".into(), writable: true, ..Property::default() },
            ],
            ..Component::default()
        }],
    })
}

fn route() -> Arc<Vec<[f64; 3]>> {
    Arc::new(vec![[1.0, 2.0, 0.0], [3.0, 4.0, 5.0]])
}

fn generator() -> DataGenerator {
    DataGenerator::new(model(), route())
}

#[test]
fn random_values_match_schema_ranges() {
    let mut g = generator();
    for _ in 0..50 {
        let d = g.random_value("double").as_f64().unwrap();
        assert!((0.0..100.0).contains(&d));
        let i = g.random_value("Integer").as_i64().unwrap();
        assert!((0..100).contains(&i));
        let l = g.random_value("long").as_i64().unwrap();
        assert!((0..1000).contains(&l));
    }
    assert!(g.random_value("boolean").is_boolean());
    assert_eq!(g.random_value("string").as_str().unwrap().len(), 10);
    assert_eq!(g.random_value("date").as_str().unwrap().len(), 10);
    assert!(OffsetDateTime::parse(g.random_value("dateTime").as_str().unwrap(), &Rfc3339).is_ok());
    assert_eq!(g.random_value("vector"), json!(""));

    let duration = g.random_value("duration");
    let duration = duration.as_str().unwrap();
    assert!(duration.starts_with("P0Y0M0DT") && duration.ends_with('S'));
}

#[test]
fn geopoints_cycle_through_route() {
    let mut g = generator();
    assert_eq!(g.random_value("geopoint"), json!({"lat": 1.0, "lon": 2.0, "alt": 0.0}));
    assert_eq!(g.random_value("geopoint"), json!({"lat": 3.0, "lon": 4.0, "alt": 5.0}));
    assert_eq!(g.random_value("geopoint")["lat"], json!(1.0));
}

#[test]
fn empty_route_yields_origin() {
    let mut g = DataGenerator::new(model(), Arc::new(Vec::new()));
    assert_eq!(g.random_value("geopoint"), json!({"lat": 0.0, "lon": 0.0, "alt": 0.0}));
}

#[test]
fn default_payload_has_every_telemetry_name() {
    let mut g = generator();
    let msg = g.telemetry_message("d1", TelemetryFormat::Default, datetime!(2024-05-01 10:00:00 UTC)).unwrap();
    let body: Value = serde_json::from_slice(&msg.body).unwrap();
    assert_eq!(msg.datapoints, 4);
    assert!(body["temp"].is_number());
    assert_eq!(body["blob"], json!(""));
    assert!(body["where"]["lat"].is_number());
    assert_ne!(msg.message_id, msg.correlation_id);
}

#[test]
fn opcua_payload_wraps_values_and_counts_sequence() {
    let mut g = generator();
    let now = datetime!(2024-05-01 10:00:00 UTC);
    let first = g.telemetry_message("d1", TelemetryFormat::Opcua, now).unwrap();
    let second = g.telemetry_message("d1", TelemetryFormat::Opcua, now).unwrap();

    let body: Value = serde_json::from_slice(&second.body).unwrap();
    assert_eq!(body["MessageType"], "ua-data");
    assert_eq!(body["DataSetWriterGroup"], "d1");
    assert_eq!(body["PublisherId"], OPCUA_PUBLISHER_ID);
    assert!(body["DataSetClassId"].is_null());
    assert_eq!(body["MessageId"].as_str().unwrap().len(), 5);
    assert!(body["temp"].is_number());

    let message = &body["Messages"][0];
    assert_eq!(message["SequenceNumber"], 2);
    assert_eq!(message["MetaDataVersion"]["MajorVersion"], 1);
    assert!(message["DataSetWriterId"].as_str().unwrap().starts_with("d1-"));
    let nodes = message["Payload"].as_object().unwrap();
    assert_eq!(nodes.len(), 4);
    assert!(nodes.keys().all(|k| k.starts_with("nsu=") && k.contains(";s=")));
    assert_eq!(first.datapoints, 4);
}

#[test]
fn batch_timestamps_spread_over_interval() {
    let now = datetime!(2024-05-01 10:00:30 UTC);
    let stamps = batch_timestamps(now, 3, 31);
    assert_eq!(stamps, vec![now, now - Duration::from_secs(10), now - Duration::from_secs(20)]);
    assert_eq!(batch_timestamps(now, 1, 30), vec![now]);
    assert_eq!(batch_timestamps(now, 0, 30), vec![now]);
    assert_eq!(batch_timestamps(now, 2, 0), vec![now, now]);
}

#[test]
fn telemetry_batch_uses_batch_size() {
    let mut g = generator();
    let batch = g.telemetry_batch("d1", TelemetryFormat::Default, 4, 10, OffsetDateTime::now_utc()).unwrap();
    assert_eq!(batch.len(), 4);
    assert!(batch[0].creation_time > batch[3].creation_time);
}

#[test]
fn reported_properties_skip_writable() {
    let mut g = generator();
    let reported = g.reported_properties();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported["serial"].as_str().unwrap().len(), 10);
}

#[test]
fn twin_ack_covers_plain_and_component_values() {
    let desired = json!({
        "$version": 7,
        "setpoint": 21.5,
        "thermostat": {"__t": "c", "targetTemp": 20, "mode": "eco"}
    });
    let ack = twin_update_ack(desired.as_object().unwrap());

    assert!(!ack.contains_key("$version"));
    assert_eq!(ack["setpoint"], json!({"value": 21.5, "ac": 200, "ad": "completed", "av": 7}));
    assert_eq!(ack["thermostat"]["__t"], "c");
    assert_eq!(ack["thermostat"]["targetTemp"], json!({"value": 20, "ac": 200, "ad": "completed", "av": 7}));
    assert_eq!(ack["thermostat"]["mode"]["value"], "eco");
    assert!(ack["thermostat"].get("value").is_none());
}
