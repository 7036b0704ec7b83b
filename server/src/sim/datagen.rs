//! Random telemetry, reported properties and desired-property acks.
//!
//! DESIGN
//! ======
//! Values are generated per DTDL schema name; complex schemas produce an
//! empty string. Each device owns a `DataGenerator` so the geopoint route
//! position and the OPC-UA sequence number advance per device.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use uuid::Uuid;

use crate::sim::capability::CapabilityModel;
use crate::types::TelemetryFormat;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzACBDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const OPCUA_PUBLISHER_ID: &str = "Standalone_IIOTEdgeServer_opcpublisher";

/// One telemetry message ready to be published.
#[derive(Debug, Clone)]
pub struct TelemetryMessage {
    pub body: Vec<u8>,
    pub message_id: String,
    pub correlation_id: String,
    pub creation_time: OffsetDateTime,
    pub datapoints: usize,
}

pub struct DataGenerator {
    model: Arc<CapabilityModel>,
    route: Arc<Vec<[f64; 3]>>,
    next_geopoint: usize,
    sequence_number: u64,
}

impl DataGenerator {
    #[must_use]
    pub fn new(model: Arc<CapabilityModel>, route: Arc<Vec<[f64; 3]>>) -> Self {
        Self { model, route, next_geopoint: 0, sequence_number: 0 }
    }

    /// Build a telemetry batch. Message `k` is stamped earlier than `now` so
    /// the batch spreads across the telemetry interval.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a payload cannot be encoded.
    pub fn telemetry_batch(
        &mut self,
        device_id: &str,
        format: TelemetryFormat,
        batch_size: u32,
        interval_secs: u32,
        now: OffsetDateTime,
    ) -> Result<Vec<TelemetryMessage>, serde_json::Error> {
        batch_timestamps(now, batch_size, interval_secs)
            .into_iter()
            .map(|at| self.telemetry_message(device_id, format, at))
            .collect()
    }

    /// Build one telemetry message.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn telemetry_message(
        &mut self,
        device_id: &str,
        format: TelemetryFormat,
        creation_time: OffsetDateTime,
    ) -> Result<TelemetryMessage, serde_json::Error> {
        let (payload, datapoints) = match format {
            TelemetryFormat::Default => self.default_payload(),
            TelemetryFormat::Opcua => self.opcua_payload(device_id),
        };
        Ok(TelemetryMessage {
            body: serde_json::to_vec(&payload)?,
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            creation_time,
            datapoints,
        })
    }

    fn default_payload(&mut self) -> (Value, usize) {
        let model = Arc::clone(&self.model);
        let mut body = Map::new();
        for telemetry in model.telemetry() {
            body.insert(telemetry.name.clone(), self.random_value(&telemetry.schema));
        }
        let count = body.len();
        (Value::Object(body), count)
    }

    fn opcua_payload(&mut self, device_id: &str) -> (Value, usize) {
        let model = Arc::clone(&self.model);
        let now = rfc3339(OffsetDateTime::now_utc());
        self.sequence_number += 1;

        let mut nodes = Map::new();
        let mut envelope = Map::new();
        let mut datapoints = 0;
        for telemetry in model.telemetry() {
            let value = self.random_value(&telemetry.schema);
            let node_id = format!("nsu={};s={}", random_string(20), random_string(20));
            nodes.insert(
                node_id,
                json!({
                    "ServerTimestamp": now,
                    "SourceTimestamp": now,
                    "StatusCode": null,
                    "Value": value,
                }),
            );
            envelope.insert(telemetry.name.clone(), value);
            datapoints += 1;
        }

        envelope.insert("DataSetClassId".into(), Value::Null);
        envelope.insert("DataSetWriterGroup".into(), json!(device_id));
        envelope.insert("EventId".into(), json!(Uuid::new_v4().to_string()));
        envelope.insert("MessageId".into(), json!(random_string(5)));
        envelope.insert("MessageType".into(), json!("ua-data"));
        envelope.insert("PublisherId".into(), json!(OPCUA_PUBLISHER_ID));
        envelope.insert(
            "Messages".into(),
            json!([{
                "DataSetWriterId": format!("{device_id}-{}", Uuid::new_v4()),
                "MetaDataVersion": { "MajorVersion": 1, "MinorVersion": 0 },
                "SequenceNumber": self.sequence_number,
                "Status": null,
                "Timestamp": now,
                "Payload": nodes,
            }]),
        );
        (Value::Object(envelope), datapoints)
    }

    /// Random values for every read-only property.
    pub fn reported_properties(&mut self) -> Map<String, Value> {
        let model = Arc::clone(&self.model);
        let mut reported = Map::new();
        for property in model.properties().filter(|p| !p.writable) {
            reported.insert(property.name.clone(), self.random_value(&property.schema));
        }
        reported
    }

    /// Random JSON value for a DTDL primitive schema.
    pub fn random_value(&mut self, schema: &str) -> Value {
        let mut rng = rand::rng();
        match schema.to_ascii_lowercase().as_str() {
            "boolean" => json!(rng.random_bool(0.5)),
            "date" => {
                let today = OffsetDateTime::now_utc().date();
                json!(today.format(format_description!("[year]-[month]-[day]")).unwrap_or_default())
            }
            "datetime" | "time" => json!(rfc3339(OffsetDateTime::now_utc())),
            "double" => json!(100.0 * rng.random::<f64>()),
            "float" => json!(100.0 * rng.random::<f32>()),
            "integer" => json!(rng.random_range(0..100_i32)),
            "long" => json!(rng.random_range(0..1000_i64)),
            "string" => json!(random_string(10)),
            "duration" => {
                let (h, m, s) = (rng.random_range(0..12), rng.random_range(0..60), rng.random_range(0..60));
                json!(format!("P0Y0M0DT{h}H{m}M{s}S"))
            }
            "geopoint" => self.next_geopoint(),
            _ => json!(""),
        }
    }

    fn next_geopoint(&mut self) -> Value {
        let Some(point) = self.route.get(self.next_geopoint % self.route.len().max(1)).copied() else {
            return json!({ "lat": 0.0, "lon": 0.0, "alt": 0.0 });
        };
        self.next_geopoint = (self.next_geopoint + 1) % self.route.len();
        json!({ "lat": point[0], "lon": point[1], "alt": point[2] })
    }
}

/// Creation times for a batch: `now - k * ((interval - 1) * 1000 / size)` ms.
#[must_use]
pub fn batch_timestamps(now: OffsetDateTime, batch_size: u32, interval_secs: u32) -> Vec<OffsetDateTime> {
    let size = batch_size.max(1);
    let step_ms = if size > 1 { u64::from(interval_secs.saturating_sub(1)) * 1000 / u64::from(size) } else { 0 };
    (0..u64::from(size))
        .map(|k| now - Duration::from_millis(k * step_ms))
        .collect()
}

/// Reported-property patch acknowledging every desired property.
#[must_use]
pub fn twin_update_ack(desired: &Map<String, Value>) -> Map<String, Value> {
    let version = desired.get("$version").cloned().unwrap_or(Value::Null);
    let ack = |value: &Value| json!({ "value": value, "ac": 200, "ad": "completed", "av": version });

    let mut reported = Map::new();
    for (key, value) in desired.iter().filter(|(k, _)| *k != "$version") {
        let component = value.as_object().filter(|inner| inner.contains_key("__t"));
        let entry = match component {
            Some(inner) => {
                let mut acked = Map::new();
                acked.insert("__t".into(), json!("c"));
                for (name, inner_value) in inner.iter().filter(|(k, _)| *k != "__t") {
                    acked.insert(name.clone(), ack(inner_value));
                }
                Value::Object(acked)
            }
            None => ack(value),
        };
        reported.insert(key.clone(), entry);
    }
    reported
}

fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len).map(|_| char::from(CHARSET[rng.random_range(0..CHARSET.len())])).collect()
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
#[path = "datagen_test.rs"]
mod tests;
