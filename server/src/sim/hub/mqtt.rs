//! IoT Hub device transport over MQTT 3.1.1 on TLS port 8883.
//!
//! DESIGN
//! ======
//! One `rumqttc` client and event loop per device. After CONNACK the event
//! loop moves into a driver task that matches PUBACKs to waiting publishers
//! and routes inbound publishes: twin responses complete pending reported
//! property updates, everything else becomes a `HubEvent` for the device.
//!
//! `rumqttc` reports the packet id of a publish only once it is written, so
//! publishers queue a waiter under an ordering lock and the driver pairs
//! waiters with outgoing packet ids in FIFO order. Every publish is QoS 1.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{
    ConnectOptions, DeviceCredentials, HubConnection, HubError, HubEvent, HubSession, HubTransport, hub_name,
    with_timeout,
};
use crate::sim::datagen::TelemetryMessage;
use crate::sim::sas;

const MQTT_PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const REQUEST_CAPACITY: usize = 64;
const EVENT_BUFFER: usize = 16;
const MAX_PACKET_SIZE: usize = 256 * 1024;
const METHOD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const METHOD_PREFIX: &str = "$iothub/methods/POST/";

pub struct MqttTransport;

#[async_trait]
impl HubTransport for MqttTransport {
    async fn connect(&self, credentials: &DeviceCredentials, options: &ConnectOptions) -> Result<HubSession, HubError> {
        let resource = format!("{}/devices/{}", credentials.host_name, credentials.device_id);
        let password = sas::create_sas_token(&credentials.shared_access_key, &resource, None, TOKEN_TTL)?;

        let mut mqtt = MqttOptions::new(credentials.device_id.clone(), credentials.host_name.clone(), MQTT_PORT);
        mqtt.set_credentials(username(credentials, &options.model_id), password);
        mqtt.set_keep_alive(KEEP_ALIVE);
        mqtt.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        mqtt.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        with_timeout(options.timeout, wait_for_connack(&mut eventloop)).await?;

        let device_id = &credentials.device_id;
        let mut topics = vec![format!("{TWIN_RESPONSE_PREFIX}#")];
        if options.subscribe_desired {
            topics.push(format!("{DESIRED_PREFIX}#"));
        }
        if options.subscribe_methods {
            topics.push(format!("{METHOD_PREFIX}#"));
        }
        if options.subscribe_cloud_messages {
            topics.push(format!("devices/{device_id}/messages/devicebound/#"));
        }
        for topic in topics {
            client.subscribe(topic, QoS::AtLeastOnce).await.map_err(|e| HubError::from_message(&e.to_string()))?;
        }

        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&shared), events_tx, device_id.clone()));

        let connection = MqttConnection {
            device_id: device_id.clone(),
            hub: hub_name(&credentials.host_name),
            client,
            shared,
            publish_order: tokio::sync::Mutex::new(()),
            next_rid: AtomicU64::new(1),
            driver: Mutex::new(Some(driver)),
        };
        Ok(HubSession { connection: Arc::new(connection), events: events_rx })
    }
}

fn username(credentials: &DeviceCredentials, model_id: &str) -> String {
    let mut name = format!("{}/{}/?api-version={API_VERSION}", credentials.host_name, credentials.device_id);
    if !model_id.is_empty() {
        name.push_str("&model-id=");
        name.push_str(&urlencoding::encode(model_id));
    }
    name
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), HubError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success { Ok(()) } else { Err(refusal(ack.code)) };
            }
            Ok(_) => {}
            Err(e) => return Err(connection_error(e)),
        }
    }
}

fn refusal(code: ConnectReturnCode) -> HubError {
    match code {
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => HubError::NotAuthorized,
        ConnectReturnCode::ServiceUnavailable => HubError::ServerUnavailable,
        other => HubError::Other(format!("connection refused: {other:?}")),
    }
}

fn connection_error(err: ConnectionError) -> HubError {
    match err {
        ConnectionError::ConnectionRefused(code) => refusal(code),
        ConnectionError::Io(e) => HubError::Network(e.to_string()),
        ConnectionError::NetworkTimeout => HubError::Timeout,
        other => HubError::from_message(&other.to_string()),
    }
}

// =============================================================================
// DRIVER
// =============================================================================

type Waiter = oneshot::Sender<()>;

#[derive(Default)]
struct Shared {
    closed: AtomicBool,
    /// Publishers waiting for their packet id, in request order.
    queued: Mutex<VecDeque<Waiter>>,
    /// Publishers waiting for a PUBACK, by packet id.
    inflight: Mutex<HashMap<u16, Waiter>>,
    /// Reported-property updates waiting for a twin response, by request id.
    twin: Mutex<HashMap<String, oneshot::Sender<u16>>>,
}

impl Shared {
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with an error.
        self.queued.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.twin.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// What an inbound publish means to the device.
#[derive(Debug, PartialEq)]
enum Inbound {
    TwinResponse { request_id: String, status: u16 },
    Event(HubEvent),
    Ignored,
}

fn parse_inbound(topic: &str, payload: &[u8]) -> Inbound {
    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let status = rest.split('/').next().and_then(|s| s.parse().ok());
        return match (status, query_param(topic, "$rid")) {
            (Some(status), Some(rid)) => Inbound::TwinResponse { request_id: rid.to_owned(), status },
            _ => Inbound::Ignored,
        };
    }
    if topic.starts_with(DESIRED_PREFIX) {
        return match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(desired)) => Inbound::Event(HubEvent::DesiredProperties(desired)),
            _ => Inbound::Ignored,
        };
    }
    if let Some(rest) = topic.strip_prefix(METHOD_PREFIX) {
        let name = rest.split('/').next().unwrap_or_default();
        let Some(rid) = query_param(topic, "$rid") else {
            return Inbound::Ignored;
        };
        let payload = serde_json::from_slice(payload).unwrap_or(Value::Null);
        return Inbound::Event(HubEvent::MethodCall { request_id: rid.to_owned(), name: name.to_owned(), payload });
    }
    if topic.contains("/messages/devicebound/") {
        return Inbound::Event(HubEvent::CloudMessage { payload: payload.to_vec() });
    }
    Inbound::Ignored
}

fn query_param<'a>(topic: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = topic.split_once('?')?;
    query.split('&').find_map(|pair| pair.strip_prefix(key)?.strip_prefix('='))
}

async fn drive(mut eventloop: EventLoop, shared: Arc<Shared>, events: mpsc::Sender<HubEvent>, device_id: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let waiter = shared.queued.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                if let Some(waiter) = waiter {
                    shared.inflight.lock().unwrap_or_else(PoisonError::into_inner).insert(pkid, waiter);
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let waiter = shared.inflight.lock().unwrap_or_else(PoisonError::into_inner).remove(&ack.pkid);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => match parse_inbound(&publish.topic, &publish.payload) {
                Inbound::TwinResponse { request_id, status } => {
                    let waiter = shared.twin.lock().unwrap_or_else(PoisonError::into_inner).remove(&request_id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(status);
                    }
                }
                Inbound::Event(event) => {
                    if events.try_send(event).is_err() {
                        tracing::warn!(%device_id, "device event dropped, listener is behind");
                    }
                }
                Inbound::Ignored => tracing::debug!(%device_id, topic = %publish.topic, "ignoring publish"),
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if !shared.closed.load(Ordering::SeqCst) {
                    tracing::warn!(%device_id, error = %e, "hub connection lost");
                }
                break;
            }
        }
    }
    shared.fail_all();
}

// =============================================================================
// CONNECTION
// =============================================================================

struct MqttConnection {
    device_id: String,
    hub: String,
    client: AsyncClient,
    shared: Arc<Shared>,
    publish_order: tokio::sync::Mutex<()>,
    next_rid: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    /// Publish at QoS 1 and wait for the PUBACK.
    async fn publish_acked(&self, topic: String, payload: Vec<u8>, timeout: Duration) -> Result<(), HubError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HubError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let _order = self.publish_order.lock().await;
            self.shared.queued.lock().unwrap_or_else(PoisonError::into_inner).push_back(tx);
            if let Err(e) = self.client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                self.shared.queued.lock().unwrap_or_else(PoisonError::into_inner).pop_back();
                tracing::debug!(device_id = %self.device_id, error = %e, "publish request rejected");
                return Err(HubError::ConnectionClosed);
            }
        }

        with_timeout(timeout, async { rx.await.map_err(|_| HubError::ConnectionClosed) }).await
    }
}

/// `iothub` system properties appended to the telemetry topic.
fn property_bag(message: &TelemetryMessage) -> String {
    let created = message.creation_time.format(&Rfc3339).unwrap_or_default();
    format!(
        "$.mid={}&$.cid={}&$.ct=application%2Fjson&$.ce=utf-8&iothub-creation-time-utc={}",
        urlencoding::encode(&message.message_id),
        urlencoding::encode(&message.correlation_id),
        urlencoding::encode(&created)
    )
}

#[async_trait]
impl HubConnection for MqttConnection {
    fn hub_name(&self) -> &str {
        &self.hub
    }

    async fn send_event(&self, message: &TelemetryMessage, timeout: Duration) -> Result<(), HubError> {
        let topic = format!("devices/{}/messages/events/{}", self.device_id, property_bag(message));
        self.publish_acked(topic, message.body.clone(), timeout).await
    }

    async fn update_reported(&self, patch: &Map<String, Value>, timeout: Duration) -> Result<(), HubError> {
        let request_id = self.next_rid.fetch_add(1, Ordering::Relaxed).to_string();
        let body = serde_json::to_vec(patch).map_err(|e| HubError::Other(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.twin.lock().unwrap_or_else(PoisonError::into_inner).insert(request_id.clone(), tx);

        let topic = format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}");
        let outcome = with_timeout(timeout, async {
            self.publish_acked(topic, body, Duration::ZERO).await?;
            let status = rx.await.map_err(|_| HubError::ConnectionClosed)?;
            match status {
                200..=299 => Ok(()),
                429 => Err(HubError::Throttled(format!("twin update answered {status}"))),
                _ => Err(HubError::Other(format!("twin update answered {status}"))),
            }
        })
        .await;

        if outcome.is_err() {
            self.shared.twin.lock().unwrap_or_else(PoisonError::into_inner).remove(&request_id);
        }
        outcome
    }

    async fn respond_method(&self, request_id: &str, status: u16, body: &Value) -> Result<(), HubError> {
        let topic = format!("$iothub/methods/res/{status}/?$rid={request_id}");
        let payload = serde_json::to_vec(body).map_err(|e| HubError::Other(e.to_string()))?;
        self.publish_acked(topic, payload, METHOD_RESPONSE_TIMEOUT).await
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(device_id = %self.device_id, error = %e, "disconnect request rejected");
        }

        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.shared.fail_all();
    }
}

#[cfg(test)]
#[path = "mqtt_test.rs"]
mod tests;
