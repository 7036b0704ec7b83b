//! Prometheus metrics for provisioning and device simulation.
//!
//! DESIGN
//! ======
//! One `SimMetrics` value owns every collector and is registered on the
//! application's registry at start-up; simulators and the provisioner share
//! it through an `Arc`. Every series is labelled `sim`, `target`, `model`;
//! failure counters add an `error` class and the connection gauge adds the
//! `hub` the device landed on.
//!
//! The registry is exposed on its own listener so scrapes never compete with
//! the admin API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const NAMESPACE: &str = "devsim";
const SIMULATING: &str = "simulating";
const PROVISIONING: &str = "provisioning";
const LATENCY_BUCKETS: [f64; 18] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 240.0, 480.0, 960.0];

const DEVICE_LABELS: [&str; 3] = ["sim", "target", "model"];
const ERROR_LABELS: [&str; 4] = ["sim", "target", "model", "error"];
const HUB_LABELS: [&str; 4] = ["sim", "target", "model", "hub"];

/// Label values shared by every per-device series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLabels {
    pub sim: String,
    pub target: String,
    pub model: String,
}

impl DeviceLabels {
    #[must_use]
    pub fn new(sim: &str, target: &str, model: &str) -> Self {
        Self { sim: sim.to_owned(), target: target.to_owned(), model: model.to_owned() }
    }

    fn values(&self) -> [&str; 3] {
        [&self.sim, &self.target, &self.model]
    }

    fn with<'a>(&'a self, extra: &'a str) -> [&'a str; 4] {
        [&self.sim, &self.target, &self.model, extra]
    }
}

// =============================================================================
// COLLECTORS
// =============================================================================

#[derive(Clone)]
pub struct SimMetrics {
    device_total: IntGaugeVec,
    connect_total: IntGaugeVec,
    connect_total_by_model: IntGaugeVec,
    connect_latency: HistogramVec,
    failover_total: IntCounterVec,
    provision_success: IntCounterVec,
    provision_failure: IntCounterVec,
    provision_latency: HistogramVec,
    batch_success: IntCounterVec,
    batch_skipped: IntCounterVec,
    batch_latency: HistogramVec,
    message_success: IntCounterVec,
    message_failure: IntCounterVec,
    message_latency: HistogramVec,
    sent_bytes: IntCounterVec,
    datapoints_sent: IntCounterVec,
    twin_update_success: IntCounterVec,
    twin_update_failure: IntCounterVec,
    twin_update_latency: HistogramVec,
    reported_skipped: IntCounterVec,
    reported_success: IntCounterVec,
    reported_failure: IntCounterVec,
    reported_latency: HistogramVec,
    commands_success: IntCounterVec,
}

fn opts(subsystem: &str, name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(subsystem)
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    let vec = IntCounterVec::new(opts(SIMULATING, name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntGaugeVec> {
    let vec = IntGaugeVec::new(opts(SIMULATING, name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn histogram(registry: &Registry, subsystem: &str, name: &str, help: &str) -> prometheus::Result<HistogramVec> {
    let hopts = HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
        .buckets(LATENCY_BUCKETS.to_vec());
    let vec = HistogramVec::new(hopts, &DEVICE_LABELS)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl SimMetrics {
    /// Create and register every collector.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector is already registered on `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let provision_counter = |name: &str, help: &str| -> prometheus::Result<IntCounterVec> {
            let vec = IntCounterVec::new(opts(PROVISIONING, name, help), &DEVICE_LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            device_total: gauge(registry, "device_total", "Total number of devices simulated", &DEVICE_LABELS)?,
            connect_total: gauge(registry, "connect_total", "Total number of devices connected", &HUB_LABELS)?,
            connect_total_by_model: gauge(
                registry,
                "connect_total_by_model",
                "Total number of devices connected per model",
                &DEVICE_LABELS,
            )?,
            connect_latency: histogram(registry, SIMULATING, "connect_latency_seconds", "Latency of device connects")?,
            failover_total: counter(registry, "failover_total", "Total devices failed over to a new hub", &DEVICE_LABELS)?,
            provision_success: provision_counter("success_total", "Total devices successfully provisioned")?,
            provision_failure: provision_counter("failure_total", "Total devices failed provisioning")?,
            provision_latency: histogram(registry, PROVISIONING, "latency_seconds", "Latency of provisioning devices")?,
            batch_success: counter(
                registry,
                "telemetry_batches_success_total",
                "Total telemetry batches sent successfully",
                &DEVICE_LABELS,
            )?,
            batch_skipped: counter(
                registry,
                "telemetry_batches_skipped_total",
                "Total telemetry batches skipped",
                &DEVICE_LABELS,
            )?,
            batch_latency: histogram(
                registry,
                SIMULATING,
                "telemetry_batch_send_latency_seconds",
                "Latency of sending a telemetry batch",
            )?,
            message_success: counter(
                registry,
                "telemetry_messages_success_total",
                "Total telemetry messages sent successfully",
                &DEVICE_LABELS,
            )?,
            message_failure: counter(
                registry,
                "telemetry_messages_failure_total",
                "Total telemetry message send failures",
                &ERROR_LABELS,
            )?,
            message_latency: histogram(
                registry,
                SIMULATING,
                "telemetry_message_send_latency_seconds",
                "Latency of sending one telemetry message",
            )?,
            sent_bytes: counter(registry, "telemetry_sent_bytes", "Total telemetry bytes sent", &DEVICE_LABELS)?,
            datapoints_sent: counter(
                registry,
                "telemetry_datapoints_sent_total",
                "Total telemetry data points sent",
                &DEVICE_LABELS,
            )?,
            twin_update_success: counter(
                registry,
                "twin_updates_success_total",
                "Total desired property acks sent successfully",
                &DEVICE_LABELS,
            )?,
            twin_update_failure: counter(
                registry,
                "twin_updates_failure_total",
                "Total desired property ack failures",
                &ERROR_LABELS,
            )?,
            twin_update_latency: histogram(
                registry,
                SIMULATING,
                "twin_update_send_latency_seconds",
                "Latency of sending a desired property ack",
            )?,
            reported_skipped: counter(
                registry,
                "reported_props_skipped_total",
                "Total reported property updates skipped",
                &DEVICE_LABELS,
            )?,
            reported_success: counter(
                registry,
                "reported_props_success_total",
                "Total reported property updates sent successfully",
                &DEVICE_LABELS,
            )?,
            reported_failure: counter(
                registry,
                "reported_props_failure_total",
                "Total reported property update failures",
                &ERROR_LABELS,
            )?,
            reported_latency: histogram(
                registry,
                SIMULATING,
                "reported_props_send_latency_seconds",
                "Latency of sending reported properties",
            )?,
            commands_success: counter(
                registry,
                "commands_success_total",
                "Total commands acknowledged",
                &DEVICE_LABELS,
            )?,
        })
    }

    pub fn set_simulated(&self, labels: &DeviceLabels, count: u32) {
        self.device_total.with_label_values(&labels.values()).set(i64::from(count));
    }

    pub fn device_connected(&self, labels: &DeviceLabels, hub: &str, seconds: f64) {
        self.connect_total.with_label_values(&labels.with(hub)).inc();
        self.connect_total_by_model.with_label_values(&labels.values()).inc();
        self.connect_latency.with_label_values(&labels.values()).observe(seconds);
    }

    pub fn device_disconnected(&self, labels: &DeviceLabels, hub: &str) {
        self.connect_total.with_label_values(&labels.with(hub)).dec();
        self.connect_total_by_model.with_label_values(&labels.values()).dec();
    }

    pub fn failover(&self, labels: &DeviceLabels) {
        self.failover_total.with_label_values(&labels.values()).inc();
    }

    pub fn provision_succeeded(&self, labels: &DeviceLabels, seconds: f64) {
        self.provision_success.with_label_values(&labels.values()).inc();
        self.provision_latency.with_label_values(&labels.values()).observe(seconds);
    }

    pub fn provision_failed(&self, labels: &DeviceLabels) {
        self.provision_failure.with_label_values(&labels.values()).inc();
    }

    pub fn batch_sent(&self, labels: &DeviceLabels, seconds: f64) {
        self.batch_success.with_label_values(&labels.values()).inc();
        self.batch_latency.with_label_values(&labels.values()).observe(seconds);
    }

    pub fn batch_skipped(&self, labels: &DeviceLabels) {
        self.batch_skipped.with_label_values(&labels.values()).inc();
    }

    pub fn message_sent(&self, labels: &DeviceLabels, seconds: f64, bytes: usize, datapoints: usize) {
        let values = labels.values();
        self.message_success.with_label_values(&values).inc();
        self.message_latency.with_label_values(&values).observe(seconds);
        self.sent_bytes.with_label_values(&values).inc_by(u64::try_from(bytes).unwrap_or(u64::MAX));
        self.datapoints_sent.with_label_values(&values).inc_by(u64::try_from(datapoints).unwrap_or(u64::MAX));
    }

    pub fn message_failed(&self, labels: &DeviceLabels, error: &str) {
        self.message_failure.with_label_values(&labels.with(error)).inc();
    }

    pub fn twin_update_sent(&self, labels: &DeviceLabels, seconds: f64) {
        self.twin_update_success.with_label_values(&labels.values()).inc();
        self.twin_update_latency.with_label_values(&labels.values()).observe(seconds);
    }

    pub fn twin_update_failed(&self, labels: &DeviceLabels, error: &str) {
        self.twin_update_failure.with_label_values(&labels.with(error)).inc();
    }

    pub fn reported_skipped(&self, labels: &DeviceLabels) {
        self.reported_skipped.with_label_values(&labels.values()).inc();
    }

    pub fn reported_sent(&self, labels: &DeviceLabels, seconds: f64) {
        self.reported_success.with_label_values(&labels.values()).inc();
        self.reported_latency.with_label_values(&labels.values()).observe(seconds);
    }

    pub fn reported_failed(&self, labels: &DeviceLabels, error: &str) {
        self.reported_failure.with_label_values(&labels.with(error)).inc();
    }

    pub fn command_acked(&self, labels: &DeviceLabels) {
        self.commands_success.with_label_values(&labels.values()).inc();
    }
}

// =============================================================================
// EXPORTER
// =============================================================================

/// Handle to the running `/metrics` listener.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MetricsServer {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and wait for the listener to drain.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "metrics server task failed");
        }
    }
}

/// Serve `registry` as Prometheus text on `addr` under `/metrics`.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn spawn_http_server(registry: Arc<Registry>, addr: SocketAddr) -> std::io::Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    Ok(MetricsServer { addr, shutdown: Some(shutdown_tx), task })
}

async fn metrics_handler(registry: Arc<Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT))], body),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

#[cfg(test)]
#[path = "metrics_test.rs"]
mod tests;
