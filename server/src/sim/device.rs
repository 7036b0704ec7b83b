//! One simulated device.
//!
//! DESIGN
//! ======
//! A device lazily connects on its first send. Credentials come from the
//! target device cache, or from DPS when the cache has none; fresh
//! registrations are cached so restarts reuse them. Each connection gets a
//! listener task that answers desired-property patches and direct methods.
//!
//! Telemetry and reported-property sends each carry an in-flight flag: a wave
//! that reaches a device still busy with the previous one skips it and counts
//! the skip instead of queueing.
//!
//! ERROR HANDLING
//! ==============
//! Send failures are recorded in metrics and logged, never returned to the
//! pump. Two consecutive telemetry failures make the device drop its cached
//! registration so the next send provisions and connects from scratch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::config::SimulationConfig;
use crate::db::StoreError;
use crate::metrics::{DeviceLabels, SimMetrics};
use crate::services::target;
use crate::sim::capability::CapabilityModel;
use crate::sim::datagen::{DataGenerator, twin_update_ack};
use crate::sim::hub::{ConnectOptions, DeviceCredentials, HubConnection, HubError, HubEvent, HubTransport, with_timeout};
use crate::sim::provision::{ProvisionError, ProvisionRequest, Provisioner};
use crate::types::{DeviceModel, DisconnectBehavior, Simulation, Target, TargetDevice};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("registration slot unavailable")]
    Shutdown,
}

impl DeviceError {
    /// Error class used as the `error` metrics label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hub(e) => e.kind(),
            _ => "error",
        }
    }
}

/// Register a device with DPS and cache its connection string.
///
/// # Errors
///
/// Returns a provisioning error, an unparseable connection string, or a
/// store error from the cache write.
pub async fn provision_and_cache(
    pool: &SqlitePool,
    provisioner: &Provisioner,
    request: &ProvisionRequest<'_>,
) -> Result<DeviceCredentials, DeviceError> {
    let connection_string = provisioner.provision(request).await?;
    let credentials: DeviceCredentials = connection_string.parse()?;
    target::upsert_target_device(
        pool,
        &TargetDevice {
            target_id: request.target.id.clone(),
            device_id: request.device_id.to_owned(),
            connection_string,
        },
    )
    .await?;
    Ok(credentials)
}

// =============================================================================
// MODEL CONTEXT
// =============================================================================

/// Everything the devices of one model in one simulation share.
pub struct ModelContext {
    pub pool: SqlitePool,
    pub simulation: Simulation,
    pub target: Target,
    pub model: DeviceModel,
    pub capability: Arc<CapabilityModel>,
    pub config: Arc<SimulationConfig>,
    pub transport: Arc<dyn HubTransport>,
    pub provisioner: Provisioner,
    /// Bounds concurrent DPS registrations across the whole simulation.
    pub registrations: Arc<Semaphore>,
    pub metrics: Arc<SimMetrics>,
    pub labels: DeviceLabels,
}

impl ModelContext {
    fn connect_options(&self) -> ConnectOptions {
        let acks = self.config.enable_command_acks;
        ConnectOptions {
            timeout: self.config.connection_timeout(),
            model_id: self.model.dtdl_id().to_owned(),
            subscribe_desired: self.config.enable_twin_update_acks,
            subscribe_methods: acks && self.capability.has_sync_commands(),
            subscribe_cloud_messages: acks && self.capability.has_async_commands(),
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

struct Link {
    connection: Arc<dyn HubConnection>,
    listener: JoinHandle<()>,
}

/// Clears an in-flight flag when the send finishes or is cancelled.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) { None } else { Some(Self(flag)) }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SimulatedDevice {
    id: String,
    ctx: Arc<ModelContext>,
    generator: std::sync::Mutex<DataGenerator>,
    link: Mutex<Option<Link>>,
    connected: AtomicBool,
    sending_telemetry: AtomicBool,
    sending_reported: AtomicBool,
    retry_count: AtomicU32,
}

impl SimulatedDevice {
    #[must_use]
    pub fn new(id: String, ctx: Arc<ModelContext>) -> Self {
        let route = Arc::new(ctx.config.geopoint_data.clone());
        let generator = DataGenerator::new(Arc::clone(&ctx.capability), route);
        Self {
            id,
            ctx,
            generator: std::sync::Mutex::new(generator),
            link: Mutex::new(None),
            connected: AtomicBool::new(false),
            sending_telemetry: AtomicBool::new(false),
            sending_reported: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.ctx.model.id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Connect to the hub unless already connected.
    ///
    /// # Errors
    ///
    /// Returns the provisioning or connect error. A fail-over refusal is
    /// retried once against a freshly provisioned hub.
    pub async fn connect(&self) -> Result<Arc<dyn HubConnection>, DeviceError> {
        let mut link = self.link.lock().await;
        if let Some(current) = link.as_ref() {
            if !current.listener.is_finished() {
                return Ok(Arc::clone(&current.connection));
            }
            // The transport closed the event stream: the connection is gone.
            if let Some(stale) = link.take() {
                self.release(stale).await;
            }
        }

        let started = Instant::now();
        let options = self.ctx.connect_options();
        let credentials = self.credentials(false).await?;
        let session = match self.ctx.transport.connect(&credentials, &options).await {
            Ok(session) => session,
            Err(e) if e.is_failover() => {
                tracing::warn!(device_id = %self.id, error = %e, "hub refused device, re-provisioning");
                self.ctx.metrics.failover(&self.ctx.labels);
                let credentials = self.credentials(true).await?;
                self.ctx.transport.connect(&credentials, &options).await?
            }
            Err(e) => return Err(e.into()),
        };

        let connection = session.connection;
        self.ctx.metrics.device_connected(&self.ctx.labels, connection.hub_name(), started.elapsed().as_secs_f64());
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(device_id = %self.id, hub = connection.hub_name(), "device connected");

        let listener = tokio::spawn(listen(
            session.events,
            Arc::clone(&connection),
            Arc::clone(&self.ctx),
            self.id.clone(),
        ));
        *link = Some(Link { connection: Arc::clone(&connection), listener });
        Ok(connection)
    }

    /// Close the hub connection. The cached registration is kept.
    pub async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            self.release(link).await;
        }
    }

    async fn release(&self, link: Link) {
        link.connection.close().await;
        link.listener.abort();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.ctx.metrics.device_disconnected(&self.ctx.labels, link.connection.hub_name());
        }
        tracing::debug!(device_id = %self.id, "device disconnected");
    }

    async fn credentials(&self, fresh: bool) -> Result<DeviceCredentials, DeviceError> {
        let ctx = &self.ctx;
        if !fresh {
            if let Some(cached) = target::get_target_device(&ctx.pool, &ctx.target.id, &self.id).await? {
                return Ok(cached.connection_string.parse::<DeviceCredentials>()?);
            }
        }

        let _slot = ctx.registrations.acquire().await.map_err(|_| DeviceError::Shutdown)?;
        let request =
            ProvisionRequest { device_id: &self.id, target: &ctx.target, model: &ctx.model, labels: &ctx.labels };
        provision_and_cache(&ctx.pool, &ctx.provisioner, &request).await
    }

    /// Send one telemetry batch.
    pub async fn send_telemetry(&self) {
        let Some(_in_flight) = InFlight::enter(&self.sending_telemetry) else {
            tracing::trace!(device_id = %self.id, "telemetry still in flight, skipping");
            self.ctx.metrics.batch_skipped(&self.ctx.labels);
            return;
        };

        if self.retry_count() > 1 {
            self.reset_registration().await;
        }

        match self.send_batch().await {
            Ok(()) => self.retry_count.store(0, Ordering::SeqCst),
            Err(e) => {
                let retries = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(device_id = %self.id, error = %e, retries, "telemetry batch failed");
            }
        }

        if self.ctx.simulation.disconnect_behavior == DisconnectBehavior::Telemetry {
            self.disconnect().await;
        }
    }

    async fn reset_registration(&self) {
        tracing::info!(device_id = %self.id, "repeated failures, dropping cached registration");
        self.disconnect().await;
        if let Err(e) = target::delete_target_device(&self.ctx.pool, &self.ctx.target.id, &self.id).await {
            tracing::warn!(device_id = %self.id, error = %e, "failed to drop cached registration");
        }
        self.ctx.metrics.failover(&self.ctx.labels);
        self.retry_count.store(0, Ordering::SeqCst);
    }

    async fn send_batch(&self) -> Result<(), DeviceError> {
        let connection = self.connect().await?;
        let sim = &self.ctx.simulation;
        let messages = {
            let mut generator = self.generator.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            generator.telemetry_batch(
                &self.id,
                sim.telemetry_format,
                sim.telemetry_batch_size,
                sim.telemetry_interval,
                OffsetDateTime::now_utc(),
            )?
        };

        let timeout = self.ctx.config.telemetry_timeout();
        let started = Instant::now();
        let results = join_all(messages.iter().map(|message| {
            let connection = Arc::clone(&connection);
            async move {
                let sent = Instant::now();
                let result = connection.send_event(message, timeout).await;
                (message, sent.elapsed(), result)
            }
        }))
        .await;

        let labels = &self.ctx.labels;
        let mut failure = None;
        for (message, elapsed, result) in results {
            match result {
                Ok(()) => {
                    self.ctx.metrics.message_sent(labels, elapsed.as_secs_f64(), message.body.len(), message.datapoints);
                }
                Err(e) => {
                    self.ctx.metrics.message_failed(labels, e.kind());
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e.into());
        }
        self.ctx.metrics.batch_sent(labels, started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Send one reported-property patch.
    pub async fn send_reported_properties(&self) {
        let Some(_in_flight) = InFlight::enter(&self.sending_reported) else {
            self.ctx.metrics.reported_skipped(&self.ctx.labels);
            return;
        };

        match self.update_reported().await {
            Ok(elapsed) => self.ctx.metrics.reported_sent(&self.ctx.labels, elapsed.as_secs_f64()),
            Err(e) => {
                tracing::warn!(device_id = %self.id, error = %e, "reported property update failed");
                self.ctx.metrics.reported_failed(&self.ctx.labels, e.kind());
            }
        }
    }

    async fn update_reported(&self) -> Result<Duration, DeviceError> {
        let connection = self.connect().await?;
        let patch = self.generator.lock().unwrap_or_else(std::sync::PoisonError::into_inner).reported_properties();
        let started = Instant::now();
        connection.update_reported(&patch, self.ctx.config.twin_update_timeout()).await?;
        Ok(started.elapsed())
    }
}

// =============================================================================
// LISTENER
// =============================================================================

async fn listen(
    mut events: mpsc::Receiver<HubEvent>,
    connection: Arc<dyn HubConnection>,
    ctx: Arc<ModelContext>,
    device_id: String,
) {
    while let Some(event) = events.recv().await {
        match event {
            HubEvent::DesiredProperties(desired) => {
                if !ctx.config.enable_twin_update_acks {
                    continue;
                }
                let ack = twin_update_ack(&desired);
                let started = Instant::now();
                match connection.update_reported(&ack, ctx.config.twin_update_timeout()).await {
                    Ok(()) => ctx.metrics.twin_update_sent(&ctx.labels, started.elapsed().as_secs_f64()),
                    Err(e) => {
                        tracing::warn!(%device_id, error = %e, "failed to acknowledge desired properties");
                        ctx.metrics.twin_update_failed(&ctx.labels, e.kind());
                    }
                }
            }
            HubEvent::MethodCall { request_id, name, .. } => {
                if !ctx.config.enable_command_acks {
                    continue;
                }
                let empty = json!({});
                let response = connection.respond_method(&request_id, 200, &empty);
                match with_timeout(ctx.config.command_timeout(), response).await {
                    Ok(()) => {
                        tracing::debug!(%device_id, method = %name, "direct method answered");
                        ctx.metrics.command_acked(&ctx.labels);
                    }
                    Err(e) => tracing::warn!(%device_id, method = %name, error = %e, "failed to answer direct method"),
                }
            }
            HubEvent::CloudMessage { payload } => {
                tracing::debug!(%device_id, bytes = payload.len(), "cloud-to-device message received");
            }
        }
    }
}

#[cfg(test)]
#[path = "device_test.rs"]
mod tests;
