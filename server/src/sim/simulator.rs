//! Runs one simulation: the device fleet and its telemetry and
//! reported-property pumps.
//!
//! DESIGN
//! ======
//! Devices are split into wave groups so a large fleet does not hit the hub
//! all at once. A pump walks the groups in order, fans a request out to every
//! device in the group (bounded by a concurrency limit), pauses for the group
//! interval, and after the last group pauses for the wave interval before
//! starting over.
//!
//! Stopping flips a `watch` channel. Every pause and every in-flight group
//! races against it, so a stop takes effect without waiting out an interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sqlx::SqlitePool;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::config::SimulationConfig;
use crate::db::StoreError;
use crate::metrics::{DeviceLabels, SimMetrics};
use crate::services::{device_model, simulation, target};
use crate::sim::capability::parse_capability_model;
use crate::sim::device::{ModelContext, SimulatedDevice};
use crate::sim::hub::HubTransport;
use crate::sim::provision::{ProvisionError, Provisioner};
use crate::types::{Simulation, SimulationStatus};

#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("target '{0}' does not exist")]
    MissingTarget(String),
}

/// Shared services a simulator needs besides its configuration.
#[derive(Clone)]
pub struct SimulatorDeps {
    pub pool: SqlitePool,
    pub metrics: Arc<SimMetrics>,
    pub transport: Arc<dyn HubTransport>,
}

/// Split `items` into wave groups.
///
/// With `0 < group_count < len` there are `group_count` groups of
/// `len / group_count` items each, and the last group takes the remainder.
/// Otherwise everything lands in a single group.
#[must_use]
pub fn wave_groups<T: Clone>(items: &[T], group_count: u32) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let total = items.len();
    let groups = usize::try_from(group_count).unwrap_or(usize::MAX);
    if groups == 0 || groups >= total {
        return vec![items.to_vec()];
    }

    let per_wave = total / groups;
    let mut out = vec![Vec::with_capacity(per_wave); groups];
    for (k, item) in items.iter().enumerate() {
        out[(k / per_wave).min(groups - 1)].push(item.clone());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wave {
    Telemetry,
    ReportedProperties,
}

struct Pump {
    wave: Wave,
    groups: Arc<Vec<Vec<Arc<SimulatedDevice>>>>,
    concurrency: usize,
    group_interval: Duration,
    wave_interval: Duration,
    initial_delay: Duration,
}

pub struct Simulator {
    simulation: Simulation,
    devices: Vec<Arc<SimulatedDevice>>,
    labels: Vec<DeviceLabels>,
    pool: SqlitePool,
    metrics: Arc<SimMetrics>,
    disconnect_limit: usize,
    stop: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
}

impl Simulator {
    /// Load the simulation's devices, start the pumps and mark it running.
    ///
    /// Device configs whose model no longer exists are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is missing or a store lookup fails.
    pub async fn start(
        deps: SimulatorDeps,
        mut sim: Simulation,
        config: SimulationConfig,
    ) -> Result<Self, SimulatorError> {
        let pool = deps.pool.clone();
        let target = target::get_target(&pool, &sim.target_id)
            .await?
            .ok_or_else(|| SimulatorError::MissingTarget(sim.target_id.clone()))?;
        let configs = simulation::list_device_configs(&pool, &sim.id).await?;

        let config = Arc::new(config);
        let provisioner = Provisioner::new(
            config.registration_attempt_timeout(),
            config.max_registration_attempts,
            Arc::clone(&deps.metrics),
        )?;
        let registrations = Arc::new(Semaphore::new(config.registration_limit()));

        sim.status = SimulationStatus::Running;
        let mut devices = Vec::new();
        let mut labels = Vec::new();
        for device_config in configs.iter().filter(|c| c.device_count > 0) {
            let Some(model) = device_model::get_device_model(&pool, &device_config.model_id).await? else {
                tracing::warn!(sim_id = %sim.id, model_id = %device_config.model_id, "skipping devices of unknown model");
                continue;
            };

            let model_labels = DeviceLabels::new(&sim.id, &target.id, &model.id);
            deps.metrics.set_simulated(&model_labels, device_config.device_count);
            let ctx = Arc::new(ModelContext {
                pool: pool.clone(),
                simulation: sim.clone(),
                target: target.clone(),
                capability: Arc::new(parse_capability_model(&model)),
                model,
                config: Arc::clone(&config),
                transport: Arc::clone(&deps.transport),
                provisioner: provisioner.clone(),
                registrations: Arc::clone(&registrations),
                metrics: Arc::clone(&deps.metrics),
                labels: model_labels.clone(),
            });
            for n in 1..=device_config.device_count {
                let id = sim.device_id(&ctx.model.id, n);
                devices.push(Arc::new(SimulatedDevice::new(id, Arc::clone(&ctx))));
            }
            labels.push(model_labels);
        }

        let groups = Arc::new(wave_groups(&devices, sim.wave_group_count));
        let group_interval = Duration::from_secs(u64::from(sim.wave_group_interval));
        let (stop, _) = watch::channel(false);
        let mut pumps = Vec::new();

        if config.enable_telemetry {
            let pump = Pump {
                wave: Wave::Telemetry,
                groups: Arc::clone(&groups),
                concurrency: config.connection_limit(),
                group_interval,
                wave_interval: wave_interval(sim.telemetry_interval),
                initial_delay: Duration::ZERO,
            };
            pumps.push(tokio::spawn(run_pump(pump, stop.subscribe())));
        }
        if config.enable_reported_props {
            let pump = Pump {
                wave: Wave::ReportedProperties,
                groups: Arc::clone(&groups),
                concurrency: config.twin_update_limit(),
                group_interval,
                wave_interval: wave_interval(sim.reported_property_interval),
                initial_delay: config.reported_props_start_delay(),
            };
            pumps.push(tokio::spawn(run_pump(pump, stop.subscribe())));
        }

        simulation::set_simulation_status(&pool, &sim.id, SimulationStatus::Running).await?;
        tracing::info!(sim_id = %sim.id, devices = devices.len(), groups = groups.len(), "simulation started");

        Ok(Self {
            simulation: sim,
            devices,
            labels,
            pool,
            metrics: deps.metrics,
            disconnect_limit: config.connection_limit(),
            stop,
            pumps,
        })
    }

    #[must_use]
    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    #[cfg(test)]
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Devices of `model_id` currently connected to a hub.
    #[cfg(test)]
    #[must_use]
    pub fn connected_count(&self, model_id: &str) -> u32 {
        let count = self.devices.iter().filter(|d| d.model_id() == model_id && d.is_connected()).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Connected device counts keyed by model id.
    #[must_use]
    pub fn connected_counts(&self) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for device in self.devices.iter().filter(|d| d.is_connected()) {
            *counts.entry(device.model_id().to_owned()).or_insert(0) += 1;
        }
        counts
    }

    /// Cancel the pumps, disconnect every device and mark the simulation ready.
    ///
    /// # Errors
    ///
    /// Returns a store error if the status update fails. The devices are
    /// disconnected regardless.
    pub async fn stop(self) -> Result<(), StoreError> {
        let id = self.simulation.id.clone();
        let pool = self.pool.clone();
        self.halt().await;
        simulation::transition_status(&pool, &id, SimulationStatus::Running, SimulationStatus::Ready).await?;
        tracing::info!(sim_id = %id, "simulation stopped");
        Ok(())
    }

    /// Cancel the pumps and disconnect every device without touching the
    /// stored status.
    pub async fn discard(self) {
        self.halt().await;
    }

    async fn halt(self) {
        let _ = self.stop.send(true);
        for pump in self.pumps {
            if let Err(e) = pump.await {
                tracing::error!(sim_id = %self.simulation.id, error = %e, "pump task failed");
            }
        }

        futures::stream::iter(&self.devices)
            .for_each_concurrent(self.disconnect_limit, |device| async move { device.disconnect().await })
            .await;
        for labels in &self.labels {
            self.metrics.set_simulated(labels, 0);
        }
    }
}

/// Zero-second intervals would spin; waves are at least a second apart.
fn wave_interval(secs: u32) -> Duration {
    Duration::from_secs(u64::from(secs.max(1)))
}

/// Sleep unless stopped first. Returns false once the simulation is stopping.
async fn pause(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        _ = stop.changed() => false,
    }
}

async fn run_pump(pump: Pump, mut stop: watch::Receiver<bool>) {
    if !pause(pump.initial_delay, &mut stop).await {
        return;
    }

    let kind = pump.wave;
    loop {
        for (index, group) in pump.groups.iter().enumerate() {
            if index > 0 && !pause(pump.group_interval, &mut stop).await {
                return;
            }

            let wave = futures::stream::iter(group).for_each_concurrent(pump.concurrency, |device| async move {
                match kind {
                    Wave::Telemetry => device.send_telemetry().await,
                    Wave::ReportedProperties => device.send_reported_properties().await,
                }
            });
            tokio::select! {
                () = wave => {}
                _ = stop.changed() => return,
            }
            tracing::trace!(wave = ?kind, group = index, devices = group.len(), "wave group done");
        }

        if !pause(pump.wave_interval, &mut stop).await {
            return;
        }
    }
}

#[cfg(test)]
#[path = "simulator_test.rs"]
mod tests;
