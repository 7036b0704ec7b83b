//! Simulation controller: running simulators and device provisioning jobs.
//!
//! DESIGN
//! ======
//! The controller is the only place that changes a simulation's status while
//! work is in flight. `reconcile_provisioning` and `delete_simulation` move
//! the record to `provisioning` / `deleting` for their duration and always
//! land it back on `ready` (or remove it), so a failed job never strands a
//! simulation in a transient state. Start-up resets every status to `ready`
//! because no simulator survives a restart.
//!
//! Device ids are `<sim>-<target>-<model>-<n>`; provisioning extends the
//! highest existing `n` upwards and deprovisioning removes from the top.
//!
//! ERROR HANDLING
//! ==============
//! Individual device registrations and deletions are best effort: failures
//! are logged and counted but do not abort the job. Only store failures and
//! state-machine violations surface as `ControllerError`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::config::{GlobalConfig, SimulationConfig};
use crate::db::StoreError;
use crate::metrics::{DeviceLabels, SimMetrics};
use crate::services::central::CentralClient;
use crate::services::{device_model, simulation, target};
use crate::sim::device::provision_and_cache;
use crate::sim::hub::HubTransport;
use crate::sim::provision::{ProvisionError, ProvisionRequest, Provisioner};
use crate::sim::simulator::{Simulator, SimulatorDeps, SimulatorError};
use crate::types::{DeviceModel, MetricsStatus, Simulation, SimulationStatus, SimulationViewDeviceConfig, Target};

const PROGRESS_EVERY: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Simulator(#[from] SimulatorError),
    #[error("simulation '{0}' is already running")]
    AlreadyRunning(String),
    #[error("simulation '{0}' is not running")]
    NotRunning(String),
}

#[derive(Clone)]
pub struct Controller {
    pool: SqlitePool,
    config: Arc<RwLock<GlobalConfig>>,
    metrics: Arc<SimMetrics>,
    central: CentralClient,
    transport: Arc<dyn HubTransport>,
    running: Arc<RwLock<HashMap<String, Simulator>>>,
}

impl Controller {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        config: Arc<RwLock<GlobalConfig>>,
        metrics: Arc<SimMetrics>,
        central: CentralClient,
        transport: Arc<dyn HubTransport>,
    ) -> Self {
        Self { pool, config, metrics, central, transport, running: Arc::new(RwLock::new(HashMap::new())) }
    }

    async fn simulation_config(&self) -> SimulationConfig {
        self.config.read().await.simulation.clone()
    }

    // =========================================================================
    // RUNNING SIMULATIONS
    // =========================================================================

    /// Start a simulator for `sim` with the current simulation settings.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning`, or the simulator's start-up error.
    pub async fn start_simulation(&self, sim: Simulation) -> Result<(), ControllerError> {
        if self.running.read().await.contains_key(&sim.id) {
            return Err(ControllerError::AlreadyRunning(sim.id));
        }

        // Build outside the registry lock; a simulator that lost a race to
        // the same id is stopped again.
        let deps = SimulatorDeps {
            pool: self.pool.clone(),
            metrics: Arc::clone(&self.metrics),
            transport: Arc::clone(&self.transport),
        };
        let id = sim.id.clone();
        let simulator = Simulator::start(deps, sim, self.simulation_config().await).await?;

        let mut running = self.running.write().await;
        if running.contains_key(&id) {
            drop(running);
            simulator.discard().await;
            return Err(ControllerError::AlreadyRunning(id));
        }
        running.insert(id, simulator);
        Ok(())
    }

    /// Stop a running simulator.
    ///
    /// # Errors
    ///
    /// Returns `NotRunning`, or a store error from the status update.
    pub async fn stop_simulation(&self, sim_id: &str) -> Result<(), ControllerError> {
        let simulator = self
            .running
            .write()
            .await
            .remove(sim_id)
            .ok_or_else(|| ControllerError::NotRunning(sim_id.to_owned()))?;
        simulator.stop().await?;
        Ok(())
    }

    /// Stop every running simulator. Used on shutdown.
    pub async fn stop_all(&self) {
        let simulators: Vec<_> = self.running.write().await.drain().collect();
        for (id, simulator) in simulators {
            if let Err(e) = simulator.stop().await {
                tracing::error!(sim_id = %id, error = %e, "failed to stop simulation");
            }
        }
    }

    #[cfg(test)]
    pub async fn is_running(&self, sim_id: &str) -> bool {
        self.running.read().await.contains_key(sim_id)
    }

    /// Connected device counts by model id for a running simulation.
    pub async fn connected_counts(&self, sim_id: &str) -> HashMap<String, u32> {
        self.running.read().await.get(sim_id).map(Simulator::connected_counts).unwrap_or_default()
    }

    /// Mark every stored simulation `ready`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the update fails.
    pub async fn reset_simulation_status(&self) -> Result<u64, ControllerError> {
        let reset = simulation::reset_all_to_ready(&self.pool).await?;
        tracing::info!(simulations = reset, "simulation statuses reset to ready");
        Ok(reset)
    }

    /// Whether Grafana and Prometheus answer on their configured local ports.
    pub async fn metrics_status(&self) -> MetricsStatus {
        let (grafana, prometheus) = {
            let config = self.config.read().await;
            (config.http.grafana_port, config.http.prometheus_port)
        };
        let grafana_url = format!("http://localhost:{grafana}");
        let prometheus_url = format!("http://localhost:{prometheus}");
        let (grafana_server, prometheus_server) =
            tokio::join!(self.central.probe(&grafana_url), self.central.probe(&prometheus_url));
        MetricsStatus { grafana_server, prometheus_server }
    }

    // =========================================================================
    // PROVISIONING
    // =========================================================================

    /// Register devices `max_id + 1 ..= max_id + count` and cache their
    /// connection strings. Returns how many succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error only if the DPS client cannot be built.
    pub async fn provision_devices(
        &self,
        sim: &Simulation,
        target: &Target,
        model: &DeviceModel,
        max_id: u32,
        count: u32,
    ) -> Result<u32, ControllerError> {
        let config = self.simulation_config().await;
        let provisioner = Provisioner::new(
            config.registration_attempt_timeout(),
            config.max_registration_attempts,
            Arc::clone(&self.metrics),
        )?;
        let labels = DeviceLabels::new(&sim.id, &target.id, &model.id);
        let first = max_id.saturating_add(1);
        let last = max_id.saturating_add(count);

        let mut jobs = futures::stream::iter(first..=last)
            .map(|index| {
                let device_id = sim.device_id(&model.id, index);
                let provisioner = &provisioner;
                let labels = &labels;
                async move {
                    let request = ProvisionRequest { device_id: &device_id, target, model, labels };
                    provision_and_cache(&self.pool, provisioner, &request).await.is_ok()
                }
            })
            .buffer_unordered(config.registration_limit());

        let (mut completed, mut provisioned) = (0_u32, 0_u32);
        while let Some(ok) = jobs.next().await {
            completed += 1;
            provisioned += u32::from(ok);
            if completed % PROGRESS_EVERY == 0 {
                tracing::info!(sim_id = %sim.id, model_id = %model.id, completed, total = count, "provisioning progress");
            }
        }

        tracing::info!(sim_id = %sim.id, model_id = %model.id, provisioned, requested = count, "provisioning finished");
        Ok(provisioned)
    }

    /// Deprovision devices `max_id`, `max_id - 1`, ... (`count` of them) from
    /// the application and the cache. Returns how many left the cache.
    pub async fn delete_devices(
        &self,
        sim: &Simulation,
        target: &Target,
        model_id: &str,
        max_id: u32,
        count: u32,
    ) -> u32 {
        let lowest = max_id.saturating_sub(count).saturating_add(1).max(1);
        let device_ids: Vec<String> = (lowest..=max_id).rev().map(|n| sim.device_id(model_id, n)).collect();
        self.deprovision(target, device_ids).await
    }

    /// Deprovision every cached device of the simulation.
    ///
    /// # Errors
    ///
    /// Returns a store error if the cache cannot be listed.
    pub async fn delete_all_devices(&self, sim: &Simulation, target: &Target) -> Result<u32, ControllerError> {
        let prefix = format!("{}-{}-", sim.id, target.id);
        let cached = target::list_target_devices_with_prefix(&self.pool, &target.id, &prefix).await?;
        let device_ids = cached.into_iter().map(|d| d.device_id).collect();
        Ok(self.deprovision(target, device_ids).await)
    }

    async fn deprovision(&self, target: &Target, device_ids: Vec<String>) -> u32 {
        let limit = self.simulation_config().await.delete_limit();
        let removed = futures::stream::iter(device_ids)
            .map(|device_id| async move {
                if let Err(e) = self.central.delete_device(target, &device_id).await {
                    tracing::debug!(%device_id, error = %e, "application did not delete device");
                }
                match target::delete_target_device(&self.pool, &target.id, &device_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(%device_id, error = %e, "failed to drop cached device");
                        false
                    }
                }
            })
            .buffer_unordered(limit)
            .fold(0_u32, |acc, ok| async move { acc + u32::from(ok) })
            .await;
        tracing::info!(target_id = %target.id, removed, "devices deprovisioned");
        removed
    }

    /// Indices `n` of the cached devices of one model in a simulation.
    ///
    /// # Errors
    ///
    /// Returns a store error if the cache cannot be listed.
    pub async fn existing_device_indices(&self, sim: &Simulation, model_id: &str) -> Result<Vec<u32>, ControllerError> {
        let prefix = sim.device_prefix(model_id);
        let cached = target::list_target_devices_with_prefix(&self.pool, &sim.target_id, &prefix).await?;
        Ok(device_indices(&prefix, cached.iter().map(|d| d.device_id.as_str())))
    }

    /// Bring each model's provisioned device count to the requested
    /// `provisionedCount`. The caller moves the simulation to
    /// `provisioning`; it goes back to `ready` afterwards, also on failure.
    ///
    /// # Errors
    ///
    /// Returns the first store or provisioning error.
    pub async fn reconcile_provisioning(
        &self,
        sim: &Simulation,
        target: &Target,
        requested: &[SimulationViewDeviceConfig],
    ) -> Result<(), ControllerError> {
        let result = self.reconcile(sim, target, requested).await;
        if let Err(e) = &result {
            tracing::error!(sim_id = %sim.id, error = %e, "provisioning failed");
        }
        simulation::transition_status(&self.pool, &sim.id, SimulationStatus::Provisioning, SimulationStatus::Ready)
            .await?;
        result
    }

    async fn reconcile(
        &self,
        sim: &Simulation,
        target: &Target,
        requested: &[SimulationViewDeviceConfig],
    ) -> Result<(), ControllerError> {
        for wanted in requested {
            let Some(model) = device_model::get_device_model(&self.pool, &wanted.model_id).await? else {
                tracing::warn!(sim_id = %sim.id, model_id = %wanted.model_id, "skipping unknown model");
                continue;
            };

            let indices = self.existing_device_indices(sim, &model.id).await?;
            let existing = u32::try_from(indices.len()).unwrap_or(u32::MAX);
            let max_id = indices.iter().copied().max().unwrap_or(0);

            if wanted.provisioned_count > existing {
                let missing = wanted.provisioned_count - existing;
                tracing::info!(sim_id = %sim.id, model_id = %model.id, missing, "provisioning devices");
                self.provision_devices(sim, target, &model, max_id, missing).await?;
            } else if wanted.provisioned_count < existing {
                let excess = existing - wanted.provisioned_count;
                tracing::info!(sim_id = %sim.id, model_id = %model.id, excess, "deprovisioning devices");
                self.delete_devices(sim, target, &model.id, max_id, excess).await;
            }
        }
        Ok(())
    }

    /// Deprovision the simulation's devices and delete it with its device
    /// configs. The caller moves the simulation to `deleting`; on failure it
    /// goes back to `ready`.
    ///
    /// # Errors
    ///
    /// Returns the store error that stopped the deletion.
    pub async fn delete_simulation(&self, sim: &Simulation, target: Option<&Target>) -> Result<(), ControllerError> {
        let result = async {
            if let Some(target) = target {
                self.delete_all_devices(sim, target).await?;
            }
            simulation::delete_simulation(&self.pool, &sim.id).await?;
            Ok::<_, ControllerError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(sim_id = %sim.id, "simulation deleted");
                Ok(())
            }
            Err(e) => {
                tracing::error!(sim_id = %sim.id, error = %e, "simulation delete failed");
                simulation::transition_status(&self.pool, &sim.id, SimulationStatus::Deleting, SimulationStatus::Ready)
                    .await?;
                Err(e)
            }
        }
    }
}

/// Parse the numeric suffix of every id that carries `prefix`.
fn device_indices<'a>(prefix: &str, device_ids: impl Iterator<Item = &'a str>) -> Vec<u32> {
    device_ids.filter_map(|id| id.strip_prefix(prefix)?.parse().ok()).collect()
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
