//! Supervisor of strategy instances
//!
//! Creates, starts, stops and deletes instances, restores the ones that were
//! running at the last shutdown and routes manual exits. Instances share
//! nothing but the collaborators in [`InstanceDeps`].

use crate::engine::{InstanceSnapshot, InstanceStatus};
use crate::error::{Result, StrategyError};
use crate::instance::{InstanceDeps, StrategyInstance};
use crate::persistence::SignalQuery;
use config::InstanceConfig;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use strategy_shared::{log_success, LogEmoji};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use types::{InstanceId, Signal};

#[derive(Clone)]
struct InstanceHandle {
    instance: Arc<Mutex<StrategyInstance>>,
    snapshot: Arc<RwLock<InstanceSnapshot>>,
}

impl InstanceHandle {
    fn new(instance: StrategyInstance) -> Self {
        Self {
            snapshot: instance.snapshot_handle(),
            instance: Arc::new(Mutex::new(instance)),
        }
    }
}

pub struct Supervisor {
    deps: InstanceDeps,
    instances: DashMap<InstanceId, InstanceHandle>,
}

impl Supervisor {
    pub fn new(deps: InstanceDeps) -> Self {
        Self {
            deps,
            instances: DashMap::new(),
        }
    }

    pub fn deps(&self) -> &InstanceDeps {
        &self.deps
    }

    /// Register a new instance without starting it
    pub async fn create(&self, config: InstanceConfig) -> Result<InstanceId> {
        config.validate()?;
        let id = InstanceId::generate();
        let instance = StrategyInstance::new(id, config, self.deps.clone());
        self.deps.persistence.save_instance(&instance.record(false)).await?;

        info!(
            "{} Created instance {} for {}",
            LogEmoji::SUCCESS,
            id,
            instance.config().symbol
        );
        self.instances.insert(id, InstanceHandle::new(instance));
        Ok(id)
    }

    pub async fn start(&self, id: InstanceId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut instance = handle.instance.lock().await;
        instance.start().await
    }

    pub async fn stop(&self, id: InstanceId) -> Result<()> {
        let handle = self.handle(id)?;
        let mut instance = handle.instance.lock().await;
        instance.stop().await
    }

    /// Remove a stopped instance that holds no open position
    pub async fn delete(&self, id: InstanceId) -> Result<()> {
        let handle = self.handle(id)?;
        let instance = handle.instance.lock().await;
        if instance.status() == InstanceStatus::Running {
            return Err(StrategyError::InvalidInstanceState {
                id,
                state: "running",
            });
        }
        let open = instance.has_open_position()
            || self.deps.persistence.load_open_position(id).await?.is_some();
        if open {
            return Err(StrategyError::InvalidInstanceState {
                id,
                state: "holding an open position",
            });
        }

        self.deps.persistence.delete_instance(id).await?;
        drop(instance);
        self.instances.remove(&id);
        info!("{} Deleted instance {}", LogEmoji::STOP, id);
        Ok(())
    }

    pub async fn manual_exit(&self, id: InstanceId) -> Result<Signal> {
        let handle = self.handle(id)?;
        let instance = handle.instance.lock().await;
        instance.manual_exit().await
    }

    /// Latest published state; never waits on the worker
    pub fn snapshot(&self, id: InstanceId) -> Result<InstanceSnapshot> {
        Ok(self.handle(id)?.snapshot.read().clone())
    }

    /// Snapshots of every instance, oldest id first
    pub fn list(&self) -> Vec<InstanceSnapshot> {
        let mut snapshots: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .map(|entry| entry.value().snapshot.read().clone())
            .collect();
        snapshots.sort_by_key(|s| s.instance_id);
        snapshots
    }

    /// Signal log of one instance
    pub async fn signals(&self, query: &SignalQuery) -> Result<Vec<Signal>> {
        self.handle(query.instance_id)?;
        Ok(self.deps.persistence.query_signals(query).await?)
    }

    /// Load persisted instances and start the ones marked running
    ///
    /// Returns the number of instances started. A start failure leaves that
    /// instance `failed` and does not abort the restore.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.deps.persistence.load_instances().await?;
        info!("{} Restoring {} persisted instances", LogEmoji::START, records.len());

        let mut started = 0;
        for record in records {
            let id = record.instance_id;
            if self.instances.contains_key(&id) {
                debug!(instance_id = %id, "Instance already loaded");
                continue;
            }
            let running = record.running;
            let handle = InstanceHandle::new(StrategyInstance::from_record(record, self.deps.clone()));
            self.instances.insert(id, handle.clone());

            if running {
                let mut instance = handle.instance.lock().await;
                match instance.start().await {
                    Ok(()) => started += 1,
                    Err(e) => error!(instance_id = %id, error = %e, "Restored instance failed to start"),
                }
            }
        }

        log_success!("Restore complete: {} instances running", started);
        Ok(started)
    }

    /// Stop every running instance, keeping their running flag for the next boot
    pub async fn shutdown(&self) {
        let handles: Vec<(InstanceId, InstanceHandle)> = self
            .instances
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        info!("{} Shutting down {} instances", LogEmoji::STOP, handles.len());
        for (id, handle) in handles {
            let mut instance = handle.instance.lock().await;
            if instance.status() != InstanceStatus::Running && !instance.worker_finished() {
                continue;
            }
            if let Err(e) = instance.halt().await {
                warn!(instance_id = %id, error = %e, "Instance did not stop cleanly");
            }
        }
    }

    fn handle(&self, id: InstanceId) -> Result<InstanceHandle> {
        self.instances
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StrategyError::InstanceNotFound(id))
    }
}
