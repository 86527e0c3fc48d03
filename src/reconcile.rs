//! Reconciler.
//!
//! On boot and on a 30 s timer, replays the runtime truth into the state
//! store: running `MIND_MODEL_*` containers are adopted as `running`
//! records, and records that claim a container which no longer exists are
//! evicted. Models with an operation in flight (per-`abbr` lock held) are
//! left alone. The router file is regenerated once per pass that changed
//! anything.

use crate::deploy::Deployer;
use crate::error::OrchestratorError;
use crate::types::{
    DeploySpec, MODEL_CONTAINER_PREFIX, ModelRecord, ModelStatus, now_ms,
};
use metrics::{counter, gauge};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Reconciler {
    deployer: Deployer,
}

impl Reconciler {
    pub fn new(deployer: Deployer) -> Self {
        Self { deployer }
    }

    /// Is a lifecycle operation currently holding this model's lock?
    fn operation_in_flight(&self, abbr: &str) -> bool {
        match self.deployer.locks().get(abbr) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// One reconciliation pass. Returns true when state changed.
    pub async fn run_once(&self) -> Result<bool, OrchestratorError> {
        let store = self.deployer.store();
        let runtime = self.deployer.runtime();
        let catalog = self.deployer.catalog();

        let containers = runtime.list(MODEL_CONTAINER_PREFIX).await?;
        let mut changed = false;
        let mut running: HashSet<String> = HashSet::new();

        for container in containers.iter().filter(|c| c.running) {
            let abbr = container
                .name
                .trim_start_matches(MODEL_CONTAINER_PREFIX)
                .to_string();
            running.insert(abbr.clone());

            if self.operation_in_flight(&abbr) {
                debug!(model = %abbr, "Operation in flight, skipping");
                continue;
            }

            match store.get_model(&abbr).await? {
                Some(record) => {
                    if record.status != ModelStatus::Running {
                        info!(model = %abbr, was = %record.status, "Adopting running container");
                        store
                            .update_model(
                                &abbr,
                                &[
                                    (
                                        "status".to_string(),
                                        ModelStatus::Running.as_str().to_string(),
                                    ),
                                    ("progress".to_string(), "100".to_string()),
                                    (
                                        "progress_message".to_string(),
                                        "Model ready".to_string(),
                                    ),
                                    ("container_id".to_string(), container.id.clone()),
                                    ("updated_at".to_string(), now_ms().to_string()),
                                ],
                            )
                            .await?;
                        changed = true;
                    }
                }
                None => {
                    // A record is only created when the catalog can supply
                    // the model's type; anything else stays unmanaged until
                    // the catalog is updated.
                    let Some(entry) = catalog.get(&abbr) else {
                        warn!(
                            model = %abbr,
                            container = %container.name,
                            "Running container has no catalog entry; not reconciling"
                        );
                        continue;
                    };

                    let gpu_device = container
                        .env_var("CUDA_VISIBLE_DEVICES")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    let name = container
                        .arg_value("--model")
                        .unwrap_or(&entry.name)
                        .to_string();

                    let resolved = catalog.resolve(&DeploySpec {
                        name: name.clone(),
                        abbr: abbr.clone(),
                        model_type: entry.model_type,
                        quantization: None,
                        max_model_len: None,
                        gpu_memory_utilization: None,
                        max_num_seqs: None,
                        gpu_device: Some(gpu_device),
                        port: None,
                    });

                    let now = now_ms();
                    let record = ModelRecord {
                        abbr: abbr.clone(),
                        name,
                        model_type: resolved.model_type,
                        quantization: resolved.quantization,
                        max_model_len: resolved.max_model_len,
                        gpu_memory_utilization: resolved.gpu_memory_utilization,
                        max_num_seqs: resolved.max_num_seqs,
                        gpu_device,
                        port: container
                            .arg_value("--port")
                            .and_then(|p| p.parse().ok())
                            .unwrap_or(8000),
                        endpoint: ModelRecord::endpoint_for(&abbr),
                        status: ModelStatus::Running,
                        progress: 100,
                        progress_message: "Model ready".to_string(),
                        container_name: container.name.clone(),
                        container_id: container.id.clone(),
                        cache_size_mb: None,
                        cached: None,
                        created_at: now,
                        updated_at: now,
                    };

                    info!(model = %abbr, gpu = gpu_device, "Recovered record from running container");
                    store.put_model(&record).await?;
                    store.set_gpu_assignment(&abbr, gpu_device).await?;
                    changed = true;
                }
            }
        }

        // Evict records whose container disappeared out from under them.
        for record in store.list_models().await? {
            let scheduled = matches!(
                record.status,
                ModelStatus::Running | ModelStatus::Deploying
            );
            if !scheduled || running.contains(&record.abbr) {
                continue;
            }
            if self.operation_in_flight(&record.abbr) {
                continue;
            }

            warn!(
                model = %record.abbr,
                status = %record.status,
                "Container gone, evicting orphaned record"
            );
            store.delete_model(&record.abbr).await?;
            counter!("mindmux_reconcile_evictions_total").increment(1);
            changed = true;
        }

        let running_count = store
            .list_models()
            .await?
            .iter()
            .filter(|r| r.status == ModelStatus::Running)
            .count();
        gauge!("mindmux_running_models").set(running_count as f64);

        if changed {
            self.deployer.router().regenerate().await?;
        }

        Ok(changed)
    }

    /// Spawn the periodic reconciliation task.
    pub fn spawn_loop(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                counter!("mindmux_reconcile_runs_total").increment(1);
                match reconciler.run_once().await {
                    Ok(true) => debug!("Reconciliation applied changes"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Reconciliation failed"),
                }
            }
        })
    }
}
