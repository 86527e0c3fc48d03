//! Deployment engine.
//!
//! Implements the model lifecycle state machine:
//!
//! ```text
//! absent → stopped → deploying → running → stopping → stopped
//!                        │           │
//!                        └──► error ◄┘
//! ```
//!
//! All mutation happens under a per-`abbr` mutex; a second operation on the
//! same model returns `Conflict` instead of queueing. A per-GPU semaphore
//! limits concurrent deploys to one per device. Progress milestones are
//! advisory and published to the state store as the deploy advances.

use crate::config::{Catalog, Settings, engine_args};
use crate::error::OrchestratorError;
use crate::gpu::GpuInspector;
use crate::nginx::RouterGenerator;
use crate::runtime::{ContainerRuntime, ContainerSpec, ReadyState, RuntimeError};
use crate::store::StateStore;
use crate::types::{
    DeploySpec, ModelRecord, ModelStatus, is_valid_abbr, now_ms,
};
use dashmap::DashMap;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{info, warn};

/// Per-`abbr` operation locks, shared with the reconciler so it never
/// evicts a record that has an operation in flight.
pub type AbbrLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Spawn attempts for transient container-runtime failures.
const SPAWN_ATTEMPTS: u32 = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Graceful stop window before the runtime force-kills.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Readiness poll backoff bounds.
const PROBE_DELAY_INITIAL: Duration = Duration::from_millis(500);
const PROBE_DELAY_MAX: Duration = Duration::from_secs(5);

/// Failure modes of the background deploy task. `Demoted` means the record
/// and container were already put into their terminal state (the
/// reload-failure path stops but keeps the container); `Failed` still needs
/// the generic stop-and-remove cleanup.
enum DeployError {
    Demoted(OrchestratorError),
    Failed(OrchestratorError),
}

impl From<OrchestratorError> for DeployError {
    fn from(err: OrchestratorError) -> Self {
        DeployError::Failed(err)
    }
}

impl From<crate::store::StoreError> for DeployError {
    fn from(err: crate::store::StoreError) -> Self {
        DeployError::Failed(err.into())
    }
}

/// Clip an error message to the record's progress_message budget.
fn clip(message: &str) -> String {
    const LIMIT: usize = 200;
    if message.len() <= LIMIT {
        message.to_string()
    } else {
        let mut end = LIMIT;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message[..end].to_string()
    }
}

struct Inner {
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    gpu: GpuInspector,
    router: Arc<RouterGenerator>,
    locks: AbbrLocks,
    gpu_slots: DashMap<u32, Arc<Semaphore>>,
}

/// Orchestrates container supervisor, GPU inspector, router generator, and
/// state store into the lifecycle operations behind the admin API.
#[derive(Clone)]
pub struct Deployer {
    inner: Arc<Inner>,
}

impl Deployer {
    pub fn new(
        settings: Arc<Settings>,
        catalog: Arc<Catalog>,
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        gpu: GpuInspector,
        router: Arc<RouterGenerator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                catalog,
                store,
                runtime,
                gpu,
                router,
                locks: Arc::new(DashMap::new()),
                gpu_slots: DashMap::new(),
            }),
        }
    }

    pub(crate) fn store(&self) -> Arc<dyn StateStore> {
        self.inner.store.clone()
    }

    pub(crate) fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.inner.runtime.clone()
    }

    pub(crate) fn router(&self) -> Arc<RouterGenerator> {
        self.inner.router.clone()
    }

    pub(crate) fn catalog(&self) -> Arc<Catalog> {
        self.inner.catalog.clone()
    }

    pub(crate) fn locks(&self) -> AbbrLocks {
        self.inner.locks.clone()
    }

    fn lock_for(&self, abbr: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(abbr.to_string())
            .or_default()
            .clone()
    }

    /// Acquire the per-`abbr` lock without waiting. A held lock means
    /// another lifecycle operation is in flight.
    fn try_lock(&self, abbr: &str) -> Result<OwnedMutexGuard<()>, OrchestratorError> {
        self.lock_for(abbr).try_lock_owned().map_err(|_| {
            OrchestratorError::Conflict(format!(
                "another operation on model {} is in flight",
                abbr
            ))
        })
    }

    /// One deploy per GPU at a time.
    fn try_gpu_slot(
        &self,
        gpu_device: u32,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, OrchestratorError> {
        let slot = self
            .inner
            .gpu_slots
            .entry(gpu_device)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        slot.try_acquire_owned().map_err(|_| {
            OrchestratorError::ResourceExhausted(format!(
                "a deploy is already in progress on GPU {}",
                gpu_device
            ))
        })
    }

    /// Regenerate the reverse-proxy include file outside a lifecycle event
    /// (startup, manual resync).
    pub async fn refresh_router(&self) -> Result<(), OrchestratorError> {
        self.inner.router.regenerate().await
    }

    /// Snapshot read of a single record.
    pub async fn get(&self, abbr: &str) -> Result<Option<ModelRecord>, OrchestratorError> {
        Ok(self.inner.store.get_model(abbr).await?)
    }

    /// Snapshot read of all records, sorted by `abbr`.
    pub async fn get_all(&self) -> Result<Vec<ModelRecord>, OrchestratorError> {
        Ok(self.inner.store.list_models().await?)
    }

    /// Deploy a model: create its record if absent and drive
    /// stopped → deploying → running in the background.
    ///
    /// Returns the record in `deploying` state; progress is observable via
    /// `GET /orchestrator/models`.
    pub async fn deploy(&self, spec: DeploySpec) -> Result<ModelRecord, OrchestratorError> {
        validate_spec(&spec)?;
        if self.inner.catalog.get(&spec.abbr).is_none() {
            return Err(OrchestratorError::field(
                "abbr",
                format!(
                    "unknown model '{}'; add it to the predefined catalog first",
                    spec.abbr
                ),
            ));
        }

        let guard = self.try_lock(&spec.abbr)?;

        let existing = self.inner.store.get_model(&spec.abbr).await?;
        if let Some(ref record) = existing {
            if record.status.is_scheduled() {
                return Err(OrchestratorError::Conflict(format!(
                    "model {} is already {}",
                    spec.abbr, record.status
                )));
            }
        }

        let resolved = self.inner.catalog.resolve(&spec);

        let records = self.inner.store.list_models().await?;
        let gpu_device = spec
            .gpu_device
            .unwrap_or_else(|| self.inner.gpu.select_gpu(&records));
        self.check_placement(gpu_device, resolved.recommended_vram_mb)?;
        let permit = self.try_gpu_slot(gpu_device)?;

        let now = now_ms();
        let record = ModelRecord {
            abbr: spec.abbr.clone(),
            name: spec.name.clone(),
            model_type: resolved.model_type,
            quantization: resolved.quantization,
            max_model_len: resolved.max_model_len,
            gpu_memory_utilization: resolved.gpu_memory_utilization,
            max_num_seqs: resolved.max_num_seqs,
            gpu_device,
            port: spec.port.unwrap_or(self.inner.settings.engine_port),
            endpoint: ModelRecord::endpoint_for(&spec.abbr),
            status: ModelStatus::Deploying,
            progress: 0,
            progress_message: "Initializing deployment...".to_string(),
            container_name: ModelRecord::container_name_for(&spec.abbr),
            container_id: String::new(),
            cache_size_mb: None,
            cached: None,
            created_at: existing.map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        self.inner.store.put_model(&record).await?;
        self.inner
            .store
            .set_gpu_assignment(&record.abbr, gpu_device)
            .await?;

        let engine = self.clone();
        let task_record = record.clone();
        tokio::spawn(async move {
            engine.run_deploy(task_record, guard, permit).await;
        });

        Ok(record)
    }

    /// Re-deploy an existing stopped record: stopped → deploying → running.
    pub async fn start(&self, abbr: &str) -> Result<ModelRecord, OrchestratorError> {
        let guard = self.try_lock(abbr)?;

        let mut record = self
            .inner
            .store
            .get_model(abbr)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("model {}", abbr)))?;

        if record.status.is_scheduled() {
            return Err(OrchestratorError::Conflict(format!(
                "model {} is already {}",
                abbr, record.status
            )));
        }

        let vram = self
            .inner
            .catalog
            .get(abbr)
            .and_then(|entry| entry.recommended_vram_mb);
        self.check_placement(record.gpu_device, vram)?;
        let permit = self.try_gpu_slot(record.gpu_device)?;

        record.status = ModelStatus::Deploying;
        record.progress = 0;
        record.progress_message = "Restarting model...".to_string();
        record.container_id = String::new();
        record.updated_at = now_ms();
        self.inner.store.put_model(&record).await?;

        let engine = self.clone();
        let task_record = record.clone();
        tokio::spawn(async move {
            engine.run_deploy(task_record, guard, permit).await;
        });

        Ok(record)
    }

    /// Stop a running model: running → stopping → stopped. Idempotent when
    /// already stopped. The container is kept for a later `start`.
    pub async fn stop(&self, abbr: &str) -> Result<ModelRecord, OrchestratorError> {
        let _guard = self.try_lock(abbr)?;

        let mut record = self
            .inner
            .store
            .get_model(abbr)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("model {}", abbr)))?;

        if record.status == ModelStatus::Stopped {
            return Ok(record);
        }

        let previous = record.status;
        self.publish_status(abbr, ModelStatus::Stopping, None, Some("Stopping..."))
            .await;

        match self.inner.runtime.stop(&record.container_name, STOP_TIMEOUT).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                // Leave the record in its previous state so the operator can
                // retry; the container is still up.
                self.publish_status(abbr, previous, None, None).await;
                return Err(e.into());
            }
        }

        record.status = ModelStatus::Stopped;
        record.progress = 0;
        record.progress_message = "Stopped".to_string();
        record.updated_at = now_ms();
        self.inner.store.put_model(&record).await?;

        if let Err(e) = self.inner.router.regenerate().await {
            warn!(model = %abbr, error = %e, "Router regeneration failed after stop");
        }

        info!(model = %abbr, "Model stopped");
        Ok(record)
    }

    /// Delete a model: stop and remove its container, then drop the record.
    pub async fn delete(&self, abbr: &str) -> Result<(), OrchestratorError> {
        let _guard = self.try_lock(abbr)?;

        let record = self
            .inner
            .store
            .get_model(abbr)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("model {}", abbr)))?;

        if record.status == ModelStatus::Running {
            self.publish_status(abbr, ModelStatus::Stopping, None, Some("Stopping..."))
                .await;
        }
        if let Err(e) = self
            .inner
            .runtime
            .stop(&record.container_name, STOP_TIMEOUT)
            .await
        {
            if !matches!(e, RuntimeError::NotFound(_)) {
                warn!(model = %abbr, error = %e, "Failed to stop container during delete");
            }
        }
        if let Err(e) = self.inner.runtime.remove(&record.container_name).await {
            if !matches!(e, RuntimeError::NotFound(_)) {
                warn!(model = %abbr, error = %e, "Failed to remove container during delete");
            }
        }

        self.inner.store.delete_model(abbr).await?;

        if let Err(e) = self.inner.router.regenerate().await {
            warn!(model = %abbr, error = %e, "Router regeneration failed after delete");
        }

        info!(model = %abbr, "Model deleted");
        Ok(())
    }

    /// Placement check against the latest GPU sample. With a degraded
    /// sample there is nothing to check against; the deploy proceeds on
    /// the single logical GPU.
    fn check_placement(
        &self,
        gpu_device: u32,
        required_vram_mb: Option<u64>,
    ) -> Result<(), OrchestratorError> {
        let snapshot = self.inner.gpu.snapshot();
        if snapshot.degraded {
            warn!(
                gpu = gpu_device,
                "GPU sample unavailable; skipping placement check"
            );
            return Ok(());
        }

        let sample = snapshot
            .gpus
            .iter()
            .find(|gpu| gpu.index == gpu_device)
            .ok_or_else(|| {
                OrchestratorError::ResourceExhausted(format!("GPU {} does not exist", gpu_device))
            })?;

        match required_vram_mb {
            Some(required) if sample.memory_free_mb < required as f64 => {
                Err(OrchestratorError::ResourceExhausted(format!(
                    "GPU {} has {:.0} MB free, {} MB required",
                    gpu_device, sample.memory_free_mb, required
                )))
            }
            Some(_) => Ok(()),
            None => {
                warn!(
                    gpu = gpu_device,
                    "No VRAM estimate for this model; skipping memory check"
                );
                Ok(())
            }
        }
    }

    /// Background half of deploy/start. Holds the per-`abbr` lock and the
    /// GPU slot for the whole transition.
    async fn run_deploy(
        &self,
        record: ModelRecord,
        _guard: OwnedMutexGuard<()>,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let abbr = record.abbr.clone();
        let started = Instant::now();
        counter!("mindmux_deploys_total").increment(1);

        match self.execute_deploy(&record).await {
            Ok(()) => {
                histogram!("mindmux_deploy_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    model = %abbr,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Model deployed"
                );
            }
            Err(DeployError::Demoted(e)) => {
                counter!("mindmux_deploy_failures_total").increment(1);
                warn!(model = %abbr, error = %e, "Deploy demoted after readiness");
            }
            Err(DeployError::Failed(e)) => {
                counter!("mindmux_deploy_failures_total").increment(1);
                warn!(model = %abbr, error = %e, "Deploy failed");

                // Best-effort cleanup; the record stays in `error` for
                // diagnosis until the operator deletes it.
                if let Err(stop_err) = self
                    .inner
                    .runtime
                    .stop(&record.container_name, Duration::from_secs(5))
                    .await
                {
                    if !matches!(stop_err, RuntimeError::NotFound(_)) {
                        warn!(model = %abbr, error = %stop_err, "Cleanup stop failed");
                    }
                }
                let _ = self.inner.runtime.remove(&record.container_name).await;

                self.publish_status(
                    &abbr,
                    ModelStatus::Error,
                    Some(0),
                    Some(&clip(&format!("Deployment failed: {}", e))),
                )
                .await;
            }
        }
    }

    async fn execute_deploy(&self, record: &ModelRecord) -> Result<(), DeployError> {
        let abbr = &record.abbr;
        let name = &record.container_name;

        self.publish_progress(abbr, 5, "GPU reserved").await;

        // A stale container from a previous episode blocks name reuse.
        if let Err(e) = self.inner.runtime.remove(name).await {
            if !matches!(e, RuntimeError::NotFound(_)) {
                warn!(model = %abbr, error = %e, "Failed to remove stale container");
            }
        }

        self.publish_progress(abbr, 10, "Preparing image...").await;

        let spec = self.container_spec(record);
        let container_id = self.spawn_with_retry(abbr, &spec).await?;

        self.publish_progress(abbr, 30, "Container created").await;
        self.inner
            .store
            .update_model(
                abbr,
                &[
                    ("container_id".to_string(), container_id.clone()),
                    ("updated_at".to_string(), now_ms().to_string()),
                ],
            )
            .await
            .ok();
        self.publish_progress(abbr, 50, "Container started, loading model...")
            .await;

        self.wait_ready(record).await?;

        self.publish_progress(abbr, 90, "Model registered").await;
        self.inner
            .store
            .update_model(
                abbr,
                &[
                    ("status".to_string(), ModelStatus::Running.as_str().to_string()),
                    ("progress".to_string(), "100".to_string()),
                    ("progress_message".to_string(), "Model ready".to_string()),
                    ("updated_at".to_string(), now_ms().to_string()),
                ],
            )
            .await?;

        // A model only counts as running if it is reachable through the
        // proxy; a failed reload demotes it. The container is stopped but
        // kept, so the operator can inspect and `start` again.
        if let Err(e) = self.inner.router.regenerate_strict().await {
            self.publish_status(abbr, ModelStatus::Error, Some(0), Some("proxy reload failed"))
                .await;
            if let Err(stop_err) = self.inner.runtime.stop(name, STOP_TIMEOUT).await {
                warn!(model = %abbr, error = %stop_err, "Failed to stop container after reload failure");
            }
            return Err(DeployError::Demoted(e));
        }

        Ok(())
    }

    /// Create and start the container, retrying transient runtime failures.
    async fn spawn_with_retry(
        &self,
        abbr: &str,
        spec: &ContainerSpec,
    ) -> Result<String, OrchestratorError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.runtime.spawn(spec).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt < SPAWN_ATTEMPTS => {
                    warn!(
                        model = %abbr,
                        attempt,
                        error = %e,
                        "Transient spawn failure, retrying"
                    );
                    let _ = self.inner.runtime.remove(&spec.name).await;
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll the engine with exponential backoff until it registers the
    /// model, the container dies, or the deploy deadline passes.
    async fn wait_ready(&self, record: &ModelRecord) -> Result<(), OrchestratorError> {
        let abbr = &record.abbr;
        let name = &record.container_name;
        let deadline = Instant::now() + Duration::from_secs(self.inner.settings.deploy_timeout_secs);
        let mut delay = PROBE_DELAY_INITIAL;
        let mut reachable = false;

        loop {
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Upstream(
                    "timed out waiting for model to load".to_string(),
                ));
            }

            match self.inner.runtime.inspect(name).await {
                Ok(Some(info)) if !info.running => {
                    let logs = self
                        .inner
                        .runtime
                        .logs(name, 50)
                        .await
                        .unwrap_or_default();
                    warn!(model = %abbr, "Container stopped unexpectedly:\n{}", logs);
                    return Err(OrchestratorError::Upstream(
                        "container stopped unexpectedly during startup".to_string(),
                    ));
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(OrchestratorError::Upstream(
                        "container disappeared during startup".to_string(),
                    ));
                }
                Err(e) => {
                    warn!(model = %abbr, error = %e, "Container inspect failed, retrying");
                }
            }

            match self.inner.runtime.readiness(name, abbr).await {
                ReadyState::Registered => return Ok(()),
                ReadyState::Reachable if !reachable => {
                    reachable = true;
                    self.publish_progress(abbr, 70, "Engine port reachable").await;
                }
                _ => {}
            }

            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(PROBE_DELAY_MAX);
        }
    }

    fn container_spec(&self, record: &ModelRecord) -> ContainerSpec {
        let settings = &self.inner.settings;
        ContainerSpec {
            image: settings.engine_image.clone(),
            name: record.container_name.clone(),
            env: vec![
                format!("NVIDIA_VISIBLE_DEVICES={}", record.gpu_device),
                format!("CUDA_VISIBLE_DEVICES={}", record.gpu_device),
                format!("HF_TOKEN={}", settings.hf_token),
            ],
            args: engine_args(record, &settings.hf_cache_dir),
            volumes: vec![
                format!(
                    "{}:{}",
                    expand_home(&settings.host_models_dir),
                    settings.models_dir
                ),
                format!("{}:/root/.cache", expand_home(&settings.host_cache_dir)),
            ],
            network: settings.network.clone(),
            gpu_device: record.gpu_device,
            labels: vec![
                ("model.abbr".to_string(), record.abbr.clone()),
                ("model.gpu".to_string(), record.gpu_device.to_string()),
                ("model.name".to_string(), record.name.clone()),
                ("model.type".to_string(), record.model_type.to_string()),
            ],
        }
    }

    /// Publish a progress milestone. Failures are logged, never fatal:
    /// progress is advisory.
    async fn publish_progress(&self, abbr: &str, progress: u8, message: &str) {
        let fields = vec![
            ("progress".to_string(), progress.to_string()),
            ("progress_message".to_string(), message.to_string()),
            ("updated_at".to_string(), now_ms().to_string()),
        ];
        if let Err(e) = self.inner.store.update_model(abbr, &fields).await {
            warn!(model = %abbr, error = %e, "Failed to publish progress");
        }
    }

    async fn publish_status(
        &self,
        abbr: &str,
        status: ModelStatus,
        progress: Option<u8>,
        message: Option<&str>,
    ) {
        let mut fields = vec![
            ("status".to_string(), status.as_str().to_string()),
            ("updated_at".to_string(), now_ms().to_string()),
        ];
        if let Some(progress) = progress {
            fields.push(("progress".to_string(), progress.to_string()));
        }
        if let Some(message) = message {
            fields.push(("progress_message".to_string(), message.to_string()));
        }
        if let Err(e) = self.inner.store.update_model(abbr, &fields).await {
            warn!(model = %abbr, status = %status, error = %e, "Failed to publish status");
        }
    }
}

fn validate_spec(spec: &DeploySpec) -> Result<(), OrchestratorError> {
    if !is_valid_abbr(&spec.abbr) {
        return Err(OrchestratorError::field(
            "abbr",
            "abbr must match [a-z0-9._-]+",
        ));
    }
    if spec.name.is_empty() {
        return Err(OrchestratorError::field("name", "name must not be empty"));
    }
    if let Some(util) = spec.gpu_memory_utilization {
        if !(util > 0.0 && util <= 1.0) {
            return Err(OrchestratorError::field(
                "gpu_memory_utilization",
                "must be in (0, 1]",
            ));
        }
    }
    if spec.max_model_len == Some(0) {
        return Err(OrchestratorError::field(
            "max_model_len",
            "must be a positive token count",
        ));
    }
    if spec.max_num_seqs == Some(0) {
        return Err(OrchestratorError::field("max_num_seqs", "must be positive"));
    }
    Ok(())
}

/// Expand a leading `~` using `$HOME`, as the host-side mount paths come
/// straight from the environment.
fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home, rest);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelType;

    fn spec(abbr: &str) -> DeploySpec {
        DeploySpec {
            name: "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
            abbr: abbr.to_string(),
            model_type: ModelType::Llm,
            quantization: None,
            max_model_len: None,
            gpu_memory_utilization: None,
            max_num_seqs: None,
            gpu_device: None,
            port: None,
        }
    }

    #[test]
    fn test_validate_spec() {
        assert!(validate_spec(&spec("qwen1.5b")).is_ok());
        assert!(validate_spec(&spec("BAD")).is_err());

        let mut s = spec("qwen1.5b");
        s.gpu_memory_utilization = Some(1.5);
        assert!(validate_spec(&s).is_err());

        let mut s = spec("qwen1.5b");
        s.gpu_memory_utilization = Some(0.0);
        assert!(validate_spec(&s).is_err());

        let mut s = spec("qwen1.5b");
        s.max_model_len = Some(0);
        assert!(validate_spec(&s).is_err());

        let mut s = spec("qwen1.5b");
        s.name = String::new();
        assert!(validate_spec(&s).is_err());
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        let long = "é".repeat(300);
        let clipped = clip(&long);
        assert!(clipped.len() <= 200);
        assert!(long.starts_with(&clipped));
        assert_eq!(clip("short"), "short");
    }

    #[test]
    fn test_expand_home() {
        // SAFETY: test-local env mutation.
        unsafe { std::env::set_var("HOME", "/home/mind") };
        assert_eq!(expand_home("~/.cache"), "/home/mind/.cache");
        assert_eq!(expand_home("/abs/path"), "/abs/path");
    }
}
