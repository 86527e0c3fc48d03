//! GPU inspector.
//!
//! One background task invokes the vendor query tool at a fixed 2 s cadence
//! and swaps an immutable snapshot atomically; readers never block the
//! poller. When the tool is absent the snapshot is empty and flagged
//! `degraded`, and the deployment engine falls back to a single logical
//! GPU 0.

use crate::types::{GpuProcess, GpuSample, ModelRecord, ModelStatus, now_ms};
use async_trait::async_trait;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Poll cadence; samples are never staler than this.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Immutable result of one poll.
#[derive(Debug, Clone, Default)]
pub struct GpuSnapshot {
    pub gpus: Vec<GpuSample>,
    pub processes: HashMap<u32, Vec<GpuProcess>>,
    /// True when the vendor tool was absent or unusable.
    pub degraded: bool,
    pub sampled_at: i64,
}

/// Source of GPU samples. Implemented by [`NvidiaSmi`] in production and by
/// fakes in tests.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// One poll. `None` means the vendor tool is absent (soft degradation,
    /// not an error).
    async fn query(&self) -> Option<(Vec<GpuSample>, HashMap<u32, Vec<GpuProcess>>)>;
}

/// Probe backed by `nvidia-smi` CSV queries.
pub struct NvidiaSmi;

const GPU_QUERY: &str =
    "index,name,uuid,memory.used,memory.total,memory.free,utilization.gpu,temperature.gpu";
const PROC_QUERY: &str = "gpu_uuid,pid,process_name,used_memory";

#[async_trait]
impl GpuProbe for NvidiaSmi {
    async fn query(&self) -> Option<(Vec<GpuSample>, HashMap<u32, Vec<GpuProcess>>)> {
        let output = Command::new("nvidia-smi")
            .args([
                &format!("--query-gpu={}", GPU_QUERY),
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (gpus, uuid_index) = parse_gpu_csv(&stdout);
        if gpus.is_empty() {
            return None;
        }

        // The process query fails on some driver versions; treat that as an
        // empty process list, not as degradation.
        let processes = match Command::new("nvidia-smi")
            .args([
                &format!("--query-compute-apps={}", PROC_QUERY),
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                parse_process_csv(&String::from_utf8_lossy(&out.stdout), &uuid_index)
            }
            _ => HashMap::new(),
        };

        Some((gpus, processes))
    }
}

fn parse_field(field: &str) -> f64 {
    let trimmed = field.trim();
    if trimmed == "[N/A]" {
        return 0.0;
    }
    trimmed.parse().unwrap_or(0.0)
}

/// Parse `--query-gpu` CSV output. Returns the samples plus a uuid → index
/// map used to attribute compute processes to GPUs.
fn parse_gpu_csv(stdout: &str) -> (Vec<GpuSample>, HashMap<String, u32>) {
    let mut gpus = Vec::new();
    let mut uuid_index = HashMap::new();

    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 8 {
            continue;
        }
        let Ok(index) = parts[0].parse::<u32>() else {
            continue;
        };
        uuid_index.insert(parts[2].to_string(), index);

        let memory_used_mb = parse_field(parts[3]);
        let memory_total_mb = parse_field(parts[4]);
        let mut memory_free_mb = parse_field(parts[5]);
        if memory_free_mb == 0.0 && memory_total_mb > memory_used_mb {
            memory_free_mb = memory_total_mb - memory_used_mb;
        }

        gpus.push(GpuSample {
            index,
            name: parts[1].to_string(),
            memory_total_mb,
            memory_used_mb,
            memory_free_mb,
            utilization_percent: parse_field(parts[6]),
            temperature_celsius: parse_field(parts[7]),
        });
    }

    (gpus, uuid_index)
}

/// Parse `--query-compute-apps` CSV output into an index → processes map.
fn parse_process_csv(
    stdout: &str,
    uuid_index: &HashMap<String, u32>,
) -> HashMap<u32, Vec<GpuProcess>> {
    let mut processes: HashMap<u32, Vec<GpuProcess>> = HashMap::new();

    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 4 {
            continue;
        }
        let Some(&index) = uuid_index.get(parts[0]) else {
            continue;
        };
        let Ok(pid) = parts[1].parse::<u32>() else {
            continue;
        };
        processes.entry(index).or_default().push(GpuProcess {
            pid,
            name: parts[2].to_string(),
            memory_mb: parse_field(parts[3]),
        });
    }

    processes
}

struct Inner {
    probe: Arc<dyn GpuProbe>,
    snapshot: RwLock<Arc<GpuSnapshot>>,
}

/// Cached view of the most recent GPU poll.
#[derive(Clone)]
pub struct GpuInspector {
    inner: Arc<Inner>,
}

impl GpuInspector {
    pub fn new(probe: Arc<dyn GpuProbe>) -> Self {
        let initial = GpuSnapshot {
            degraded: true,
            sampled_at: now_ms(),
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                probe,
                snapshot: RwLock::new(Arc::new(initial)),
            }),
        }
    }

    /// The most recent snapshot (≤ 2 s stale once the poller runs).
    pub fn snapshot(&self) -> Arc<GpuSnapshot> {
        self.inner.snapshot.read().expect("gpu snapshot lock").clone()
    }

    /// Run one poll and swap the snapshot.
    pub async fn refresh(&self) {
        let snapshot = match self.inner.probe.query().await {
            Some((gpus, processes)) => {
                for gpu in &gpus {
                    gauge!("mindmux_gpu_memory_free_mb", "gpu" => gpu.index.to_string())
                        .set(gpu.memory_free_mb);
                    gauge!("mindmux_gpu_utilization_percent", "gpu" => gpu.index.to_string())
                        .set(gpu.utilization_percent);
                }
                GpuSnapshot {
                    gpus,
                    processes,
                    degraded: false,
                    sampled_at: now_ms(),
                }
            }
            None => {
                debug!("GPU query tool unavailable, serving degraded snapshot");
                GpuSnapshot {
                    degraded: true,
                    sampled_at: now_ms(),
                    ..Default::default()
                }
            }
        };

        *self.inner.snapshot.write().expect("gpu snapshot lock") = Arc::new(snapshot);
    }

    /// Spawn the 2 s polling task.
    pub fn spawn_poller(&self) -> tokio::task::JoinHandle<()> {
        let inspector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inspector.refresh().await;
            }
        })
    }

    /// Pick the least loaded GPU for a new deployment.
    ///
    /// Score per GPU: used memory in MB plus 10000 for each model already
    /// assigned to it. Falls back to GPU 0 when the snapshot is degraded.
    pub fn select_gpu(&self, records: &[ModelRecord]) -> u32 {
        let snapshot = self.snapshot();
        if snapshot.degraded || snapshot.gpus.is_empty() {
            warn!("GPU sample unavailable, defaulting to GPU 0");
            return 0;
        }

        let mut assigned: HashMap<u32, usize> = HashMap::new();
        for record in records {
            if matches!(record.status, ModelStatus::Running | ModelStatus::Deploying) {
                *assigned.entry(record.gpu_device).or_default() += 1;
            }
        }

        snapshot
            .gpus
            .iter()
            .min_by_key(|gpu| {
                let models = assigned.get(&gpu.index).copied().unwrap_or(0);
                gpu.memory_used_mb as u64 + 10_000 * models as u64
            })
            .map(|gpu| gpu.index)
            .unwrap_or(0)
    }
}
