//! Container supervisor.
//!
//! Spawns, inspects, stops, and removes inference containers, binds them to
//! a single GPU, and probes engine readiness. The [`ContainerRuntime`] trait
//! is the seam that lets tests substitute an in-memory fake for Docker.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{DeviceRequest, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors from the container runtime, classified so the deployment engine
/// can tell transient failures from terminal ones.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("image missing: {0}")]
    ImageMissing(String),

    #[error("port conflict: {0}")]
    PortConflict(String),

    #[error("gpu unavailable: {0}")]
    GpuUnavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("container runtime down: {0}")]
    RuntimeDown(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Transient failures are retried by the deployment engine.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::RuntimeDown(_) | RuntimeError::Other(_))
    }
}

/// Classify a Docker API error by status code and message.
fn classify(err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;
    match err {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 if message.contains("image") => RuntimeError::ImageMissing(message),
            404 => RuntimeError::NotFound(message),
            409 => RuntimeError::PortConflict(message),
            500 if message.contains("nvidia")
                || message.contains("NVIDIA")
                || message.contains("device") =>
            {
                RuntimeError::GpuUnavailable(message)
            }
            507 => RuntimeError::QuotaExceeded(message),
            _ => RuntimeError::Other(message),
        },
        // Transport-level failures mean the daemon itself is unreachable.
        other => RuntimeError::RuntimeDown(other.to_string()),
    }
}

/// Everything needed to submit an inference container to the runtime.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub args: Vec<String>,
    /// `host:container` bind mounts.
    pub volumes: Vec<String>,
    pub network: String,
    /// GPU visibility is restricted to this single device index.
    pub gpu_device: u32,
    pub labels: Vec<(String, String)>,
}

/// Snapshot of a container as seen by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub id: String,
    pub running: bool,
    /// `KEY=VALUE` pairs from the container config.
    pub env: Vec<String>,
    pub args: Vec<String>,
}

impl ContainerInfo {
    /// Value of an environment variable, if set.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.env
            .iter()
            .find_map(|e| e.strip_prefix(prefix.as_str()))
    }

    /// Value following a `--flag` in the container args, if present.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }
}

/// Readiness of an inference engine behind a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Nothing answering on the inference port yet.
    Unreachable,
    /// HTTP answers but the model is not registered yet.
    Reachable,
    /// `/v1/models` lists the expected model id.
    Registered,
}

/// Capability set of the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Returns the container id.
    async fn spawn(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError>;
    /// Graceful stop with the given timeout, then kill.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError>;
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
    /// Running containers whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;
    async fn logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError>;
    /// Run a command inside a container (used for the proxy reload signal).
    async fn exec(&self, name: &str, cmd: &[&str]) -> Result<(), RuntimeError>;
    /// Probe the engine behind a container for the expected served model id.
    async fn readiness(&self, name: &str, model: &str) -> ReadyState;
}

// ---------------------------------------------------------------------------
// Docker
// ---------------------------------------------------------------------------

/// Docker-backed runtime. Containers join the platform's bridge network and
/// see exactly one GPU.
pub struct DockerRuntime {
    docker: bollard::Docker,
    engine_port: u16,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it responds.
    pub async fn connect(engine_port: u16) -> Result<Self, RuntimeError> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(classify)?;
        docker.ping().await.map_err(classify)?;
        Ok(Self {
            docker,
            engine_port,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn spawn(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            binds: Some(spec.volumes.clone()),
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            // All devices are exposed to the NVIDIA runtime; the engine is
            // pinned to one GPU via CUDA_VISIBLE_DEVICES in spec.env, which
            // the reconciler later reads back as the host device index.
            device_requests: Some(vec![DeviceRequest {
                driver: None,
                count: Some(-1),
                device_ids: None,
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                options: None,
            }]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.args.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.iter().cloned().collect::<HashMap<_, _>>()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(classify)?;

        self.docker
            .start_container::<String>(&response.id, None)
            .await
            .map_err(classify)?;

        debug!(name = %spec.name, id = %response.id, "Container started");
        Ok(response.id)
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let response = match self.docker.inspect_container(name, None).await {
            Ok(response) => response,
            Err(err) => {
                return match classify(err) {
                    RuntimeError::NotFound(_) => Ok(None),
                    other => Err(other),
                };
            }
        };

        let running = response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let config = response.config.unwrap_or_default();

        Ok(Some(ContainerInfo {
            name: name.to_string(),
            id: response.id.unwrap_or_default(),
            running,
            env: config.env.unwrap_or_default(),
            args: config.cmd.unwrap_or_default(),
        }))
    }

    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(classify)
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        // The name filter is a substring match, so re-check the prefix.
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(classify)?;

        let mut containers = Vec::new();
        for summary in summaries {
            let Some(name) = summary
                .names
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.trim_start_matches('/').to_string())
                .find(|n| n.starts_with(prefix))
            else {
                continue;
            };
            if let Some(info) = self.inspect(&name).await? {
                containers.push(info);
            }
        }
        Ok(containers)
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(err) => return Err(classify(err)),
            }
        }
        Ok(out)
    }

    async fn exec(&self, name: &str, cmd: &[&str]) -> Result<(), RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(log) = chunk {
                    debug!(container = %name, "exec: {}", log.to_string().trim_end());
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(classify)?;
        match inspected.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(RuntimeError::Other(format!(
                "exec {:?} in {} exited with {}",
                cmd, name, code
            ))),
        }
    }

    async fn readiness(&self, name: &str, model: &str) -> ReadyState {
        let url = format!("http://{}:{}/v1/models", name, self.engine_port);
        probe_models_endpoint(&url, model).await
    }
}

/// GET an engine's `/v1/models` endpoint and check the served model id.
///
/// Also used by tests pointing at a loopback mock engine.
pub async fn probe_models_endpoint(url: &str, model: &str) -> ReadyState {
    use http_body_util::{BodyExt, Empty};

    let client: hyper_util::client::legacy::Client<_, Empty<bytes::Bytes>> =
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build_http();

    let Ok(uri) = url.parse::<hyper::Uri>() else {
        return ReadyState::Unreachable;
    };

    let request = hyper::Request::builder()
        .method("GET")
        .uri(uri)
        .body(Empty::new());
    let Ok(request) = request else {
        return ReadyState::Unreachable;
    };

    let response =
        match tokio::time::timeout(Duration::from_secs(5), client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "Readiness probe failed");
                return ReadyState::Unreachable;
            }
            Err(_) => return ReadyState::Unreachable,
        };

    if !response.status().is_success() {
        return ReadyState::Reachable;
    }

    let Ok(collected) = response.into_body().collect().await else {
        return ReadyState::Reachable;
    };
    let Ok(body) = serde_json::from_slice::<serde_json::Value>(&collected.to_bytes()) else {
        warn!(url = %url, "Readiness probe returned malformed JSON");
        return ReadyState::Reachable;
    };

    let registered = body["data"]
        .as_array()
        .and_then(|data| data.first())
        .and_then(|first| first["id"].as_str())
        .is_some_and(|id| id == model);

    if registered {
        ReadyState::Registered
    } else {
        ReadyState::Reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_classify_by_status() {
        assert!(matches!(
            classify(server_error(404, "No such image: vllm/vllm-openai")),
            RuntimeError::ImageMissing(_)
        ));
        assert!(matches!(
            classify(server_error(404, "No such container: MIND_MODEL_x")),
            RuntimeError::NotFound(_)
        ));
        assert!(matches!(
            classify(server_error(409, "name already in use")),
            RuntimeError::PortConflict(_)
        ));
        assert!(matches!(
            classify(server_error(500, "could not select device driver nvidia")),
            RuntimeError::GpuUnavailable(_)
        ));
        assert!(matches!(
            classify(server_error(507, "no space left")),
            RuntimeError::QuotaExceeded(_)
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RuntimeError::RuntimeDown("x".into()).is_transient());
        assert!(RuntimeError::Other("x".into()).is_transient());
        assert!(!RuntimeError::ImageMissing("x".into()).is_transient());
        assert!(!RuntimeError::GpuUnavailable("x".into()).is_transient());
    }

    #[test]
    fn test_container_info_accessors() {
        let info = ContainerInfo {
            name: "MIND_MODEL_qwen1.5b".to_string(),
            id: "abc".to_string(),
            running: true,
            env: vec![
                "CUDA_VISIBLE_DEVICES=1".to_string(),
                "HF_TOKEN=hf_x".to_string(),
            ],
            args: vec![
                "--model".to_string(),
                "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ],
        };

        assert_eq!(info.env_var("CUDA_VISIBLE_DEVICES"), Some("1"));
        assert_eq!(info.env_var("MISSING"), None);
        assert_eq!(info.arg_value("--model"), Some("Qwen/Qwen2.5-1.5B-Instruct"));
        assert_eq!(info.arg_value("--tensor-parallel-size"), None);
    }
}
