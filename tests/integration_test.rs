//! Integration tests driven through in-memory fakes.
//!
//! The container runtime, GPU probe, state store, and engine upstream are
//! all substituted, so these tests exercise the full deployment state
//! machine, the reconciler, and the context-mediated data plane without
//! Docker, Redis, or a GPU.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Json, Router};
use dashmap::DashMap;
use mindmux::gpu::{GpuInspector, GpuProbe};
use mindmux::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ReadyState, RuntimeError};
use mindmux::store::{MemoryStore, StateStore};
use mindmux::types::{
    ApiKeyRecord, DeploySpec, GpuProcess, GpuSample, ModelRecord, ModelStatus, ModelType,
    Quantization, now_ms,
};
use mindmux::{AppState, Catalog, OrchestratorError, Settings, Upstream, auth, config};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FakeContainer {
    id: String,
    running: bool,
    env: Vec<String>,
    args: Vec<String>,
}

/// In-memory stand-in for Docker. Containers are immediately "ready" unless
/// configured otherwise.
#[derive(Default)]
struct FakeRuntime {
    containers: DashMap<String, FakeContainer>,
    reload_signals: AtomicUsize,
    fail_reload: AtomicBool,
    /// Readiness reported for running containers.
    stuck_loading: AtomicBool,
    /// Delay before spawn registers the container, to widen the window
    /// where a deploy is in flight but no container exists yet.
    spawn_delay_ms: AtomicUsize,
}

impl FakeRuntime {
    fn insert_running(&self, name: &str, env: Vec<String>, args: Vec<String>) {
        self.containers.insert(
            name.to_string(),
            FakeContainer {
                id: format!("fake-{}", name),
                running: true,
                env,
                args,
            },
        );
    }

    fn info(&self, name: &str, container: &FakeContainer) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            id: container.id.clone(),
            running: container.running,
            env: container.env.clone(),
            args: container.args.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn spawn(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let delay = self.spawn_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.containers.contains_key(&spec.name) {
            return Err(RuntimeError::PortConflict(format!(
                "name {} already in use",
                spec.name
            )));
        }
        self.insert_running(&spec.name, spec.env.clone(), spec.args.clone());
        Ok(format!("fake-{}", spec.name))
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        Ok(self.containers.get(name).map(|c| self.info(name, &c)))
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), RuntimeError> {
        match self.containers.get_mut(name) {
            Some(mut container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        match self.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        Ok(self
            .containers
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().running)
            .map(|entry| self.info(entry.key(), entry.value()))
            .collect())
    }

    async fn logs(&self, _name: &str, _tail: usize) -> Result<String, RuntimeError> {
        Ok("fake engine logs".to_string())
    }

    async fn exec(&self, _name: &str, cmd: &[&str]) -> Result<(), RuntimeError> {
        if cmd == ["nginx", "-s", "reload"] {
            if self.fail_reload.load(Ordering::SeqCst) {
                return Err(RuntimeError::Other("reload failed".to_string()));
            }
            self.reload_signals.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn readiness(&self, name: &str, _model: &str) -> ReadyState {
        match self.containers.get(name) {
            Some(container) if container.running => {
                if self.stuck_loading.load(Ordering::SeqCst) {
                    ReadyState::Reachable
                } else {
                    ReadyState::Registered
                }
            }
            _ => ReadyState::Unreachable,
        }
    }
}

struct FakeGpu {
    free_mb: f64,
}

#[async_trait]
impl GpuProbe for FakeGpu {
    async fn query(&self) -> Option<(Vec<GpuSample>, HashMap<u32, Vec<GpuProcess>>)> {
        Some((
            vec![GpuSample {
                index: 0,
                name: "NVIDIA RTX A6000".to_string(),
                memory_total_mb: 49140.0,
                memory_used_mb: 49140.0 - self.free_mb,
                memory_free_mb: self.free_mb,
                utilization_percent: 0.0,
                temperature_celsius: 40.0,
            }],
            HashMap::new(),
        ))
    }
}

/// Tests run engines on the loopback interface, addressed via the record's
/// inference port.
struct LoopbackUpstream;

impl Upstream for LoopbackUpstream {
    fn base_url(&self, record: &ModelRecord) -> String {
        format!("http://127.0.0.1:{}", record.port)
    }
}

fn catalog() -> Catalog {
    Catalog::from_entries(vec![
        config::CatalogEntry {
            abbr: "qwen1.5b".to_string(),
            name: "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
            model_type: ModelType::Llm,
            quantization: None,
            max_model_len: Some(2048),
            recommended_vram_mb: Some(6144),
            recommended_settings: Some(config::RecommendedSettings {
                gpu_memory_utilization: Some(0.5),
                max_num_seqs: None,
            }),
            description: None,
        },
        config::CatalogEntry {
            abbr: "bge-m3".to_string(),
            name: "BAAI/bge-m3".to_string(),
            model_type: ModelType::Embedding,
            quantization: None,
            max_model_len: None,
            recommended_vram_mb: None,
            recommended_settings: None,
            description: None,
        },
    ])
}

struct Harness {
    state: AppState,
    runtime: Arc<FakeRuntime>,
    store: Arc<MemoryStore>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_gpu_free_mb(24_000.0)
    }

    fn with_gpu_free_mb(free_mb: f64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_env();
        settings.jwt_secret = "integration-secret-integration-secret".to_string();
        settings.router_file = tmp.path().join("model_routes.conf");
        settings.hf_cache_dir = tmp.path().join("no-cache").display().to_string();
        settings.deploy_timeout_secs = 5;

        let runtime = Arc::new(FakeRuntime::default());
        let store = Arc::new(MemoryStore::new());
        let gpu = GpuInspector::new(Arc::new(FakeGpu { free_mb }));

        let state = mindmux::build_state(
            Arc::new(settings),
            Arc::new(catalog()),
            store.clone(),
            runtime.clone(),
            gpu,
            Arc::new(LoopbackUpstream),
        );
        Self {
            state,
            runtime,
            store,
            _tmp: tmp,
        }
    }

    async fn refresh_gpu(&self) {
        self.state.gpu.refresh().await;
    }

    fn session(&self) -> String {
        auth::issue_session(
            &self.state.settings.auth_username,
            &self.state.settings.jwt_secret,
            1,
        )
        .0
    }

    fn app(&self) -> Router {
        mindmux::build_app(self.state.clone())
    }

    async fn wait_for_status(&self, abbr: &str, status: ModelStatus) -> ModelRecord {
        for _ in 0..100 {
            if let Some(record) = self.store.get_model(abbr).await.unwrap() {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("model {} never reached {}", abbr, status);
    }

    fn router_file(&self) -> String {
        std::fs::read_to_string(&self.state.settings.router_file).unwrap_or_default()
    }

    async fn mint_api_key(&self) -> String {
        let minted = auth::mint_key();
        let record = ApiKeyRecord {
            name: "test".to_string(),
            prefix: minted.prefix.clone(),
            description: String::new(),
            created_at: now_ms(),
            last_used_at: None,
        };
        self.store.put_api_key(&minted.hash, &record).await.unwrap();
        minted.full_key
    }

    /// Insert a running record pointing at a loopback engine port.
    async fn insert_running_model(&self, abbr: &str, max_model_len: u32, port: u16) {
        let now = now_ms();
        let record = ModelRecord {
            abbr: abbr.to_string(),
            name: format!("org/{}", abbr),
            model_type: ModelType::Llm,
            quantization: Quantization::None,
            max_model_len,
            gpu_memory_utilization: 0.5,
            max_num_seqs: 256,
            gpu_device: 0,
            port,
            endpoint: ModelRecord::endpoint_for(abbr),
            status: ModelStatus::Running,
            progress: 100,
            progress_message: "Model ready".to_string(),
            container_name: ModelRecord::container_name_for(abbr),
            container_id: "fake".to_string(),
            cache_size_mb: None,
            cached: None,
            created_at: now,
            updated_at: now,
        };
        self.store.put_model(&record).await.unwrap();
    }
}

fn deploy_spec(abbr: &str) -> DeploySpec {
    DeploySpec {
        name: "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
        abbr: abbr.to_string(),
        model_type: ModelType::Llm,
        quantization: None,
        max_model_len: None,
        gpu_memory_utilization: None,
        max_num_seqs: None,
        gpu_device: Some(0),
        port: None,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Spawn an in-process mock engine that records the last chat-completion
/// request body. Returns the loopback port.
async fn spawn_mock_engine(captured: Arc<Mutex<Option<Value>>>) -> u16 {
    let app = Router::new().route(
        "/v1/chat/completions",
        axum::routing::post(move |Json(body): Json<Value>| {
            let captured = captured.clone();
            async move {
                *captured.lock().unwrap() = Some(body);
                Json(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": "hello" },
                        "finish_reason": "stop"
                    }]
                }))
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

// ---------------------------------------------------------------------------
// Deployment lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_deploy_happy_path() {
    let harness = Harness::new();
    harness.refresh_gpu().await;
    let token = harness.session();
    let app = harness.app();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orchestrator/models/deploy")
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", token))
                .body(Body::from(
                    json!({
                        "abbr": "qwen1.5b",
                        "name": "Qwen/Qwen2.5-1.5B-Instruct",
                        "type": "llm",
                        "max_model_len": 2048,
                        "gpu_memory_utilization": 0.5,
                        "gpu_device": 0
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "deploying");
    assert_eq!(json["endpoint"], "/api/v1/qwen1.5b");
    // Catalog settings win over the request.
    assert_eq!(json["max_model_len"], 2048);
    assert_eq!(json["gpu_memory_utilization"], 0.5);

    let record = harness
        .wait_for_status("qwen1.5b", ModelStatus::Running)
        .await;
    assert_eq!(record.progress, 100);
    assert_eq!(record.container_name, "MIND_MODEL_qwen1.5b");
    assert!(!record.container_id.is_empty());

    // The container exists, pinned to GPU 0, serving under its abbr.
    let container = harness
        .runtime
        .inspect("MIND_MODEL_qwen1.5b")
        .await
        .unwrap()
        .expect("container spawned");
    assert!(container.running);
    assert!(
        container
            .env
            .contains(&"CUDA_VISIBLE_DEVICES=0".to_string())
    );
    assert_eq!(container.arg_value("--served-model-name"), Some("qwen1.5b"));

    // Exactly two location blocks for the model, proxy reloaded.
    let router_file = harness.router_file();
    assert_eq!(router_file.matches("location ").count(), 2);
    assert!(router_file.contains("location = /api/v1/qwen1.5b/chat/completions"));
    assert!(harness.runtime.reload_signals.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_concurrent_deploys_conflict() {
    let harness = Harness::new();
    harness.refresh_gpu().await;

    let (a, b) = tokio::join!(
        harness.state.deployer.deploy(deploy_spec("qwen1.5b")),
        harness.state.deployer.deploy(deploy_spec("qwen1.5b")),
    );

    let oks = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(oks, 1, "exactly one deploy must win");
    let err = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    // Final state: a single record.
    harness
        .wait_for_status("qwen1.5b", ModelStatus::Running)
        .await;
    assert_eq!(harness.store.list_models().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deploy_rejected_when_gpu_memory_low() {
    let harness = Harness::with_gpu_free_mb(1000.0);
    harness.refresh_gpu().await;

    // Catalog says qwen1.5b wants 6144 MB; only 1000 MB free.
    let err = harness
        .state
        .deployer
        .deploy(deploy_spec("qwen1.5b"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceExhausted(_)));
    assert!(harness.store.get_model("qwen1.5b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_deploy_rejected_for_missing_gpu() {
    let harness = Harness::new();
    harness.refresh_gpu().await;

    let mut spec = deploy_spec("qwen1.5b");
    spec.gpu_device = Some(7);
    let err = harness.state.deployer.deploy(spec).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceExhausted(_)));
}

#[tokio::test]
async fn test_stop_start_lifecycle() {
    let harness = Harness::new();
    harness.refresh_gpu().await;

    harness
        .state
        .deployer
        .deploy(deploy_spec("qwen1.5b"))
        .await
        .unwrap();
    harness
        .wait_for_status("qwen1.5b", ModelStatus::Running)
        .await;

    let record = harness.state.deployer.stop("qwen1.5b").await.unwrap();
    assert_eq!(record.status, ModelStatus::Stopped);

    // Stop keeps the container around (only delete removes it), but it is
    // no longer running and no longer routed.
    let container = harness
        .runtime
        .inspect("MIND_MODEL_qwen1.5b")
        .await
        .unwrap()
        .expect("container kept");
    assert!(!container.running);
    assert!(!harness.router_file().contains("qwen1.5b"));

    // Idempotent stop.
    let record = harness.state.deployer.stop("qwen1.5b").await.unwrap();
    assert_eq!(record.status, ModelStatus::Stopped);

    // Start re-deploys from the stored record.
    let record = harness.state.deployer.start("qwen1.5b").await.unwrap();
    assert_eq!(record.status, ModelStatus::Deploying);
    harness
        .wait_for_status("qwen1.5b", ModelStatus::Running)
        .await;
    assert!(harness.router_file().contains("qwen1.5b"));
}

#[tokio::test]
async fn test_delete_removes_record_and_container() {
    let harness = Harness::new();
    harness.refresh_gpu().await;

    harness
        .state
        .deployer
        .deploy(deploy_spec("qwen1.5b"))
        .await
        .unwrap();
    harness
        .wait_for_status("qwen1.5b", ModelStatus::Running)
        .await;

    harness.state.deployer.delete("qwen1.5b").await.unwrap();
    assert!(harness.store.get_model("qwen1.5b").await.unwrap().is_none());
    assert!(
        harness
            .runtime
            .inspect("MIND_MODEL_qwen1.5b")
            .await
            .unwrap()
            .is_none()
    );
    assert!(!harness.router_file().contains("qwen1.5b"));

    let err = harness.state.deployer.delete("qwen1.5b").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_proxy_reload_failure_demotes_to_error() {
    let harness = Harness::new();
    harness.refresh_gpu().await;
    harness.runtime.fail_reload.store(true, Ordering::SeqCst);

    harness
        .state
        .deployer
        .deploy(deploy_spec("qwen1.5b"))
        .await
        .unwrap();

    let record = harness.wait_for_status("qwen1.5b", ModelStatus::Error).await;
    assert_eq!(record.progress_message, "proxy reload failed");

    // The invariant: a model never claims running while unreachable
    // through the proxy. Its container is stopped.
    let container = harness
        .runtime
        .inspect("MIND_MODEL_qwen1.5b")
        .await
        .unwrap()
        .unwrap();
    assert!(!container.running);
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_crash_reconciliation_adopts_running_container() {
    let harness = Harness::new();

    // A container survives while the state store starts empty: the
    // orchestrator crashed after deploying.
    harness.runtime.insert_running(
        "MIND_MODEL_qwen1.5b",
        vec![
            "NVIDIA_VISIBLE_DEVICES=1".to_string(),
            "CUDA_VISIBLE_DEVICES=1".to_string(),
        ],
        vec![
            "--model".to_string(),
            "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
            "--served-model-name".to_string(),
            "qwen1.5b".to_string(),
            "--port".to_string(),
            "8000".to_string(),
        ],
    );

    let reconciler = mindmux::Reconciler::new(harness.state.deployer.clone());
    assert!(reconciler.run_once().await.unwrap());

    let record = harness
        .store
        .get_model("qwen1.5b")
        .await
        .unwrap()
        .expect("record recovered");
    assert_eq!(record.status, ModelStatus::Running);
    assert_eq!(record.gpu_device, 1);
    assert_eq!(record.name, "Qwen/Qwen2.5-1.5B-Instruct");
    assert_eq!(record.max_model_len, 2048);

    // The recovered model is routed again.
    assert!(harness.router_file().contains("qwen1.5b"));

    // A second pass is a no-op.
    assert!(!reconciler.run_once().await.unwrap());
}

#[tokio::test]
async fn test_reconciliation_skips_uncataloged_container() {
    let harness = Harness::new();
    harness
        .runtime
        .insert_running("MIND_MODEL_mystery", vec![], vec![]);

    let reconciler = mindmux::Reconciler::new(harness.state.deployer.clone());
    reconciler.run_once().await.unwrap();

    assert!(harness.store.get_model("mystery").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reconciliation_evicts_orphaned_records() {
    let harness = Harness::new();
    harness.insert_running_model("qwen1.5b", 2048, 8000).await;

    // No container backs the record.
    let reconciler = mindmux::Reconciler::new(harness.state.deployer.clone());
    assert!(reconciler.run_once().await.unwrap());
    assert!(harness.store.get_model("qwen1.5b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reconciliation_spares_in_flight_deploys() {
    let harness = Harness::new();
    harness.refresh_gpu().await;
    // Widen the window in which the record says deploying but no container
    // exists yet.
    harness.runtime.spawn_delay_ms.store(300, Ordering::SeqCst);

    harness
        .state
        .deployer
        .deploy(deploy_spec("qwen1.5b"))
        .await
        .unwrap();

    let reconciler = mindmux::Reconciler::new(harness.state.deployer.clone());
    reconciler.run_once().await.unwrap();

    // The in-flight record must survive the pass.
    assert!(harness.store.get_model("qwen1.5b").await.unwrap().is_some());
    harness
        .wait_for_status("qwen1.5b", ModelStatus::Running)
        .await;
}

// ---------------------------------------------------------------------------
// Data plane
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_completion_truncates_context() {
    let harness = Harness::new();
    let captured = Arc::new(Mutex::new(None));
    let port = spawn_mock_engine(captured.clone()).await;
    harness.insert_running_model("qwen1.5b", 2048, port).await;
    let key = harness.mint_api_key().await;

    // System message plus 30 alternating messages of ~100 estimated tokens:
    // ~3100 tokens against a 2048-token window.
    let filler = "x".repeat(384);
    let mut messages = vec![json!({ "role": "system", "content": filler })];
    for i in 0..30 {
        let role = if i % 2 == 0 { "user" } else { "assistant" };
        messages.push(json!({ "role": role, "content": filler }));
    }

    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/qwen1.5b/chat/completions")
                .header("Content-Type", "application/json")
                .header("X-API-Key", &key)
                .body(Body::from(
                    json!({ "messages": messages, "max_tokens": 512 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-mind-context-truncated")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
    let envelope = body_json(response).await;
    assert_eq!(envelope["context_truncated"], true);
    assert_eq!(envelope["choices"][0]["message"]["content"], "hello");

    // Upstream saw the pinned system message, a bounded tail, and a capped
    // completion budget.
    let upstream = captured.lock().unwrap().clone().expect("upstream called");
    let sent = upstream["messages"].as_array().unwrap();
    assert_eq!(sent.len(), 11);
    assert_eq!(sent[0]["role"], "system");
    let inputs = 11 * 100u64;
    let max_tokens = upstream["max_tokens"].as_u64().unwrap();
    assert!(inputs + max_tokens + 50 <= 2048);
}

#[tokio::test]
async fn test_chat_completion_passes_small_requests_through() {
    let harness = Harness::new();
    let captured = Arc::new(Mutex::new(None));
    let port = spawn_mock_engine(captured.clone()).await;
    harness.insert_running_model("qwen1.5b", 2048, port).await;
    let key = harness.mint_api_key().await;

    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/qwen1.5b/chat/completions")
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", key))
                .body(Body::from(
                    json!({
                        "messages": [{ "role": "user", "content": "hi" }],
                        "max_tokens": 128
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-mind-context-truncated").is_none());
    let envelope = body_json(response).await;
    assert!(envelope.get("context_truncated").is_none());

    let upstream = captured.lock().unwrap().clone().unwrap();
    assert_eq!(upstream["messages"].as_array().unwrap().len(), 1);
    assert_eq!(upstream["max_tokens"], 128);
}

#[tokio::test]
async fn test_context_overflow_rejected_without_upstream_call() {
    let harness = Harness::new();
    let captured = Arc::new(Mutex::new(None));
    let port = spawn_mock_engine(captured.clone()).await;
    harness.insert_running_model("qwen1.5b", 2048, port).await;
    let key = harness.mint_api_key().await;

    // One message bigger than the whole window.
    let huge = "x".repeat(4 * 2048);
    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/qwen1.5b/chat/completions")
                .header("Content-Type", "application/json")
                .header("X-API-Key", &key)
                .body(Body::from(
                    json!({ "messages": [{ "role": "user", "content": huge }] }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(captured.lock().unwrap().is_none(), "no upstream call");
}

#[tokio::test]
async fn test_data_plane_auth_and_model_gates() {
    let harness = Harness::new();
    let key = harness.mint_api_key().await;
    let app = harness.app();

    let chat_body = json!({ "messages": [{ "role": "user", "content": "hi" }] }).to_string();

    // No key.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/qwen1.5b/chat/completions")
                .header("Content-Type", "application/json")
                .body(Body::from(chat_body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid key, unknown model.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/ghost/chat/completions")
                .header("Content-Type", "application/json")
                .header("X-API-Key", &key)
                .body(Body::from(chat_body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Valid key, model present but stopped.
    harness.insert_running_model("qwen1.5b", 2048, 8000).await;
    harness
        .store
        .update_model(
            "qwen1.5b",
            &[("status".to_string(), "stopped".to_string())],
        )
        .await
        .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/qwen1.5b/chat/completions")
                .header("Content-Type", "application/json")
                .header("X-API-Key", &key)
                .body(Body::from(chat_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_api_key_mint_use_revoke_round_trip() {
    let harness = Harness::new();
    let captured = Arc::new(Mutex::new(None));
    let port = spawn_mock_engine(captured).await;
    harness.insert_running_model("qwen1.5b", 2048, port).await;
    let token = harness.session();

    // Mint through the admin surface.
    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orchestrator/api-keys?name=k1")
                .header("Authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let minted = body_json(response).await;
    let full_key = minted["api_key"].as_str().unwrap().to_string();
    let prefix = minted["prefix"].as_str().unwrap().to_string();

    let chat = |key: String| {
        let app = harness.app();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/qwen1.5b/chat/completions")
                    .header("Content-Type", "application/json")
                    .header("Authorization", format!("Bearer {}", key))
                    .body(Body::from(
                        json!({ "messages": [{ "role": "user", "content": "hi" }] }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };

    // The key works on the data plane.
    assert_eq!(chat(full_key.clone()).await.status(), StatusCode::OK);

    // Revoke by prefix through the admin surface.
    let response = harness
        .app()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/orchestrator/api-keys/{}", prefix))
                .header("Authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The revoked key no longer authenticates.
    assert_eq!(
        chat(full_key).await.status(),
        StatusCode::UNAUTHORIZED
    );
}
