//! # mindmux
//!
//! Multi-tenant orchestrator for LLM inference engines on a single
//! multi-GPU host. Clients get an OpenAI-compatible surface per model;
//! operators get an administrative API to deploy, supervise, and observe.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        mindmux                            │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │ HTTP surface                                        │  │
//! │  │ - /orchestrator/…  admin (session auth)             │  │
//! │  │ - /api/v1/{abbr}/… data plane (API-key auth)        │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │            │                          │                   │
//! │  ┌───────────────────┐   ┌──────────────────────────────┐ │
//! │  │ Deployment engine │   │ Context mediator             │ │
//! │  │ - per-abbr mutex  │   │ - token estimate + truncate  │ │
//! │  │ - progress pub    │   │ - SSE passthrough            │ │
//! │  └───────────────────┘   └──────────────────────────────┘ │
//! │      │        │      │                │                   │
//! │      ▼        ▼      ▼                ▼                   │
//! │  [Docker]  [nvidia-smi]  [nginx include + reload]         │
//! │      ▲                                                    │
//! │  ┌───────────────────┐      ┌─────────────────┐           │
//! │  │ Reconciler (30 s) │◄────►│ Redis (truth)   │           │
//! │  └───────────────────┘      └─────────────────┘           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The state store is authoritative; containers, GPU samples, and the
//! router file are continuously reconciled against it.

pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod control;
pub mod deploy;
pub mod error;
pub mod gpu;
pub mod nginx;
pub mod proxy;
pub mod reconcile;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::{Catalog, Settings};
pub use deploy::Deployer;
pub use error::OrchestratorError;
pub use gpu::{GpuInspector, GpuProbe, NvidiaSmi};
pub use nginx::RouterGenerator;
pub use proxy::{DockerNetworkUpstream, Upstream};
pub use reconcile::Reconciler;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use store::{MemoryStore, RedisStore, StateStore};
pub use types::{ModelRecord, ModelStatus};

use axum::Router;
use axum::middleware;
use axum::routing::{any, post};
use std::sync::Arc;

/// Shared state behind every HTTP handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn StateStore>,
    pub gpu: GpuInspector,
    pub deployer: Deployer,
    pub upstream: Arc<dyn Upstream>,
    pub http: proxy::HttpClient,
}

/// Wire the component stack together.
///
/// Every external dependency comes in behind a trait so tests can
/// substitute in-memory fakes for Docker, Redis, and the GPU query tool.
pub fn build_state(
    settings: Arc<Settings>,
    catalog: Arc<Catalog>,
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    gpu: GpuInspector,
    upstream: Arc<dyn Upstream>,
) -> AppState {
    let router = Arc::new(RouterGenerator::new(
        store.clone(),
        runtime.clone(),
        settings.router_file.clone(),
        settings.gateway_container.clone(),
        settings.engine_port,
    ));
    let deployer = Deployer::new(
        settings.clone(),
        catalog.clone(),
        store.clone(),
        runtime,
        gpu.clone(),
        router,
    );

    AppState {
        settings,
        catalog,
        store,
        gpu,
        deployer,
        upstream,
        http: proxy::http_client(),
    }
}

/// Build the complete HTTP surface: administrative API under
/// `/orchestrator` plus the API-key-gated data plane under `/api/v1`.
pub fn build_app(state: AppState) -> Router {
    let data_plane = Router::new()
        .route(
            "/api/v1/{abbr}/chat/completions",
            post(proxy::chat_completions),
        )
        .route("/api/v1/{abbr}/{*rest}", any(proxy::passthrough))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state.clone());

    Router::new()
        .nest("/orchestrator", control::router(state))
        .merge(data_plane)
}
