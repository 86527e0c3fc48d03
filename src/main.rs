//! mindmux - multi-model orchestrator
//!
//! Deploys and supervises LLM inference containers on a multi-GPU host,
//! reconciles durable state against the runtime, and fronts each model with
//! an OpenAI-compatible, context-mediated endpoint.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mindmux::{
    Catalog, DockerRuntime, GpuInspector, NvidiaSmi, Reconciler, RedisStore, Settings,
    proxy::DockerNetworkUpstream,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mindmux")]
#[command(about = "Multi-model orchestrator for LLM inference engines")]
struct Args {
    /// Path to the predefined model catalog (overrides MODELS_CONFIG_PATH)
    #[arg(short, long)]
    catalog: Option<PathBuf>,

    /// Port to listen on (overrides ORCHESTRATOR_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hash a password for AUTH_PASSWORD_HASH and exit
    HashPassword { password: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::HashPassword { password }) = args.command {
        println!("{}", mindmux::auth::hash_password(&password));
        println!("\nSet this as AUTH_PASSWORD_HASH in your environment.");
        return Ok(());
    }

    let filter = if args.verbose {
        EnvFilter::new("mindmux=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting mindmux");

    let mut settings = Settings::from_env();
    if let Some(catalog) = args.catalog {
        settings.catalog_path = catalog;
    }
    if let Some(port) = args.port {
        settings.orchestrator_port = port;
    }
    settings.validate();
    let settings = Arc::new(settings);

    let metrics_handle = mindmux::telemetry::install();

    let catalog = Arc::new(Catalog::load_or_empty(&settings.catalog_path));

    let store = match RedisStore::connect(&settings.redis_host, settings.redis_port).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                host = %settings.redis_host,
                port = settings.redis_port,
                error = %e,
                "State store unreachable"
            );
            std::process::exit(1);
        }
    };

    // Exit code 2 is the contract for "container runtime not reachable".
    let runtime = match DockerRuntime::connect(settings.engine_port).await {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!(error = %e, "Container runtime unreachable");
            std::process::exit(2);
        }
    };

    let gpu = GpuInspector::new(Arc::new(NvidiaSmi));
    gpu.refresh().await;
    if gpu.snapshot().degraded {
        warn!("GPU query tool unavailable; assuming a single logical GPU 0");
    }
    let _gpu_poller = gpu.spawn_poller();

    let state = mindmux::build_state(
        settings.clone(),
        catalog,
        store,
        runtime,
        gpu,
        Arc::new(DockerNetworkUpstream {
            engine_port: settings.engine_port,
        }),
    );

    // Replay runtime truth before serving, then keep reconciling.
    let reconciler = Reconciler::new(state.deployer.clone());
    match reconciler.run_once().await {
        Ok(changed) => info!(changed, "Startup reconciliation complete"),
        Err(e) => warn!(error = %e, "Startup reconciliation failed"),
    }
    if let Err(e) = state.deployer.refresh_router().await {
        warn!(error = %e, "Startup router regeneration failed");
    }
    let _reconcile_loop = reconciler.spawn_loop();

    // Metrics on a separate port so the scrape path stays off the proxy.
    if settings.metrics_port != 0 {
        if let Some(handle) = metrics_handle {
            let metrics_addr = format!("0.0.0.0:{}", settings.metrics_port);
            let listener = TcpListener::bind(&metrics_addr)
                .await
                .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
            info!(addr = %metrics_addr, "Serving metrics");
            let metrics_app = axum::Router::new().route(
                "/metrics",
                axum::routing::get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, metrics_app).await {
                    error!(error = %e, "Metrics server error");
                }
            });
        }
    }

    let app = mindmux::build_app(state);
    let addr = format!("0.0.0.0:{}", settings.orchestrator_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
