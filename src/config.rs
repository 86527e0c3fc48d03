//! Configuration: environment settings and the predefined model catalog.

use crate::types::{DeploySpec, ModelRecord, ModelType, Quantization};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Deployment environment, from the `ENVIRONMENT` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

/// Process-wide settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Admin username for password login.
    pub auth_username: String,
    /// Encoded password hash: `pbkdf2_sha256:{salt_b64}:{hash_b64}:{iterations}`.
    pub auth_password_hash: String,
    /// HMAC secret for session tokens. Should be at least 32 bytes.
    pub jwt_secret: String,
    /// Session lifetime in hours.
    pub session_timeout_hours: u64,
    /// HuggingFace token passed through to engine containers.
    pub hf_token: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub environment: Environment,
    /// Front-proxy port; advisory only, the proxy owns its own listener.
    pub nginx_port: u16,

    /// Port the orchestrator's HTTP surface listens on.
    pub orchestrator_port: u16,
    /// Prometheus scrape port (0 to disable).
    pub metrics_port: u16,

    /// Inference engine container image.
    pub engine_image: String,
    /// Port the engine listens on inside its container.
    pub engine_port: u16,
    /// User-defined bridge network shared by all platform containers.
    pub network: String,
    /// Name of the front-proxy container that receives the reload signal.
    pub gateway_container: String,
    /// Path where the generated reverse-proxy include file is written.
    pub router_file: PathBuf,
    /// Path to the predefined model catalog (models.json).
    pub catalog_path: PathBuf,

    /// HuggingFace hub cache inside containers (and for cache scans).
    pub hf_cache_dir: String,
    /// Host-side cache directory mounted into engine containers.
    pub host_cache_dir: String,
    /// Host-side model directory mounted into engine containers.
    pub host_models_dir: String,
    /// Mount point of the model directory inside containers.
    pub models_dir: String,

    /// Hard deadline for a single deploy, including weight download.
    pub deploy_timeout_secs: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let environment = match env_or("ENVIRONMENT", "development").as_str() {
            "production" => Environment::Production,
            _ => Environment::Development,
        };

        Settings {
            auth_username: env_or("AUTH_USERNAME", "admin"),
            auth_password_hash: env_or("AUTH_PASSWORD_HASH", ""),
            jwt_secret: env_or("JWT_SECRET", "change-this-secret-key-in-production"),
            session_timeout_hours: env_parse("SESSION_TIMEOUT", 24),
            hf_token: env_or("HF_TOKEN", ""),
            redis_host: env_or("REDIS_HOST", "redis"),
            redis_port: env_parse("REDIS_PORT", 6379),
            environment,
            nginx_port: env_parse("NGINX_PORT", 80),
            orchestrator_port: env_parse("ORCHESTRATOR_PORT", 8001),
            metrics_port: env_parse("METRICS_PORT", 9090),
            engine_image: env_or("ENGINE_IMAGE", "vllm/vllm-openai:latest"),
            engine_port: 8000,
            network: env_or("NETWORK_NAME", "mind_llm-network"),
            gateway_container: env_or("NGINX_CONTAINER", "MIND_API_GATEWAY"),
            router_file: PathBuf::from(env_or(
                "ROUTER_FILE",
                "/nginx-config/model_routes.conf",
            )),
            catalog_path: PathBuf::from(env_or("MODELS_CONFIG_PATH", "./models.json")),
            hf_cache_dir: env_or("HF_CACHE_DIR", "/root/.cache/huggingface/hub"),
            host_cache_dir: env_or("HOST_CACHE_DIR", "~/.cache"),
            host_models_dir: env_or("HOST_MODELS_DIR", "./models"),
            models_dir: env_or("MODELS_DIR", "/models"),
            deploy_timeout_secs: env_parse("DEPLOY_TIMEOUT", 1200),
        }
    }

    /// Validate settings, warning about common misconfigurations.
    ///
    /// In production a default JWT secret or missing password hash is fatal.
    pub fn validate(&self) {
        let default_secret = self.jwt_secret == "change-this-secret-key-in-production";
        if default_secret || self.jwt_secret.len() < 32 {
            match self.environment {
                Environment::Production => {
                    tracing::error!(
                        "JWT_SECRET is unset or shorter than 32 bytes. \
                         Set a strong secret before running in production."
                    );
                    std::process::exit(1);
                }
                Environment::Development => {
                    warn!("JWT_SECRET is unset or weak; fine for development only");
                }
            }
        }

        if self.auth_password_hash.is_empty() {
            match self.environment {
                Environment::Production => {
                    tracing::error!(
                        "AUTH_PASSWORD_HASH is not set. Generate one with `mindmux hash-password`."
                    );
                    std::process::exit(1);
                }
                Environment::Development => {
                    warn!("AUTH_PASSWORD_HASH is not set; login will always fail");
                }
            }
        }
    }
}

/// Recommended engine tunables attached to a catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendedSettings {
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
}

/// One entry of the predefined model catalog (models.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub abbr: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub quantization: Option<Quantization>,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    /// Approximate VRAM requirement used for the placement check.
    #[serde(default)]
    pub recommended_vram_mb: Option<u64>,
    #[serde(default)]
    pub recommended_settings: Option<RecommendedSettings>,
    #[serde(default)]
    pub description: Option<String>,
}

/// File shape of models.json.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    predefined_models: Vec<CatalogEntry>,
}

/// Read-only catalog of deployable models, used to validate and enrich
/// deploy requests and to resolve types during reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse catalog: {}", path.display()))?;

        info!(
            path = %path.display(),
            models = file.predefined_models.len(),
            "Loaded model catalog"
        );
        Ok(Self::from_entries(file.predefined_models))
    }

    /// Load the catalog, falling back to an empty one when the file is absent.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Catalog unavailable, starting empty");
                Catalog::default()
            }
        }
    }

    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        Catalog {
            entries: entries.into_iter().map(|e| (e.abbr.clone(), e)).collect(),
        }
    }

    pub fn get(&self, abbr: &str) -> Option<&CatalogEntry> {
        self.entries.get(abbr)
    }

    pub fn entries(&self) -> Vec<&CatalogEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.abbr.cmp(&b.abbr));
        entries
    }

    /// Merge a deploy request with the catalog entry and type defaults into
    /// the effective settings a record is created with.
    ///
    /// Catalog values win over request values; anything still unset falls
    /// back to quantization/type/size heuristics.
    pub fn resolve(&self, spec: &DeploySpec) -> ResolvedSpec {
        let entry = self.entries.get(&spec.abbr);

        let quantization = entry
            .and_then(|e| e.quantization)
            .or(spec.quantization)
            .unwrap_or_default();
        let model_type = entry.map(|e| e.model_type).unwrap_or(spec.model_type);

        let mut gpu_memory_utilization = entry
            .and_then(|e| e.recommended_settings.as_ref())
            .and_then(|r| r.gpu_memory_utilization)
            .or(spec.gpu_memory_utilization);
        let mut max_model_len = entry.and_then(|e| e.max_model_len).or(spec.max_model_len);
        let mut max_num_seqs = entry
            .and_then(|e| e.recommended_settings.as_ref())
            .and_then(|r| r.max_num_seqs)
            .or(spec.max_num_seqs);

        // Heuristic defaults when neither request nor catalog pins a value.
        if !quantization.is_none() {
            gpu_memory_utilization.get_or_insert(0.25);
            max_model_len.get_or_insert(2048);
            max_num_seqs.get_or_insert(256);
        } else if model_type == ModelType::Embedding {
            gpu_memory_utilization.get_or_insert(0.05);
            max_model_len.get_or_insert(512);
            max_num_seqs.get_or_insert(1024);
        } else {
            let lower = spec.name.to_lowercase();
            if lower.contains("7b") {
                gpu_memory_utilization.get_or_insert(0.5);
                max_num_seqs.get_or_insert(128);
            } else if lower.contains("13b") {
                gpu_memory_utilization.get_or_insert(0.7);
                max_num_seqs.get_or_insert(64);
            }
        }

        ResolvedSpec {
            model_type,
            quantization,
            max_model_len: max_model_len.unwrap_or(4096),
            gpu_memory_utilization: gpu_memory_utilization.unwrap_or(0.9),
            max_num_seqs: max_num_seqs.unwrap_or(256),
            recommended_vram_mb: entry.and_then(|e| e.recommended_vram_mb),
        }
    }
}

/// Effective deploy settings after catalog merge.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub model_type: ModelType,
    pub quantization: Quantization,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f64,
    pub max_num_seqs: u32,
    pub recommended_vram_mb: Option<u64>,
}

/// Build the inference engine's command line for a record.
///
/// Small and quantized models run eager to skip graph capture; full LLMs get
/// prefix caching and chunked prefill.
pub fn engine_args(record: &ModelRecord, download_dir: &str) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        record.name.clone(),
        "--served-model-name".to_string(),
        record.abbr.clone(),
        "--max-model-len".to_string(),
        record.max_model_len.to_string(),
        "--gpu-memory-utilization".to_string(),
        record.gpu_memory_utilization.to_string(),
        "--max-num-seqs".to_string(),
        record.max_num_seqs.to_string(),
        "--port".to_string(),
        record.port.to_string(),
        "--host".to_string(),
        "0.0.0.0".to_string(),
        "--download-dir".to_string(),
        download_dir.to_string(),
    ];

    if !record.quantization.is_none() {
        args.push("--quantization".to_string());
        args.push(record.quantization.as_str().to_string());
    }

    let lower = record.name.to_lowercase();
    let use_eager =
        !record.quantization.is_none() || lower.contains("1.5b") || lower.contains("3b");
    if use_eager {
        args.push("--enforce-eager".to_string());
    }

    if record.model_type == ModelType::Llm && !use_eager {
        args.push("--enable-prefix-caching".to_string());
        args.push("--enable-chunked-prefill".to_string());
    }

    args
}
