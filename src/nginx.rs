//! Router generator.
//!
//! Emits the reverse-proxy include file from the set of running models and
//! signals the front proxy to reload. The file is a pure function of that
//! set: identical state renders byte-identical output. Writes go to a temp
//! file and are atomically renamed; a failed reload signal is logged but the
//! write is still considered durable.

use crate::error::OrchestratorError;
use crate::runtime::ContainerRuntime;
use crate::store::StateStore;
use crate::types::{ModelRecord, ModelStatus};
use metrics::counter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RouterGenerator {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    path: PathBuf,
    gateway_container: String,
    engine_port: u16,
}

impl RouterGenerator {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        path: PathBuf,
        gateway_container: String,
        engine_port: u16,
    ) -> Self {
        Self {
            store,
            runtime,
            path,
            gateway_container,
            engine_port,
        }
    }

    /// Render the include file for a set of records. Only `running` models
    /// are emitted, in `abbr` order.
    pub fn render(models: &[ModelRecord], engine_port: u16) -> String {
        let mut running: Vec<&ModelRecord> = models
            .iter()
            .filter(|m| m.status == ModelStatus::Running)
            .collect();
        running.sort_by(|a, b| a.abbr.cmp(&b.abbr));

        let mut out = String::from("\n# Auto-generated model routing configuration\n");
        for model in running {
            out.push_str(&render_model(model, engine_port));
        }
        out
    }

    /// Regenerate the include file from the state store and signal the proxy.
    ///
    /// Reload failure does not fail the regeneration: the write is durable
    /// and the next lifecycle event retries the signal.
    pub async fn regenerate(&self) -> Result<(), OrchestratorError> {
        self.write_file().await?;
        if let Err(e) = self.reload().await {
            warn!(container = %self.gateway_container, error = %e, "Proxy reload signal failed");
        }
        Ok(())
    }

    /// Regenerate and require the reload signal to succeed.
    ///
    /// Used once per deploy: a model only transitions to `running` if it is
    /// actually reachable through the proxy.
    pub async fn regenerate_strict(&self) -> Result<(), OrchestratorError> {
        self.write_file().await?;
        self.reload()
            .await
            .map_err(|e| OrchestratorError::Upstream(format!("proxy reload failed: {}", e)))
    }

    /// Render from the state store and write with temp-file + atomic rename.
    async fn write_file(&self) -> Result<(), OrchestratorError> {
        let models = self.store.list_models().await?;
        let running = models
            .iter()
            .filter(|m| m.status == ModelStatus::Running)
            .count();
        let contents = Self::render(&models, self.engine_port);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::Internal(format!(
                    "create router dir {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // Temp file in the same directory so the rename stays atomic.
        let tmp = self.path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, contents.as_bytes())
            .await
            .map_err(|e| {
                OrchestratorError::Internal(format!("write router file {}: {}", tmp.display(), e))
            })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            OrchestratorError::Internal(format!(
                "rename router file to {}: {}",
                self.path.display(),
                e
            ))
        })?;

        counter!("mindmux_router_regenerations_total").increment(1);
        info!(path = %self.path.display(), models = running, "Router file regenerated");
        Ok(())
    }

    async fn reload(&self) -> Result<(), crate::runtime::RuntimeError> {
        self.runtime
            .exec(&self.gateway_container, &["nginx", "-s", "reload"])
            .await
            .inspect_err(|_| {
                counter!("mindmux_router_reload_failures_total").increment(1);
            })
    }
}

fn render_model(model: &ModelRecord, engine_port: u16) -> String {
    let abbr = &model.abbr;
    let container = &model.container_name;

    format!(
        r#"
# Model: {abbr} (OpenAI-compatible API)

# Route chat/completions through the orchestrator for context management
location = /api/v1/{abbr}/chat/completions {{
    proxy_pass http://orchestrator/api/v1/{abbr}/chat/completions;
    proxy_set_header Host $host;
    proxy_set_header X-Real-IP $remote_addr;
    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;

    # CORS headers for browser access
    add_header 'Access-Control-Allow-Origin' '*' always;
    add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS' always;
    add_header 'Access-Control-Allow-Headers' 'Authorization, Content-Type, X-API-Key' always;

    # Handle preflight requests
    if ($request_method = 'OPTIONS') {{
        add_header 'Access-Control-Allow-Origin' '*';
        add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS';
        add_header 'Access-Control-Allow-Headers' 'Authorization, Content-Type, X-API-Key';
        add_header 'Access-Control-Max-Age' 1728000;
        add_header 'Content-Type' 'text/plain; charset=utf-8';
        add_header 'Content-Length' 0;
        return 204;
    }}

    # SSE support for streaming
    proxy_set_header Connection '';
    proxy_http_version 1.1;
    chunked_transfer_encoding off;
    proxy_buffering off;
    proxy_cache off;
    proxy_read_timeout 300s;
    proxy_send_timeout 300s;
}}

# Route all other endpoints directly to the model container
location /api/v1/{abbr}/ {{
    proxy_pass http://{container}:{engine_port}/v1/;
    proxy_set_header Host $host;
    proxy_set_header X-Real-IP $remote_addr;
    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;

    # CORS headers for browser access
    add_header 'Access-Control-Allow-Origin' '*' always;
    add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS' always;
    add_header 'Access-Control-Allow-Headers' 'Authorization, Content-Type, X-API-Key' always;

    # Handle preflight requests
    if ($request_method = 'OPTIONS') {{
        add_header 'Access-Control-Allow-Origin' '*';
        add_header 'Access-Control-Allow-Methods' 'GET, POST, OPTIONS';
        add_header 'Access-Control-Allow-Headers' 'Authorization, Content-Type, X-API-Key';
        add_header 'Access-Control-Max-Age' 1728000;
        add_header 'Content-Type' 'text/plain; charset=utf-8';
        add_header 'Content-Length' 0;
        return 204;
    }}

    # SSE support for streaming
    proxy_set_header Connection '';
    proxy_http_version 1.1;
    chunked_transfer_encoding off;
    proxy_buffering off;
    proxy_cache off;
    proxy_read_timeout 300s;
    proxy_send_timeout 300s;
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelType, Quantization};

    fn record(abbr: &str, status: ModelStatus) -> ModelRecord {
        ModelRecord {
            abbr: abbr.to_string(),
            name: format!("org/{}", abbr),
            model_type: ModelType::Llm,
            quantization: Quantization::None,
            max_model_len: 4096,
            gpu_memory_utilization: 0.9,
            max_num_seqs: 256,
            gpu_device: 0,
            port: 8000,
            endpoint: ModelRecord::endpoint_for(abbr),
            status,
            progress: 100,
            progress_message: String::new(),
            container_name: ModelRecord::container_name_for(abbr),
            container_id: "id".to_string(),
            cache_size_mb: None,
            cached: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_render_only_running_models() {
        let models = vec![
            record("stopped-model", ModelStatus::Stopped),
            record("qwen1.5b", ModelStatus::Running),
            record("deploying-model", ModelStatus::Deploying),
        ];

        let out = RouterGenerator::render(&models, 8000);
        assert!(out.contains("location = /api/v1/qwen1.5b/chat/completions"));
        assert!(out.contains("location /api/v1/qwen1.5b/"));
        assert!(out.contains("proxy_pass http://MIND_MODEL_qwen1.5b:8000/v1/;"));
        assert!(!out.contains("stopped-model"));
        assert!(!out.contains("deploying-model"));
    }

    #[test]
    fn test_render_exactly_two_location_blocks_per_model() {
        let models = vec![record("qwen1.5b", ModelStatus::Running)];
        let out = RouterGenerator::render(&models, 8000);
        assert_eq!(out.matches("location ").count(), 2);
    }

    #[test]
    fn test_render_is_byte_stable() {
        let models = vec![
            record("zephyr", ModelStatus::Running),
            record("bge-m3", ModelStatus::Running),
        ];
        // Reversed input order must not change the output.
        let reversed: Vec<ModelRecord> = models.iter().rev().cloned().collect();

        let a = RouterGenerator::render(&models, 8000);
        let b = RouterGenerator::render(&reversed, 8000);
        assert_eq!(a, b);
        // bge-m3 sorts before zephyr.
        assert!(a.find("bge-m3").unwrap() < a.find("zephyr").unwrap());
    }

    #[test]
    fn test_render_empty_state() {
        let out = RouterGenerator::render(&[], 8000);
        assert_eq!(out, "\n# Auto-generated model routing configuration\n");
    }
}
