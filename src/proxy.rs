//! Data-plane proxy.
//!
//! Fronts `/api/v1/{abbr}/…` behind API-key auth. Chat completions pass
//! through the context mediator, which truncates history and caps
//! `max_tokens` to the model's context window before forwarding; everything
//! else is forwarded verbatim. Streaming responses are passed through as
//! opaque SSE bytes; dropping the client connection drops the upstream body
//! and cancels the engine-side request.

use crate::AppState;
use crate::context::{self, ContextError};
use crate::error::OrchestratorError;
use crate::types::{ModelRecord, ModelStatus};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderValue, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::{counter, histogram};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Response header set when message history was truncated.
pub const TRUNCATION_HEADER: &str = "x-mind-context-truncated";

/// Idle deadline for reaching the engine (headers, not body).
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(300);

/// Resolves the base URL of a model's inference engine.
///
/// The production impl addresses containers by name on the platform bridge
/// network; tests substitute a loopback resolver.
pub trait Upstream: Send + Sync {
    fn base_url(&self, record: &ModelRecord) -> String;
}

/// Containers are reachable by name on the shared Docker network.
pub struct DockerNetworkUpstream {
    pub engine_port: u16,
}

impl Upstream for DockerNetworkUpstream {
    fn base_url(&self, record: &ModelRecord) -> String {
        format!("http://{}:{}", record.container_name, self.engine_port)
    }
}

pub type HttpClient = Client<HttpConnector, Body>;

pub fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// POST `/api/v1/{abbr}/chat/completions` — the context-mediated path.
pub async fn chat_completions(
    State(state): State<AppState>,
    Path(abbr): Path<String>,
    body: bytes::Bytes,
) -> Response<Body> {
    counter!("mindmux_requests_total").increment(1);
    let started = Instant::now();

    let result = mediate_chat(&state, &abbr, body).await;
    histogram!("mindmux_request_duration_seconds").record(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => response,
        Err(e) => openai_error(&e),
    }
}

async fn mediate_chat(
    state: &AppState,
    abbr: &str,
    body: bytes::Bytes,
) -> Result<Response<Body>, OrchestratorError> {
    let record = lookup_running(state, abbr).await?;

    let mut payload: Value = serde_json::from_slice(&body)
        .map_err(|_| OrchestratorError::validation("request body must be JSON"))?;
    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| OrchestratorError::field("messages", "messages must be an array"))?;
    let requested_max_tokens = payload
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|v| v as u32);

    let plan = context::plan(&messages, requested_max_tokens, record.max_model_len).map_err(
        |e| match e {
            ContextError::Empty => {
                OrchestratorError::field("messages", "messages must not be empty")
            }
            ContextError::BadContent { index } => OrchestratorError::field(
                "messages",
                format!("message {} content must be a string", index),
            ),
            overflow @ ContextError::Overflow { .. } => {
                counter!("mindmux_context_overflows_total").increment(1);
                OrchestratorError::ContextOverflow(overflow.to_string())
            }
        },
    )?;

    if plan.truncated {
        counter!("mindmux_context_truncations_total").increment(1);
        debug!(
            model = %abbr,
            kept = plan.messages.len(),
            original = messages.len(),
            max_tokens = plan.max_tokens,
            "Truncated chat context"
        );
    }

    let stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    payload["messages"] = Value::Array(plan.messages);
    payload["max_tokens"] = json!(plan.max_tokens);

    let url = format!(
        "{}/v1/chat/completions",
        state.upstream.base_url(&record)
    );
    let request = Request::builder()
        .method("POST")
        .uri(&url)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&payload).map_err(|e| {
            OrchestratorError::Internal(format!("encode upstream request: {}", e))
        })?))
        .map_err(|e| OrchestratorError::Internal(format!("build upstream request: {}", e)))?;

    let response = tokio::time::timeout(UPSTREAM_TIMEOUT, state.http.request(request))
        .await
        .map_err(|_| OrchestratorError::Upstream("engine request timed out".to_string()))?
        .map_err(|e| OrchestratorError::Upstream(format!("engine unreachable: {}", e)))?;

    let (mut parts, incoming) = response.into_parts();
    if plan.truncated {
        parts
            .headers
            .insert(TRUNCATION_HEADER, HeaderValue::from_static("true"));
    }

    // Streamed bodies are passed through as opaque SSE frames; only
    // non-streaming success envelopes get the diagnostic field injected.
    if stream || !plan.truncated {
        return Ok(Response::from_parts(parts, Body::new(incoming)));
    }

    let bytes = incoming
        .collect()
        .await
        .map_err(|e| OrchestratorError::Upstream(format!("engine response aborted: {}", e)))?
        .to_bytes();

    let body = match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut envelope) if parts.status.is_success() && envelope.is_object() => {
            envelope["context_truncated"] = json!(true);
            serde_json::to_vec(&envelope).unwrap_or_else(|_| bytes.to_vec())
        }
        // Error envelopes are forwarded verbatim.
        _ => bytes.to_vec(),
    };

    parts.headers.remove(CONTENT_LENGTH);
    Ok(Response::from_parts(parts, Body::from(body)))
}

/// Fallback for every other `/api/v1/{abbr}/{path}` endpoint (completions,
/// models, embeddings, …): forwarded to the engine's `/v1/` prefix.
pub async fn passthrough(
    State(state): State<AppState>,
    Path((abbr, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response<Body> {
    counter!("mindmux_requests_total").increment(1);
    match forward(&state, &abbr, &rest, request).await {
        Ok(response) => response,
        Err(e) => openai_error(&e),
    }
}

async fn forward(
    state: &AppState,
    abbr: &str,
    rest: &str,
    request: Request<Body>,
) -> Result<Response<Body>, OrchestratorError> {
    let record = lookup_running(state, abbr).await?;

    let (mut parts, body) = request.into_parts();
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let uri: Uri = format!("{}/v1/{}{}", state.upstream.base_url(&record), rest, query)
        .parse()
        .map_err(|e| OrchestratorError::validation(format!("bad upstream path: {}", e)))?;

    parts.uri = uri;
    parts.headers.remove(HOST);
    parts.headers.remove(AUTHORIZATION);
    parts.headers.remove("x-api-key");

    let response = tokio::time::timeout(
        UPSTREAM_TIMEOUT,
        state.http.request(Request::from_parts(parts, body)),
    )
    .await
    .map_err(|_| OrchestratorError::Upstream("engine request timed out".to_string()))?
    .map_err(|e| OrchestratorError::Upstream(format!("engine unreachable: {}", e)))?;

    let (resp_parts, resp_body) = response.into_parts();
    Ok(Response::from_parts(resp_parts, Body::new(resp_body)))
}

async fn lookup_running(state: &AppState, abbr: &str) -> Result<ModelRecord, OrchestratorError> {
    let record = state
        .store
        .get_model(abbr)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("model {}", abbr)))?;
    if record.status != ModelStatus::Running {
        return Err(OrchestratorError::ResourceExhausted(format!(
            "model {} is not running",
            abbr
        )));
    }
    Ok(record)
}

/// Synthesize an OpenAI-shaped error envelope for data-plane failures.
/// Forwarded engine errors never pass through here.
fn openai_error(err: &OrchestratorError) -> Response<Body> {
    let error_type = match err {
        OrchestratorError::Auth => "authentication_error",
        OrchestratorError::NotFound(_) => "not_found_error",
        OrchestratorError::Upstream(_) | OrchestratorError::Internal(_) => "server_error",
        OrchestratorError::ResourceExhausted(_) => "service_unavailable_error",
        _ => "invalid_request_error",
    };

    if matches!(err, OrchestratorError::Internal(_)) {
        error!(error = %err, "Data plane internal error");
    }

    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": error_type,
        }
    });

    Response::builder()
        .status(err.status())
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelType, Quantization};

    #[test]
    fn test_docker_network_upstream_url() {
        let record = ModelRecord {
            abbr: "qwen1.5b".to_string(),
            name: "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
            model_type: ModelType::Llm,
            quantization: Quantization::None,
            max_model_len: 2048,
            gpu_memory_utilization: 0.5,
            max_num_seqs: 256,
            gpu_device: 0,
            port: 8000,
            endpoint: "/api/v1/qwen1.5b".to_string(),
            status: ModelStatus::Running,
            progress: 100,
            progress_message: String::new(),
            container_name: "MIND_MODEL_qwen1.5b".to_string(),
            container_id: String::new(),
            cache_size_mb: None,
            cached: None,
            created_at: 0,
            updated_at: 0,
        };

        let upstream = DockerNetworkUpstream { engine_port: 8000 };
        assert_eq!(
            upstream.base_url(&record),
            "http://MIND_MODEL_qwen1.5b:8000"
        );
    }

    #[test]
    fn test_openai_error_shape() {
        let response = openai_error(&OrchestratorError::NotFound("model x".to_string()));
        assert_eq!(response.status(), 404);

        let response = openai_error(&OrchestratorError::ContextOverflow("too big".to_string()));
        assert_eq!(response.status(), 413);
    }
}
