//! Administrative HTTP surface, served under `/orchestrator`.
//!
//! | Method | Path                     | Auth    | Description                     |
//! |--------|--------------------------|---------|---------------------------------|
//! | POST   | `/auth/login`            | public  | Password login → session token  |
//! | GET    | `/auth/verify`           | session | Token check                     |
//! | GET    | `/health`                | public  | Liveness                        |
//! | GET    | `/gpu-stats`             | public  | GPU samples + processes         |
//! | GET    | `/models`                | public  | All model records (no secrets)  |
//! | GET    | `/available-models`      | public  | Predefined catalog              |
//! | GET    | `/cached-models`         | public  | HuggingFace cache scan          |
//! | POST   | `/models/deploy`         | session | Deploy a model                  |
//! | POST   | `/models/{abbr}/start`   | session | Restart a stopped model         |
//! | POST   | `/models/{abbr}/stop`    | session | Stop a running model            |
//! | DELETE | `/models/{abbr}`         | session | Delete model + container        |
//! | GET    | `/models/{abbr}/logs`    | session | Tail container logs             |
//! | GET    | `/api-keys`              | session | List key metadata               |
//! | POST   | `/api-keys`              | session | Mint a key (full key shown once)|
//! | DELETE | `/api-keys/{key}`        | session | Revoke by full key or prefix    |

use crate::AppState;
use crate::auth::{self, Username};
use crate::error::OrchestratorError;
use crate::types::{DeploySpec, ModelStatus, now_ms};
use axum::extract::{Extension, Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};

/// Build the admin router (paths relative to `/orchestrator`).
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/login", post(login))
        .route("/health", get(health))
        .route("/gpu-stats", get(gpu_stats))
        .route("/models", get(list_models))
        .route("/available-models", get(available_models))
        .route("/cached-models", get(cached_models));

    let protected = Router::new()
        .route("/auth/verify", get(verify_auth))
        .route("/models/deploy", post(deploy_model))
        .route("/models/{abbr}/start", post(start_model))
        .route("/models/{abbr}/stop", post(stop_model))
        .route("/models/{abbr}", delete(delete_model))
        .route("/models/{abbr}/logs", get(model_logs))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/{key}", delete(delete_api_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    public.merge(protected).with_state(state)
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<Value>, OrchestratorError> {
    let settings = &state.settings;
    let authenticated = body.username == settings.auth_username
        && auth::verify_password(&body.password, &settings.auth_password_hash);
    if !authenticated {
        return Err(OrchestratorError::Auth);
    }

    let (token, expires_at) = auth::issue_session(
        &body.username,
        &settings.jwt_secret,
        settings.session_timeout_hours,
    );
    Ok(Json(json!({ "token": token, "expires_at": expires_at })))
}

async fn verify_auth(Extension(Username(username)): Extension<Username>) -> Json<Value> {
    Json(json!({ "authenticated": true, "username": username }))
}

// ---------------------------------------------------------------------------
// Status and information
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn gpu_stats(State(state): State<AppState>) -> Result<Json<Value>, OrchestratorError> {
    let snapshot = state.gpu.snapshot();
    let records = state.deployer.get_all().await?;

    let gpus: Vec<Value> = snapshot
        .gpus
        .iter()
        .map(|gpu| {
            let models: Vec<Value> = records
                .iter()
                .filter(|r| r.status == ModelStatus::Running && r.gpu_device == gpu.index)
                .map(|r| {
                    json!({
                        "abbr": r.abbr,
                        "name": r.name,
                        "type": r.model_type,
                    })
                })
                .collect();

            let mut value = serde_json::to_value(gpu).expect("gpu sample serialize");
            value["models"] = Value::Array(models);
            value
        })
        .collect();

    let processes: serde_json::Map<String, Value> = snapshot
        .processes
        .iter()
        .map(|(index, procs)| {
            (
                index.to_string(),
                serde_json::to_value(procs).expect("gpu process serialize"),
            )
        })
        .collect();

    Ok(Json(json!({
        "gpus": gpus,
        "processes": processes,
        "degraded": snapshot.degraded,
    })))
}

async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::types::ModelRecord>>, OrchestratorError> {
    let mut records = state.deployer.get_all().await?;

    // Opportunistic cache enrichment; absent cache dir leaves fields unset.
    let cached = crate::cache::scan(&state.settings.hf_cache_dir);
    for record in &mut records {
        if let Some(hit) = cached.iter().find(|c| c.name == record.name) {
            record.cached = Some(true);
            record.cache_size_mb = Some(hit.size_mb);
        }
    }

    Ok(Json(records))
}

async fn available_models(
    State(state): State<AppState>,
) -> Json<Vec<crate::config::CatalogEntry>> {
    Json(state.catalog.entries().into_iter().cloned().collect())
}

async fn cached_models(State(state): State<AppState>) -> Json<Vec<crate::cache::CachedModel>> {
    Json(crate::cache::scan(&state.settings.hf_cache_dir))
}

// ---------------------------------------------------------------------------
// Model lifecycle
// ---------------------------------------------------------------------------

async fn deploy_model(
    State(state): State<AppState>,
    Json(spec): Json<DeploySpec>,
) -> Result<Json<crate::types::ModelRecord>, OrchestratorError> {
    let record = state.deployer.deploy(spec).await?;
    Ok(Json(record))
}

async fn start_model(
    State(state): State<AppState>,
    Path(abbr): Path<String>,
) -> Result<Json<crate::types::ModelRecord>, OrchestratorError> {
    let record = state.deployer.start(&abbr).await?;
    Ok(Json(record))
}

async fn stop_model(
    State(state): State<AppState>,
    Path(abbr): Path<String>,
) -> Result<Json<crate::types::ModelRecord>, OrchestratorError> {
    let record = state.deployer.stop(&abbr).await?;
    Ok(Json(record))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(abbr): Path<String>,
) -> Result<Json<Value>, OrchestratorError> {
    state.deployer.delete(&abbr).await?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn model_logs(
    State(state): State<AppState>,
    Path(abbr): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, OrchestratorError> {
    let record = state
        .deployer
        .get(&abbr)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("model {}", abbr)))?;

    let logs = state
        .deployer
        .runtime()
        .logs(&record.container_name, query.lines.unwrap_or(50))
        .await?;
    Ok(Json(json!({ "abbr": abbr, "logs": logs })))
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

async fn list_api_keys(
    State(state): State<AppState>,
) -> Result<Json<Vec<crate::types::ApiKeyRecord>>, OrchestratorError> {
    let keys: Vec<_> = state
        .store
        .list_api_keys()
        .await?
        .into_iter()
        .map(|(_, record)| record)
        .collect();
    Ok(Json(keys))
}

#[derive(Deserialize)]
struct CreateKeyQuery {
    name: Option<String>,
    description: Option<String>,
}

async fn create_api_key(
    State(state): State<AppState>,
    Query(query): Query<CreateKeyQuery>,
) -> Result<Json<Value>, OrchestratorError> {
    let name = query
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| OrchestratorError::field("name", "name is required"))?;

    let minted = auth::mint_key();
    let record = crate::types::ApiKeyRecord {
        name: name.clone(),
        prefix: minted.prefix.clone(),
        description: query.description.unwrap_or_default(),
        created_at: now_ms(),
        last_used_at: None,
    };
    state.store.put_api_key(&minted.hash, &record).await?;

    // The only response that ever carries the full key.
    Ok(Json(json!({
        "api_key": minted.full_key,
        "name": name,
        "prefix": minted.prefix,
    })))
}

async fn delete_api_key(
    State(state): State<AppState>,
    Path(key_or_prefix): Path<String>,
) -> Result<Json<Value>, OrchestratorError> {
    // Full keys revoke by hash; an 8-char prefix falls back to a scan.
    if key_or_prefix.len() > 8
        && state
            .store
            .delete_api_key(&auth::hash_key(&key_or_prefix))
            .await?
    {
        return Ok(Json(json!({ "deleted": true })));
    }

    let keys = state.store.list_api_keys().await?;
    let hash = keys
        .into_iter()
        .find(|(_, record)| record.prefix == key_or_prefix)
        .map(|(hash, _)| hash)
        .ok_or_else(|| OrchestratorError::NotFound("api key".to_string()))?;

    state.store.delete_api_key(&hash).await?;
    Ok(Json(json!({ "deleted": true })))
}
