//! Shared domain types used across the codebase.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reserved container name prefix. The reconciler's scan filter and the
/// router file both depend on this exact string.
pub const MODEL_CONTAINER_PREFIX: &str = "MIND_MODEL_";

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Check an `abbr` slug: `[a-z0-9._-]+`.
pub fn is_valid_abbr(abbr: &str) -> bool {
    !abbr.is_empty()
        && abbr
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Kind of model a container serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Llm => "llm",
            ModelType::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(ModelType::Llm),
            "embedding" => Some(ModelType::Embedding),
            _ => None,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight quantization scheme passed through to the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    None,
    Awq,
    Gptq,
}

impl Quantization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::None => "none",
            Quantization::Awq => "awq",
            Quantization::Gptq => "gptq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" | "" => Some(Quantization::None),
            "awq" => Some(Quantization::Awq),
            "gptq" => Some(Quantization::Gptq),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Quantization::None)
    }
}

/// Lifecycle state of a model record.
///
/// Transitions: absent → stopped → deploying → running → stopping → stopped,
/// with `error` reachable from deploying or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Stopped,
    Deploying,
    Running,
    Error,
    Stopping,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Stopped => "stopped",
            ModelStatus::Deploying => "deploying",
            ModelStatus::Running => "running",
            ModelStatus::Error => "error",
            ModelStatus::Stopping => "stopping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(ModelStatus::Stopped),
            "deploying" => Some(ModelStatus::Deploying),
            "running" => Some(ModelStatus::Running),
            "error" => Some(ModelStatus::Error),
            "stopping" => Some(ModelStatus::Stopping),
            _ => None,
        }
    }

    /// States that require a live container in the runtime.
    pub fn is_scheduled(&self) -> bool {
        matches!(
            self,
            ModelStatus::Running | ModelStatus::Deploying | ModelStatus::Stopping
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative record of a deployed model, keyed by `abbr` in the state
/// store (`model:{abbr}`). Persisted as a flat string-encoded hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub abbr: String,
    /// Upstream model identifier (HuggingFace ID or local path).
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub quantization: Quantization,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f64,
    pub max_num_seqs: u32,
    pub gpu_device: u32,
    /// Inference port inside the container.
    pub port: u16,
    pub endpoint: String,
    pub status: ModelStatus,
    pub progress: u8,
    pub progress_message: String,
    pub container_name: String,
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_size_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ModelRecord {
    /// Deterministic container name for an `abbr`.
    pub fn container_name_for(abbr: &str) -> String {
        format!("{}{}", MODEL_CONTAINER_PREFIX, abbr)
    }

    /// Public endpoint path for an `abbr`.
    pub fn endpoint_for(abbr: &str) -> String {
        format!("/api/v1/{}", abbr)
    }

    /// Encode to the flat string map stored in the KV hash.
    ///
    /// Optional fields encode as missing keys; `container_name` and
    /// `container_id` encode as empty strings when unscheduled.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("abbr".into(), self.abbr.clone()),
            ("name".into(), self.name.clone()),
            ("type".into(), self.model_type.as_str().into()),
            ("quantization".into(), self.quantization.as_str().into()),
            ("max_model_len".into(), self.max_model_len.to_string()),
            (
                "gpu_memory_utilization".into(),
                self.gpu_memory_utilization.to_string(),
            ),
            ("max_num_seqs".into(), self.max_num_seqs.to_string()),
            ("gpu_device".into(), self.gpu_device.to_string()),
            ("port".into(), self.port.to_string()),
            ("endpoint".into(), self.endpoint.clone()),
            ("status".into(), self.status.as_str().into()),
            ("progress".into(), self.progress.to_string()),
            ("progress_message".into(), self.progress_message.clone()),
            ("container_name".into(), self.container_name.clone()),
            ("container_id".into(), self.container_id.clone()),
            ("created_at".into(), self.created_at.to_string()),
            ("updated_at".into(), self.updated_at.to_string()),
        ];
        if let Some(size) = self.cache_size_mb {
            fields.push(("cache_size_mb".into(), size.to_string()));
        }
        if let Some(cached) = self.cached {
            fields.push(("cached".into(), cached.to_string()));
        }
        fields
    }

    /// Decode from the flat string map stored in the KV hash.
    ///
    /// Tolerates missing optional fields and fills derivable ones
    /// (`endpoint`, `container_name`) so records written by older builds
    /// still decode.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let abbr = fields.get("abbr")?.clone();
        let get = |key: &str| fields.get(key).map(String::as_str).unwrap_or("");
        let parse_u32 = |key: &str, default: u32| get(key).parse().unwrap_or(default);

        Some(ModelRecord {
            name: fields.get("name")?.clone(),
            model_type: ModelType::parse(get("type"))?,
            quantization: Quantization::parse(get("quantization")).unwrap_or_default(),
            max_model_len: parse_u32("max_model_len", 4096),
            gpu_memory_utilization: get("gpu_memory_utilization").parse().unwrap_or(0.9),
            max_num_seqs: parse_u32("max_num_seqs", 256),
            gpu_device: parse_u32("gpu_device", 0),
            port: get("port").parse().unwrap_or(8000),
            endpoint: fields
                .get("endpoint")
                .cloned()
                .unwrap_or_else(|| Self::endpoint_for(&abbr)),
            status: ModelStatus::parse(get("status"))?,
            progress: get("progress").parse().unwrap_or(0),
            progress_message: get("progress_message").to_string(),
            container_name: fields
                .get("container_name")
                .cloned()
                .unwrap_or_else(|| Self::container_name_for(&abbr)),
            container_id: get("container_id").to_string(),
            cache_size_mb: fields.get("cache_size_mb").and_then(|v| v.parse().ok()),
            cached: fields.get("cached").and_then(|v| v.parse().ok()),
            created_at: get("created_at").parse().unwrap_or(0),
            updated_at: get("updated_at").parse().unwrap_or(0),
            abbr,
        })
    }
}

/// Deployment intent submitted to `POST /orchestrator/models/deploy`.
///
/// Unset tunables are filled from the predefined catalog's recommended
/// settings, then from type/quantization defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    pub name: String,
    pub abbr: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub quantization: Option<Quantization>,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
    #[serde(default)]
    pub gpu_device: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// One GPU as reported by the vendor query tool. Volatile; refreshed at most
/// every 2 s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: f64,
    pub memory_used_mb: f64,
    pub memory_free_mb: f64,
    pub utilization_percent: f64,
    pub temperature_celsius: f64,
}

/// A process holding memory on a GPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub memory_mb: f64,
}

/// Stored metadata for an API key. The full key is never stored; the record
/// is keyed by `apikey:{sha256_hex(full_key)}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub name: String,
    /// First 8 characters of the full key, kept for display correlation.
    pub prefix: String,
    #[serde(default)]
    pub description: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
}

impl ApiKeyRecord {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("name".into(), self.name.clone()),
            ("prefix".into(), self.prefix.clone()),
            ("description".into(), self.description.clone()),
            ("created_at".into(), self.created_at.to_string()),
        ];
        if let Some(ts) = self.last_used_at {
            fields.push(("last_used_at".into(), ts.to_string()));
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(ApiKeyRecord {
            name: fields.get("name")?.clone(),
            prefix: fields.get("prefix")?.clone(),
            description: fields.get("description").cloned().unwrap_or_default(),
            created_at: fields.get("created_at")?.parse().ok()?,
            last_used_at: fields.get("last_used_at").and_then(|v| v.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ModelRecord {
        ModelRecord {
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
            progress_message: "Model ready".to_string(),
            container_name: "MIND_MODEL_qwen1.5b".to_string(),
            container_id: "abc123".to_string(),
            cache_size_mb: None,
            cached: None,
            created_at: 1,
            updated_at: 2,
        }
    }

    #[test]
    fn test_record_field_round_trip() {
        let original = record();
        let map: HashMap<String, String> = original.to_fields().into_iter().collect();
        let decoded = ModelRecord::from_fields(&map).unwrap();

        assert_eq!(decoded.abbr, original.abbr);
        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.status, ModelStatus::Running);
        assert_eq!(decoded.max_model_len, 2048);
        assert_eq!(decoded.gpu_device, 0);
        assert_eq!(decoded.container_name, "MIND_MODEL_qwen1.5b");
        assert_eq!(decoded.cache_size_mb, None);
    }

    #[test]
    fn test_record_fills_derivable_fields() {
        let mut map: HashMap<String, String> = record().to_fields().into_iter().collect();
        map.remove("endpoint");
        map.remove("container_name");

        let decoded = ModelRecord::from_fields(&map).unwrap();
        assert_eq!(decoded.endpoint, "/api/v1/qwen1.5b");
        assert_eq!(decoded.container_name, "MIND_MODEL_qwen1.5b");
    }

    #[test]
    fn test_abbr_validation() {
        assert!(is_valid_abbr("qwen1.5b"));
        assert!(is_valid_abbr("bge-m3"));
        assert!(is_valid_abbr("llama_70b"));
        assert!(!is_valid_abbr(""));
        assert!(!is_valid_abbr("Qwen"));
        assert!(!is_valid_abbr("has space"));
        assert!(!is_valid_abbr("slash/y"));
    }

    #[test]
    fn test_status_parse() {
        for status in [
            ModelStatus::Stopped,
            ModelStatus::Deploying,
            ModelStatus::Running,
            ModelStatus::Error,
            ModelStatus::Stopping,
        ] {
            assert_eq!(ModelStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ModelStatus::parse("unknown"), None);
    }
}
