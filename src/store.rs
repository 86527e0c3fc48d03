//! State store adapter.
//!
//! Thin typed façade over the external KV store. Key layout:
//!
//! - `model:{abbr}` → hash of flat string-encoded [`ModelRecord`] fields
//! - `gpu_assignment:{abbr}` → GPU index (redundant with `model:`, kept for
//!   back-compat scans)
//! - `apikey:{hash}` → hash of [`ApiKeyRecord`] fields
//!
//! Only the deployment engine and the reconciler write model records, and
//! only under the per-`abbr` lock; reads are lock-free snapshots.

use crate::types::{ApiKeyRecord, ModelRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::warn;

/// Errors from the state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed record for {0}")]
    Encoding(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Durable map for model records, GPU assignments, and API keys.
///
/// Implemented by [`RedisStore`] in production and [`MemoryStore`] in tests.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_model(&self, abbr: &str) -> Result<Option<ModelRecord>, StoreError>;
    async fn put_model(&self, record: &ModelRecord) -> Result<(), StoreError>;
    /// Partial field update of an existing record hash.
    async fn update_model(&self, abbr: &str, fields: &[(String, String)])
    -> Result<(), StoreError>;
    /// Delete a record and its GPU assignment. Returns false when absent.
    async fn delete_model(&self, abbr: &str) -> Result<bool, StoreError>;
    async fn list_models(&self) -> Result<Vec<ModelRecord>, StoreError>;
    async fn set_gpu_assignment(&self, abbr: &str, gpu: u32) -> Result<(), StoreError>;

    async fn put_api_key(&self, hash: &str, record: &ApiKeyRecord) -> Result<(), StoreError>;
    async fn get_api_key(&self, hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;
    /// All keys as `(hash, record)` pairs, sorted by creation time.
    async fn list_api_keys(&self) -> Result<Vec<(String, ApiKeyRecord)>, StoreError>;
    async fn delete_api_key(&self, hash: &str) -> Result<bool, StoreError>;
    async fn touch_api_key(&self, hash: &str, ts: i64) -> Result<(), StoreError>;
}

fn model_key(abbr: &str) -> String {
    format!("model:{}", abbr)
}

fn assignment_key(abbr: &str) -> String {
    format!("gpu_assignment:{}", abbr)
}

fn apikey_key(hash: &str) -> String {
    format!("apikey:{}", hash)
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Redis-backed store using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{}:{}/", host, port))?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_model(&self, abbr: &str) -> Result<Option<ModelRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(model_key(abbr)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        ModelRecord::from_fields(&fields)
            .map(Some)
            .ok_or_else(|| StoreError::Encoding(abbr.to_string()))
    }

    async fn put_model(&self, record: &ModelRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let fields = record.to_fields();
        let _: () = conn.hset_multiple(model_key(&record.abbr), &fields).await?;
        Ok(())
    }

    async fn update_model(
        &self,
        abbr: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(model_key(abbr), fields).await?;
        Ok(())
    }

    async fn delete_model(&self, abbr: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(model_key(abbr)).await?;
        let _: i64 = conn.del(assignment_key(abbr)).await?;
        Ok(removed > 0)
    }

    async fn list_models(&self) -> Result<Vec<ModelRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("model:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let fields: HashMap<String, String> = conn.hgetall(&key).await?;
            match ModelRecord::from_fields(&fields) {
                Some(record) => records.push(record),
                None => warn!(key = %key, "Skipping malformed model record"),
            }
        }
        records.sort_by(|a, b| a.abbr.cmp(&b.abbr));
        Ok(records)
    }

    async fn set_gpu_assignment(&self, abbr: &str, gpu: u32) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(assignment_key(abbr), gpu.to_string()).await?;
        Ok(())
    }

    async fn put_api_key(&self, hash: &str, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let fields = record.to_fields();
        let _: () = conn.hset_multiple(apikey_key(hash), &fields).await?;
        Ok(())
    }

    async fn get_api_key(&self, hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(apikey_key(hash)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(ApiKeyRecord::from_fields(&fields))
    }

    async fn list_api_keys(&self) -> Result<Vec<(String, ApiKeyRecord)>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys("apikey:*").await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let fields: HashMap<String, String> = conn.hgetall(&key).await?;
            let hash = key.trim_start_matches("apikey:").to_string();
            match ApiKeyRecord::from_fields(&fields) {
                Some(record) => records.push((hash, record)),
                None => warn!(key = %key, "Skipping malformed API key record"),
            }
        }
        records.sort_by_key(|(_, r)| r.created_at);
        Ok(records)
    }

    async fn delete_api_key(&self, hash: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(apikey_key(hash)).await?;
        Ok(removed > 0)
    }

    async fn touch_api_key(&self, hash: &str, ts: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(apikey_key(hash), "last_used_at", ts.to_string())
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store for tests and local development.
///
/// Persists the same flat field encoding as Redis so the encode/decode path
/// is exercised either way.
#[derive(Default)]
pub struct MemoryStore {
    models: DashMap<String, HashMap<String, String>>,
    assignments: DashMap<String, String>,
    api_keys: DashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_model(&self, abbr: &str) -> Result<Option<ModelRecord>, StoreError> {
        match self.models.get(abbr) {
            Some(fields) => ModelRecord::from_fields(&fields)
                .map(Some)
                .ok_or_else(|| StoreError::Encoding(abbr.to_string())),
            None => Ok(None),
        }
    }

    async fn put_model(&self, record: &ModelRecord) -> Result<(), StoreError> {
        self.models.insert(
            record.abbr.clone(),
            record.to_fields().into_iter().collect(),
        );
        Ok(())
    }

    async fn update_model(
        &self,
        abbr: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut entry = self.models.entry(abbr.to_string()).or_default();
        for (key, value) in fields {
            entry.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete_model(&self, abbr: &str) -> Result<bool, StoreError> {
        self.assignments.remove(abbr);
        Ok(self.models.remove(abbr).is_some())
    }

    async fn list_models(&self) -> Result<Vec<ModelRecord>, StoreError> {
        let mut records: Vec<ModelRecord> = self
            .models
            .iter()
            .filter_map(|entry| ModelRecord::from_fields(entry.value()))
            .collect();
        records.sort_by(|a, b| a.abbr.cmp(&b.abbr));
        Ok(records)
    }

    async fn set_gpu_assignment(&self, abbr: &str, gpu: u32) -> Result<(), StoreError> {
        self.assignments.insert(abbr.to_string(), gpu.to_string());
        Ok(())
    }

    async fn put_api_key(&self, hash: &str, record: &ApiKeyRecord) -> Result<(), StoreError> {
        self.api_keys
            .insert(hash.to_string(), record.to_fields().into_iter().collect());
        Ok(())
    }

    async fn get_api_key(&self, hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self
            .api_keys
            .get(hash)
            .and_then(|fields| ApiKeyRecord::from_fields(&fields)))
    }

    async fn list_api_keys(&self) -> Result<Vec<(String, ApiKeyRecord)>, StoreError> {
        let mut records: Vec<(String, ApiKeyRecord)> = self
            .api_keys
            .iter()
            .filter_map(|entry| {
                ApiKeyRecord::from_fields(entry.value()).map(|r| (entry.key().clone(), r))
            })
            .collect();
        records.sort_by_key(|(_, r)| r.created_at);
        Ok(records)
    }

    async fn delete_api_key(&self, hash: &str) -> Result<bool, StoreError> {
        Ok(self.api_keys.remove(hash).is_some())
    }

    async fn touch_api_key(&self, hash: &str, ts: i64) -> Result<(), StoreError> {
        if let Some(mut fields) = self.api_keys.get_mut(hash) {
            fields.insert("last_used_at".to_string(), ts.to_string());
        }
        Ok(())
    }
}
