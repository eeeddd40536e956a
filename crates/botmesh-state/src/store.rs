//! The persistence collaborator: idempotent upserts and point lookups by
//! natural key, grouped by entity name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use botmesh_protocol::{IdentityDirectory, ProtocolError};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::StateError;

pub const IDENTITY_MAP_ENTITY: &str = "identity_map";
pub const IDENTITY_REVERSE_ENTITY: &str = "identity_reverse";
pub const IDENTITY_SEQ_ENTITY: &str = "identity_seq";

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace the record under `(entity, key)`.
    async fn upsert(&self, entity: &str, key: &str, value: Value) -> Result<(), StateError>;

    async fn get(&self, entity: &str, key: &str) -> Result<Option<Value>, StateError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert(&self, entity: &str, key: &str, value: Value) -> Result<(), StateError> {
        self.entities
            .write()
            .await
            .entry(entity.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, entity: &str, key: &str) -> Result<Option<Value>, StateError> {
        Ok(self
            .entities
            .read()
            .await
            .get(entity)
            .and_then(|records| records.get(key))
            .cloned())
    }
}

/// [`IdentityDirectory`] kept in a [`Store`].
///
/// Forward and reverse mappings are separate entities so both directions
/// are point lookups; the highest number per platform lives in
/// `identity_seq`.
pub struct StoreIdentityDirectory {
    store: Arc<dyn Store>,
}

impl StoreIdentityDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

fn identity_err(e: StateError) -> ProtocolError {
    ProtocolError::Identity(e.to_string())
}

#[async_trait]
impl IdentityDirectory for StoreIdentityDirectory {
    async fn lookup(&self, platform: &str, opaque_id: &str) -> Result<Option<i64>, ProtocolError> {
        let value = self
            .store
            .get(IDENTITY_MAP_ENTITY, &format!("{platform}:{opaque_id}"))
            .await
            .map_err(identity_err)?;
        Ok(value.and_then(|v| v.as_i64()))
    }

    async fn reverse_lookup(&self, platform: &str, numeric_id: i64) -> Result<Option<String>, ProtocolError> {
        let value = self
            .store
            .get(IDENTITY_REVERSE_ENTITY, &format!("{platform}:{numeric_id}"))
            .await
            .map_err(identity_err)?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn highest_assigned(&self, platform: &str) -> Result<Option<i64>, ProtocolError> {
        let value = self
            .store
            .get(IDENTITY_SEQ_ENTITY, platform)
            .await
            .map_err(identity_err)?;
        Ok(value.and_then(|v| v.as_i64()))
    }

    async fn create(&self, platform: &str, opaque_id: &str, numeric_id: i64) -> Result<(), ProtocolError> {
        self.store
            .upsert(IDENTITY_MAP_ENTITY, &format!("{platform}:{opaque_id}"), Value::from(numeric_id))
            .await
            .map_err(identity_err)?;
        self.store
            .upsert(IDENTITY_REVERSE_ENTITY, &format!("{platform}:{numeric_id}"), Value::from(opaque_id))
            .await
            .map_err(identity_err)?;

        let highest = self.highest_assigned(platform).await?.unwrap_or(numeric_id);
        self.store
            .upsert(IDENTITY_SEQ_ENTITY, platform, Value::from(highest.max(numeric_id)))
            .await
            .map_err(identity_err)
    }
}
