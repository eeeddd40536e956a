//! Stable numeric identities for platforms that only hand out opaque,
//! per-application user and group identifiers.
//!
//! The mapping itself lives in an external directory (usually the
//! persistence layer); the resolver only decides when to look up and when to
//! allocate. Allocation is serialized so that two concurrent resolutions of a
//! new identifier cannot hand out two different numbers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::constants::VIRTUAL_ID_BASE;
use crate::message::InternalMessage;
use crate::ProtocolError;

/// Lookup/create functions provided by the persistence collaborator.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn lookup(&self, platform: &str, opaque_id: &str) -> Result<Option<i64>, ProtocolError>;

    async fn reverse_lookup(&self, platform: &str, numeric_id: i64)
        -> Result<Option<String>, ProtocolError>;

    /// Highest numeric ID handed out so far on this platform.
    async fn highest_assigned(&self, platform: &str) -> Result<Option<i64>, ProtocolError>;

    async fn create(&self, platform: &str, opaque_id: &str, numeric_id: i64)
        -> Result<(), ProtocolError>;
}

pub struct IdentityResolver {
    directory: Arc<dyn IdentityDirectory>,
    base: i64,
    alloc_lock: tokio::sync::Mutex<()>,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self::with_base(directory, VIRTUAL_ID_BASE)
    }

    pub fn with_base(directory: Arc<dyn IdentityDirectory>, base: i64) -> Self {
        Self {
            directory,
            base,
            alloc_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Identifiers that are already plain integers need no mapping.
    pub fn is_opaque(id: &str) -> bool {
        !id.is_empty() && id.parse::<i64>().is_err()
    }

    /// Resolve an opaque identifier, allocating the next unused number if
    /// the directory has none. Idempotent per `(platform, opaque_id)`.
    pub async fn resolve(&self, platform: &str, opaque_id: &str) -> Result<i64, ProtocolError> {
        if let Ok(n) = opaque_id.parse::<i64>() {
            return Ok(n);
        }
        if let Some(id) = self.directory.lookup(platform, opaque_id).await? {
            return Ok(id);
        }

        let _guard = self.alloc_lock.lock().await;
        // Another task may have allocated while we waited for the lock.
        if let Some(id) = self.directory.lookup(platform, opaque_id).await? {
            return Ok(id);
        }
        let next = match self.directory.highest_assigned(platform).await? {
            Some(highest) if highest >= self.base => highest + 1,
            _ => self.base,
        };
        self.directory.create(platform, opaque_id, next).await?;
        tracing::debug!(platform, opaque_id, numeric_id = next, "Allocated virtual identity");
        Ok(next)
    }

    /// Map a virtual numeric identity back to the platform's opaque one.
    pub async fn restore(&self, platform: &str, numeric_id: i64) -> Result<Option<String>, ProtocolError> {
        if numeric_id < self.base {
            return Ok(None);
        }
        self.directory.reverse_lookup(platform, numeric_id).await
    }

    /// Replace opaque user/group identifiers in an inbound event with
    /// numeric ones. The originals are kept in `extras`.
    pub async fn normalize(&self, msg: &mut InternalMessage) -> Result<(), ProtocolError> {
        let platform = msg.platform.clone();
        if Self::is_opaque(&msg.user_id) {
            let numeric = self.resolve(&platform, &msg.user_id).await?;
            msg.extras
                .insert("opaque_user_id".into(), Value::from(msg.user_id.clone()));
            if msg.sender.user_id == msg.user_id || msg.sender.user_id.is_empty() {
                msg.sender.user_id = numeric.to_string();
            }
            msg.user_id = numeric.to_string();
        }
        if Self::is_opaque(&msg.group_id) {
            let numeric = self.resolve(&platform, &msg.group_id).await?;
            msg.extras
                .insert("opaque_group_id".into(), Value::from(msg.group_id.clone()));
            msg.group_id = numeric.to_string();
        }
        Ok(())
    }

    /// Rewrite virtual `user_id` / `group_id` parameters of an outbound
    /// action to the identifiers the platform understands.
    pub async fn denormalize_params(&self, platform: &str, params: &mut Value) -> Result<(), ProtocolError> {
        for key in ["user_id", "group_id"] {
            let numeric = match params.get(key) {
                Some(Value::Number(n)) => n.as_i64(),
                Some(Value::String(s)) => s.parse::<i64>().ok(),
                _ => None,
            };
            let Some(numeric) = numeric else { continue };
            if let Some(opaque) = self.restore(platform, numeric).await? {
                if let Some(obj) = params.as_object_mut() {
                    obj.insert(key.to_string(), Value::from(opaque));
                }
            }
        }
        Ok(())
    }
}

/// Directory kept in process memory. Used by tests and by deployments
/// without a persistence layer.
#[derive(Default)]
pub struct MemoryIdentityDirectory {
    inner: std::sync::Mutex<HashMap<(String, String), i64>>,
}

impl MemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut HashMap<(String, String), i64>) -> T) -> Result<T, ProtocolError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| ProtocolError::Identity("identity map poisoned".into()))?;
        Ok(f(&mut map))
    }
}

#[async_trait]
impl IdentityDirectory for MemoryIdentityDirectory {
    async fn lookup(&self, platform: &str, opaque_id: &str) -> Result<Option<i64>, ProtocolError> {
        self.with_map(|m| m.get(&(platform.to_string(), opaque_id.to_string())).copied())
    }

    async fn reverse_lookup(&self, platform: &str, numeric_id: i64) -> Result<Option<String>, ProtocolError> {
        self.with_map(|m| {
            m.iter()
                .find(|((p, _), id)| p == platform && **id == numeric_id)
                .map(|((_, opaque), _)| opaque.clone())
        })
    }

    async fn highest_assigned(&self, platform: &str) -> Result<Option<i64>, ProtocolError> {
        self.with_map(|m| {
            m.iter()
                .filter(|((p, _), _)| p == platform)
                .map(|(_, id)| *id)
                .max()
        })
    }

    async fn create(&self, platform: &str, opaque_id: &str, numeric_id: i64) -> Result<(), ProtocolError> {
        self.with_map(|m| {
            m.entry((platform.to_string(), opaque_id.to_string()))
                .or_insert(numeric_id);
        })
    }
}
