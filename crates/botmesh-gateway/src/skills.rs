//! Named skill handlers invoked by `skill_call` queue entries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

pub type SkillParams = HashMap<String, String>;

#[async_trait]
pub trait SkillHandler: Send + Sync {
    async fn handle(&self, params: &SkillParams) -> Result<String, String>;
}

/// Adapter so plain closures can be registered as skills.
pub struct FnSkill<F>(pub F);

#[async_trait]
impl<F> SkillHandler for FnSkill<F>
where
    F: Fn(&SkillParams) -> Result<String, String> + Send + Sync,
{
    async fn handle(&self, params: &SkillParams) -> Result<String, String> {
        (self.0)(params)
    }
}

#[derive(Default)]
pub struct SkillRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn SkillHandler>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a handler.
    pub async fn register(&self, name: &str, handler: Arc<dyn SkillHandler>) {
        self.handlers.write().await.insert(name.to_string(), handler);
        tracing::info!(skill = name, "Skill registered");
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.handlers.write().await.remove(name).is_some()
    }

    /// Looked up under the read lock; the handler runs after it is released.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn SkillHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closures_run_as_skills() {
        let skills = SkillRegistry::new();
        skills
            .register(
                "echo",
                Arc::new(FnSkill(|p: &SkillParams| {
                    p.get("text").cloned().ok_or_else(|| "text is required".to_string())
                })),
            )
            .await;

        let handler = skills.get("echo").await.unwrap();
        let mut params = SkillParams::new();
        assert!(handler.handle(&params).await.is_err());
        params.insert("text".into(), "hi".into());
        assert_eq!(handler.handle(&params).await.unwrap(), "hi");

        assert!(skills.get("missing").await.is_none());
        assert!(skills.unregister("echo").await);
        assert!(skills.names().await.is_empty());
    }
}
