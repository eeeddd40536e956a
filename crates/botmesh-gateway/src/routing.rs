//! Worker selection for inbound events.
//!
//! Order of preference: a routing rule pinning the event to a worker, then
//! workers whose declared capability pattern matches the message text, then
//! plain round-robin. The chosen worker is always followed by the remaining
//! workers in rotation order so the dispatcher has somewhere to fail over to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use botmesh_protocol::{Capability, InternalMessage};
use botmesh_state::Store;

use crate::GatewayError;

/// Rules are stored one record per pattern, plus an index record listing
/// the patterns, so loading them needs only point lookups.
pub const ROUTING_RULE_ENTITY: &str = "routing_rule";
pub const ROUTING_RULE_INDEX_ENTITY: &str = "routing_rule_index";
const ROUTING_RULE_INDEX_KEY: &str = "patterns";

/// Persisted `pattern -> worker` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub pattern: String,
    pub target_worker_id: String,
    /// Higher wins when several rules match.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub enum RulePattern {
    Group(String),
    User(String),
    Bot(String),
    Platform(String),
    PostType(String),
    Prefix(String),
    /// `*`-glob over the flattened message text.
    Glob(Regex),
}

impl RulePattern {
    pub fn parse(pattern: &str) -> Result<Self, GatewayError> {
        let (tag, rest) = pattern.split_once(':').unwrap_or(("", pattern));
        let value = rest.to_string();
        Ok(match tag {
            "group" => Self::Group(value),
            "user" => Self::User(value),
            "bot" => Self::Bot(value),
            "platform" => Self::Platform(value),
            "type" => Self::PostType(value),
            "prefix" => Self::Prefix(value),
            _ => Self::Glob(glob_to_regex(pattern)?),
        })
    }

    pub fn matches(&self, msg: &InternalMessage) -> bool {
        match self {
            Self::Group(id) => msg.is_group() && &msg.group_id == id,
            Self::User(id) => &msg.user_id == id,
            Self::Bot(id) => &msg.self_id == id,
            Self::Platform(p) => msg.platform.eq_ignore_ascii_case(p),
            Self::PostType(t) => msg.post_type.as_str() == t || &msg.message_type == t,
            Self::Prefix(prefix) => msg.plain_text().trim_start().starts_with(prefix.as_str()),
            Self::Glob(re) => re.is_match(&msg.plain_text()),
        }
    }
}

async fn save_index(store: &dyn Store, rules: &[(RoutingRule, RulePattern)]) -> Result<(), GatewayError> {
    let patterns: Vec<&str> = rules.iter().map(|(r, _)| r.pattern.as_str()).collect();
    store
        .upsert(ROUTING_RULE_INDEX_ENTITY, ROUTING_RULE_INDEX_KEY, Value::from(patterns))
        .await?;
    Ok(())
}

fn glob_to_regex(glob: &str) -> Result<Regex, GatewayError> {
    let body: Vec<String> = glob.split('*').map(regex::escape).collect();
    Regex::new(&format!("(?s)^{}$", body.join(".*")))
        .map_err(|e| GatewayError::Rule(format!("{glob}: {e}")))
}

/// Monotonic counter behind round-robin selection.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicU64,
}

impl RoundRobin {
    /// Index of the next pick among `len` candidates.
    pub fn pick(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some((self.next.fetch_add(1, Ordering::Relaxed) % len as u64) as usize)
    }
}

/// `candidates[start..]` followed by `candidates[..start]`.
fn rotate_from(candidates: &[String], start: usize) -> Vec<String> {
    candidates[start..]
        .iter()
        .chain(candidates[..start].iter())
        .cloned()
        .collect()
}

pub struct RoutingTable {
    rules: RwLock<Vec<(RoutingRule, RulePattern)>>,
    store: Option<Arc<dyn Store>>,
    round_robin: RoundRobin,
    /// Compiled capability trigger patterns; `None` for invalid ones.
    trigger_cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl RoutingTable {
    pub fn new(store: Option<Arc<dyn Store>>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            store,
            round_robin: RoundRobin::default(),
            trigger_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the in-memory rules with whatever the store holds.
    pub async fn load(&self) -> Result<usize, GatewayError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let patterns: Vec<String> = match store.get(ROUTING_RULE_INDEX_ENTITY, ROUTING_RULE_INDEX_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| GatewayError::Rule(format!("unreadable rule index: {e}")))?,
            None => Vec::new(),
        };

        let mut loaded = Vec::new();
        for key in patterns {
            let value = match store.get(ROUTING_RULE_ENTITY, &key).await? {
                Some(Value::Null) | None => {
                    tracing::warn!(pattern = %key, "Indexed routing rule has no record");
                    continue;
                }
                Some(value) => value,
            };
            let rule: RoutingRule = match serde_json::from_value(value) {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::warn!(pattern = %key, error = %e, "Skipping unreadable routing rule");
                    continue;
                }
            };
            match RulePattern::parse(&rule.pattern) {
                Ok(pattern) => loaded.push((rule, pattern)),
                Err(e) => tracing::warn!(pattern = %key, error = %e, "Skipping invalid routing rule"),
            }
        }
        let count = loaded.len();
        *self.rules.write().await = sort_rules(loaded);
        tracing::info!(count, "Routing rules loaded");
        Ok(count)
    }

    /// Add or replace the rule for `rule.pattern`.
    pub async fn add_rule(&self, rule: RoutingRule) -> Result<(), GatewayError> {
        let pattern = RulePattern::parse(&rule.pattern)?;
        let mut rules = self.rules.write().await;
        let mut next: Vec<(RoutingRule, RulePattern)> = rules
            .iter()
            .filter(|(r, _)| r.pattern != rule.pattern)
            .cloned()
            .collect();
        next.push((rule.clone(), pattern));

        if let Some(store) = &self.store {
            let value = serde_json::to_value(&rule).map_err(|e| GatewayError::Rule(e.to_string()))?;
            store.upsert(ROUTING_RULE_ENTITY, &rule.pattern, value).await?;
            save_index(store.as_ref(), &next).await?;
        }
        *rules = sort_rules(next);
        Ok(())
    }

    pub async fn remove_rule(&self, pattern: &str) -> Result<bool, GatewayError> {
        let mut rules = self.rules.write().await;
        let next: Vec<(RoutingRule, RulePattern)> = rules
            .iter()
            .filter(|(r, _)| r.pattern != pattern)
            .cloned()
            .collect();
        if next.len() == rules.len() {
            return Ok(false);
        }

        if let Some(store) = &self.store {
            save_index(store.as_ref(), &next).await?;
            store.upsert(ROUTING_RULE_ENTITY, pattern, Value::Null).await?;
        }
        *rules = next;
        Ok(true)
    }

    pub async fn list_rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.iter().map(|(r, _)| r.clone()).collect()
    }

    /// Target of the highest-priority matching rule.
    pub async fn match_rule(&self, msg: &InternalMessage) -> Option<String> {
        self.rules
            .read()
            .await
            .iter()
            .find(|(_, p)| p.matches(msg))
            .map(|(r, _)| r.target_worker_id.clone())
    }

    fn trigger_matches(&self, pattern: &str, text: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        let mut cache = match self.trigger_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let compiled = cache
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern).ok());
        match compiled {
            Some(re) => re.is_match(text),
            None => text.contains(pattern),
        }
    }

    /// Workers, in order of preference, for one inbound event. `workers`
    /// must be sorted; `capabilities` lists each worker's declared skills.
    pub async fn plan(
        &self,
        msg: &InternalMessage,
        workers: &[String],
        capabilities: &[(String, Arc<Vec<Capability>>)],
    ) -> Vec<String> {
        if workers.is_empty() {
            return Vec::new();
        }

        if let Some(target) = self.match_rule(msg).await {
            if let Some(pos) = workers.iter().position(|w| *w == target) {
                return rotate_from(workers, pos);
            }
            tracing::debug!(target = %target, "Routing rule target is not connected");
        }

        let text = msg.plain_text();
        let capable: Vec<String> = if text.is_empty() {
            Vec::new()
        } else {
            capabilities
                .iter()
                .filter(|(id, caps)| {
                    workers.contains(id) && caps.iter().any(|c| self.trigger_matches(&c.pattern, &text))
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        if !capable.is_empty() {
            let Some(idx) = self.round_robin.pick(capable.len()) else {
                return Vec::new();
            };
            let first = capable[idx].clone();
            let mut order = rotate_from(&capable, idx);
            let pos = workers.iter().position(|w| *w == first).unwrap_or(0);
            for w in rotate_from(workers, pos) {
                if !order.contains(&w) {
                    order.push(w);
                }
            }
            return order;
        }

        match self.round_robin.pick(workers.len()) {
            Some(idx) => rotate_from(workers, idx),
            None => Vec::new(),
        }
    }
}

fn sort_rules(mut rules: Vec<(RoutingRule, RulePattern)>) -> Vec<(RoutingRule, RulePattern)> {
    // stable: equal priorities keep insertion order
    rules.sort_by(|a, b| b.0.priority.cmp(&a.0.priority));
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_msg(group: &str, text: &str) -> InternalMessage {
        InternalMessage::text("qq", "10001", "42", Some(group), text)
    }

    #[test]
    fn pattern_grammar() {
        let msg = group_msg("777", "/weather Oslo");
        assert!(RulePattern::parse("group:777").unwrap().matches(&msg));
        assert!(!RulePattern::parse("group:778").unwrap().matches(&msg));
        assert!(RulePattern::parse("user:42").unwrap().matches(&msg));
        assert!(RulePattern::parse("bot:10001").unwrap().matches(&msg));
        assert!(RulePattern::parse("platform:QQ").unwrap().matches(&msg));
        assert!(RulePattern::parse("type:message").unwrap().matches(&msg));
        assert!(RulePattern::parse("type:group").unwrap().matches(&msg));
        assert!(RulePattern::parse("prefix:/weather").unwrap().matches(&msg));
        assert!(RulePattern::parse("/weather*").unwrap().matches(&msg));
        assert!(!RulePattern::parse("weather").unwrap().matches(&msg));
    }

    #[test]
    fn glob_sees_unescaped_text() {
        let msg = group_msg("777", "hello, [world] & co");
        assert!(RulePattern::parse("hello, *").unwrap().matches(&msg));
        assert!(RulePattern::parse("*[world] & co").unwrap().matches(&msg));
        assert!(!RulePattern::parse("*&#44;*").unwrap().matches(&msg));
    }

    #[test]
    fn round_robin_cycles() {
        let rr = RoundRobin::default();
        let picks: Vec<_> = (0..5).filter_map(|_| rr.pick(3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
        assert_eq!(rr.pick(0), None);
    }

    #[tokio::test]
    async fn rule_pins_worker_first() {
        let table = RoutingTable::new(None);
        table
            .add_rule(RoutingRule {
                pattern: "group:777".into(),
                target_worker_id: "w2".into(),
                priority: 0,
            })
            .await
            .unwrap();
        let workers = vec!["w1".to_string(), "w2".to_string(), "w3".to_string()];
        let plan = table.plan(&group_msg("777", "hi"), &workers, &[]).await;
        assert_eq!(plan, vec!["w2", "w3", "w1"]);
    }

    #[tokio::test]
    async fn capability_match_preferred() {
        let table = RoutingTable::new(None);
        let workers = vec!["w1".to_string(), "w2".to_string()];
        let caps = vec![
            ("w1".to_string(), Arc::new(vec![])),
            (
                "w2".to_string(),
                Arc::new(vec![Capability {
                    name: "weather".into(),
                    pattern: r"^/weather\b".into(),
                    ..Default::default()
                }]),
            ),
        ];
        for _ in 0..3 {
            let plan = table.plan(&group_msg("1", "/weather Oslo"), &workers, &caps).await;
            assert_eq!(plan, vec!["w2", "w1"]);
        }
    }
}
