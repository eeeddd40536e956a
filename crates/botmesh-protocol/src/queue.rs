//! Durable log entry schema.
//!
//! An entry is a flat string map. Producers either spell the envelope out in
//! fields (`type`, `skill`, `params`, ...) or put the whole JSON envelope in
//! `payload`; both forms decode to the same [`QueueEntry`].

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::message::value_to_string;
use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryKind {
    SkillCall,
    Control,
    /// Anything else: a protocol event or action envelope.
    #[default]
    Event,
}

impl EntryKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "skill_call" => Self::SkillCall,
            "control" => Self::Control,
            _ => Self::Event,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkillCall => "skill_call",
            Self::Control => "control",
            Self::Event => "event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueEntry {
    pub kind: EntryKind,
    pub action: Option<String>,
    pub skill: Option<String>,
    pub params: HashMap<String, String>,
    pub task_id: String,
    pub execution_id: String,
    pub worker_id: String,
    pub timestamp: i64,
    pub payload: Option<Value>,
}

impl QueueEntry {
    pub fn skill_call(skill: &str, params: HashMap<String, String>) -> Self {
        Self {
            kind: EntryKind::SkillCall,
            skill: Some(skill.to_string()),
            params,
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    pub fn event(payload: Value) -> Self {
        Self {
            kind: EntryKind::Event,
            payload: Some(payload),
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, ProtocolError> {
        let payload = match fields.get("payload") {
            Some(raw) => Some(
                serde_json::from_str::<Value>(raw)
                    .map_err(|e| ProtocolError::Malformed(format!("payload is not JSON: {e}")))?,
            ),
            None => None,
        };
        let envelope: Option<&Map<String, Value>> = payload.as_ref().and_then(Value::as_object);

        // A field wins over the same key inside the payload envelope.
        let text = |key: &str| -> Option<String> {
            fields
                .get(key)
                .cloned()
                .or_else(|| envelope.and_then(|e| e.get(key)).map(value_to_string))
                .filter(|s| !s.is_empty())
        };

        let kind = text("type").map(|t| EntryKind::parse(&t)).unwrap_or_default();

        let params_value = match fields.get("params") {
            Some(raw) => Some(
                serde_json::from_str::<Value>(raw)
                    .map_err(|e| ProtocolError::Malformed(format!("params is not JSON: {e}")))?,
            ),
            None => envelope.and_then(|e| e.get("params")).cloned(),
        };
        let params = match params_value {
            None | Some(Value::Null) => HashMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect(),
            Some(other) => {
                return Err(ProtocolError::Malformed(format!(
                    "params must be an object, got {other}"
                )))
            }
        };

        let entry = Self {
            kind,
            action: text("action"),
            skill: text("skill"),
            params,
            task_id: text("task_id").unwrap_or_default(),
            execution_id: text("execution_id").unwrap_or_default(),
            worker_id: text("worker_id").unwrap_or_default(),
            timestamp: text("timestamp").and_then(|t| t.parse().ok()).unwrap_or(0),
            payload,
        };

        match entry.kind {
            EntryKind::SkillCall if entry.skill.is_none() => {
                Err(ProtocolError::MissingField("skill".into()))
            }
            EntryKind::Event if entry.payload.is_none() => {
                Err(ProtocolError::MissingField("payload".into()))
            }
            _ => Ok(entry),
        }
    }

    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), self.kind.as_str().to_string());
        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                fields.insert(key.to_string(), value.to_string());
            }
        };
        put("action", self.action.as_deref().unwrap_or_default());
        put("skill", self.skill.as_deref().unwrap_or_default());
        put("task_id", &self.task_id);
        put("execution_id", &self.execution_id);
        put("worker_id", &self.worker_id);
        put("timestamp", &self.timestamp.to_string());
        if !self.params.is_empty() {
            let params: Map<String, Value> = self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            fields.insert("params".to_string(), Value::Object(params).to_string());
        }
        if let Some(payload) = &self.payload {
            fields.insert("payload".to_string(), payload.to_string());
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn flat_skill_call() {
        let e = QueueEntry::from_fields(&fields(&[
            ("type", "skill_call"),
            ("skill", "weather"),
            ("params", r#"{"city":"Oslo","days":3}"#),
            ("task_id", "t1"),
        ]))
        .unwrap();
        assert_eq!(e.kind, EntryKind::SkillCall);
        assert_eq!(e.skill.as_deref(), Some("weather"));
        assert_eq!(e.params["days"], "3");
        assert_eq!(e.task_id, "t1");
    }

    #[test]
    fn envelope_in_payload() {
        let payload = json!({"type": "skill_call", "skill": "dice", "params": {"sides": 6}});
        let e = QueueEntry::from_fields(&fields(&[("payload", &payload.to_string())])).unwrap();
        assert_eq!(e.kind, EntryKind::SkillCall);
        assert_eq!(e.params["sides"], "6");
    }

    #[test]
    fn event_requires_payload() {
        let err = QueueEntry::from_fields(&fields(&[("type", "message")])).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField(_)));
        let err = QueueEntry::from_fields(&fields(&[("payload", "{not json")])).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn fields_decode_back() {
        let mut params = HashMap::new();
        params.insert("q".to_string(), "x".to_string());
        let entry = QueueEntry::skill_call("search", params);
        let back = QueueEntry::from_fields(&entry.to_fields()).unwrap();
        assert_eq!(back, entry);
    }
}
