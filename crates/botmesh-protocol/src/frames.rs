//! Non-event frames exchanged with peers: actions, action responses,
//! worker capability announcements and skill results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{RETCODE_ASYNC, RETCODE_OK};
use crate::ProtocolError;

/// `{action, params, echo}` sent to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFrame {
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

impl ActionFrame {
    pub fn new(action: &str, params: Value) -> Self {
        Self {
            action: action.to_string(),
            params,
            echo: None,
        }
    }

    pub fn with_echo(mut self, echo: impl Into<Value>) -> Self {
        self.echo = Some(echo.into());
        self
    }
}

/// `{status, retcode, data|message, echo}` answering an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: String,
    #[serde(default)]
    pub retcode: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

impl ActionResponse {
    pub fn ok(data: Value, echo: Option<Value>) -> Self {
        Self {
            status: "ok".into(),
            retcode: RETCODE_OK,
            data,
            message: None,
            echo,
        }
    }

    /// Accepted for asynchronous delivery (handed to the durable log).
    pub fn queued(data: Value, echo: Option<Value>) -> Self {
        Self {
            status: "async".into(),
            retcode: RETCODE_ASYNC,
            data,
            message: None,
            echo,
        }
    }

    pub fn failed(retcode: i64, message: impl Into<String>, echo: Option<Value>) -> Self {
        Self {
            status: "failed".into(),
            retcode,
            data: Value::Null,
            message: Some(message.into()),
            echo,
        }
    }

    /// Both direct and queued delivery count as success for the caller.
    pub fn is_success(&self) -> bool {
        self.status == "ok" || self.status == "async"
    }

    /// The echo as a plain string, which is how gateway-issued tokens travel.
    pub fn echo_token(&self) -> Option<String> {
        match &self.echo {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A skill a worker declares it can execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Trigger pattern matched against inbound message text.
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// `worker_register` announcement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegister {
    pub worker_id: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    Succeeded,
    Failed,
}

/// Outcome of a skill call, reported on the skill result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillResult {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(default)]
    pub worker_id: String,
    pub skill: String,
    pub status: SkillStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

/// A decoded inbound frame, before any routing decision.
#[derive(Debug, Clone)]
pub enum Frame {
    Event(Value),
    Action(ActionFrame),
    Response(ActionResponse),
    Register(WorkerRegister),
    SkillResult(SkillResult),
}

/// Decode one text frame from a peer socket.
pub fn classify(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {e}")))?;
    classify_value(value)
}

pub fn classify_value(value: Value) -> Result<Frame, ProtocolError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("frame is not an object".into()))?;

    if obj.contains_key("post_type") {
        return Ok(Frame::Event(value));
    }

    match obj.get("type").and_then(Value::as_str) {
        Some("worker_register") => {
            // Announcement fields may sit at top level or under "data".
            let body = match obj.get("data") {
                Some(data @ Value::Object(_)) => data.clone(),
                _ => value.clone(),
            };
            let register: WorkerRegister = serde_json::from_value(body)
                .map_err(|e| ProtocolError::Malformed(format!("bad worker_register: {e}")))?;
            return Ok(Frame::Register(register));
        }
        Some("skill_result") => {
            let body = match obj.get("data") {
                Some(data @ Value::Object(_)) => data.clone(),
                _ => value.clone(),
            };
            let result: SkillResult = serde_json::from_value(body)
                .map_err(|e| ProtocolError::Malformed(format!("bad skill_result: {e}")))?;
            return Ok(Frame::SkillResult(result));
        }
        _ => {}
    }

    if obj.get("action").is_some_and(Value::is_string) {
        let action: ActionFrame = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("bad action: {e}")))?;
        return Ok(Frame::Action(action));
    }

    if obj.contains_key("status") || obj.contains_key("retcode") {
        let response: ActionResponse = serde_json::from_value(value)
            .map_err(|e| ProtocolError::Malformed(format!("bad response: {e}")))?;
        return Ok(Frame::Response(response));
    }

    Err(ProtocolError::Malformed("unrecognized frame".into()))
}
