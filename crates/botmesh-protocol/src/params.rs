//! Typed views over action parameters.
//!
//! Only the handful of actions whose routing metadata matters are modelled;
//! everything else is kept as an opaque JSON value. [`TypedAction::routing_hints`]
//! is the one place that knows where platform, bot, group, user and reply
//! text live in an action.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::segments_from_value;
use crate::frames::ActionFrame;
use crate::message::{id_from_value, Segment};

#[derive(Debug, Clone, PartialEq)]
pub enum ActionParams {
    SendPrivateMsg {
        user_id: String,
        message: Vec<Segment>,
    },
    SendGroupMsg {
        group_id: String,
        message: Vec<Segment>,
    },
    SendMsg {
        message_type: Option<String>,
        user_id: Option<String>,
        group_id: Option<String>,
        message: Vec<Segment>,
    },
    DeleteMsg {
        message_id: String,
    },
    Other(Value),
}

/// Routing metadata extracted from an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHints {
    pub platform: Option<String>,
    pub self_id: Option<String>,
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub text: Option<String>,
}

impl RoutingHints {
    /// Fill missing platform / bot identity from the last values observed on
    /// inbound traffic.
    pub fn or_last_observed(mut self, last: Option<&(String, String)>) -> Self {
        if let Some((platform, self_id)) = last {
            if self.platform.is_none() {
                self.platform = Some(platform.clone());
            }
            if self.self_id.is_none() {
                self.self_id = Some(self_id.clone());
            }
        }
        self
    }
}

/// An action frame with its parameters decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedAction {
    pub action: String,
    pub params: ActionParams,
    /// Bot the action is addressed to, when the caller named one.
    pub self_id: Option<String>,
    pub platform: Option<String>,
}

impl TypedAction {
    pub fn parse(frame: &ActionFrame) -> Self {
        let p = &frame.params;
        let message = || {
            p.get("message")
                .map(|m| segments_from_value(m).unwrap_or_default())
                .unwrap_or_default()
        };
        let opt_id = |key: &str| Some(id_from_value(p.get(key))).filter(|s| !s.is_empty());

        let params = match frame.action.as_str() {
            "send_private_msg" => ActionParams::SendPrivateMsg {
                user_id: id_from_value(p.get("user_id")),
                message: message(),
            },
            "send_group_msg" => ActionParams::SendGroupMsg {
                group_id: id_from_value(p.get("group_id")),
                message: message(),
            },
            "send_msg" => ActionParams::SendMsg {
                message_type: p
                    .get("message_type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                user_id: opt_id("user_id"),
                group_id: opt_id("group_id"),
                message: message(),
            },
            "delete_msg" => ActionParams::DeleteMsg {
                message_id: id_from_value(p.get("message_id")),
            },
            _ => ActionParams::Other(p.clone()),
        };

        Self {
            action: frame.action.clone(),
            params,
            self_id: opt_id("self_id"),
            platform: p
                .get("platform")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    pub fn routing_hints(&self) -> RoutingHints {
        let text_of = |segments: &[Segment]| {
            let text: String = segments.iter().filter_map(Segment::as_text).collect();
            Some(text).filter(|t| !t.is_empty())
        };
        let non_empty = |s: &str| Some(s.to_string()).filter(|s| !s.is_empty());

        let (group_id, user_id, text) = match &self.params {
            ActionParams::SendPrivateMsg { user_id, message } => {
                (None, non_empty(user_id), text_of(message))
            }
            ActionParams::SendGroupMsg { group_id, message } => {
                (non_empty(group_id), None, text_of(message))
            }
            ActionParams::SendMsg {
                user_id,
                group_id,
                message,
                ..
            } => (group_id.clone(), user_id.clone(), text_of(message)),
            ActionParams::DeleteMsg { .. } | ActionParams::Other(_) => (None, None, None),
        };

        RoutingHints {
            platform: self.platform.clone(),
            self_id: self.self_id.clone(),
            group_id,
            user_id,
            text,
        }
    }
}
