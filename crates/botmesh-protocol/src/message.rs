//! The canonical, dialect-neutral event model.
//!
//! Every event that enters the gateway, from a bot socket or from the
//! durable log, is turned into an [`InternalMessage`] at the bridge boundary.
//! The dispatcher and the queue consumer only ever see this type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    #[default]
    Message,
    /// A message the bot account sent itself, reported back by the adapter.
    MessageSent,
    Notice,
    Request,
    MetaEvent,
}

impl PostType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "message_sent" => Some(Self::MessageSent),
            "notice" => Some(Self::Notice),
            "request" => Some(Self::Request),
            "meta_event" => Some(Self::MetaEvent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::MessageSent => "message_sent",
            Self::Notice => "notice",
            Self::Request => "request",
            Self::MetaEvent => "meta_event",
        }
    }

    /// Events carrying a message body, whoever sent it.
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message | Self::MessageSent)
    }

    /// Wire key holding the post-type specific discriminator
    /// (`message_type`, `notice_type`, ...).
    pub fn detail_key(&self) -> &'static str {
        match self {
            Self::Message | Self::MessageSent => "message_type",
            Self::Notice => "notice_type",
            Self::Request => "request_type",
            Self::MetaEvent => "meta_event_type",
        }
    }
}

impl std::fmt::Display for PostType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed piece of message content: `{type, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Segment {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text").with("text", text.into())
    }

    pub fn at(user_id: impl Into<String>) -> Self {
        Self::new("at").with("qq", user_id.into())
    }

    pub fn image(file: impl Into<String>) -> Self {
        Self::new("image").with("file", file.into())
    }

    pub fn reply(message_id: impl Into<String>) -> Self {
        Self::new("reply").with("id", message_id.into())
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    /// Text content of a `text` segment.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            self.data.get("text").and_then(Value::as_str)
        } else {
            None
        }
    }

    /// A data field rendered as a string, whatever its JSON type.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(value_to_string)
    }
}

/// Who sent a message event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub card: String,
    #[serde(default)]
    pub role: String,
}

/// Protocol-agnostic event.
///
/// `message_type` holds the discriminator matching `post_type`: the message
/// type for messages, the notice type for notices, and so on. Identity fields
/// are strings so that opaque platform identifiers survive unchanged until the
/// identity resolver maps them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalMessage {
    pub id: String,
    pub time: i64,
    pub platform: String,
    pub self_id: String,
    pub post_type: PostType,
    pub message_type: String,
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub raw_message: String,
    #[serde(default)]
    pub sender: Sender,
    /// Platform-specific fields passed through untouched.
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl InternalMessage {
    /// A text message event, the shape most tests and producers need.
    pub fn text(
        platform: &str,
        self_id: &str,
        user_id: &str,
        group_id: Option<&str>,
        text: &str,
    ) -> Self {
        let segments = vec![Segment::text(text)];
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            time: chrono::Utc::now().timestamp(),
            platform: platform.to_string(),
            self_id: self_id.to_string(),
            post_type: PostType::Message,
            message_type: if group_id.is_some() { "group" } else { "private" }.to_string(),
            sub_type: String::new(),
            user_id: user_id.to_string(),
            group_id: group_id.unwrap_or_default().to_string(),
            raw_message: crate::cqcode::encode(&segments),
            segments,
            sender: Sender {
                user_id: user_id.to_string(),
                ..Default::default()
            },
            extras: Map::new(),
        }
    }

    /// Concatenated content of all text segments, falling back to the
    /// unescaped raw string when the segment list is empty.
    pub fn plain_text(&self) -> String {
        if self.segments.is_empty() {
            return crate::cqcode::unescape(&self.raw_message);
        }
        self.segments
            .iter()
            .filter_map(Segment::as_text)
            .collect::<String>()
    }

    pub fn is_group(&self) -> bool {
        !self.group_id.is_empty()
    }

    /// `meta_event` heartbeats only refresh liveness.
    pub fn is_heartbeat(&self) -> bool {
        self.post_type == PostType::MetaEvent && self.message_type == "heartbeat"
    }
}

/// Render a JSON scalar the way the string dialect expects it.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Read an identifier that may be encoded as a number or a string.
pub fn id_from_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Encode an identifier as a JSON number when it is numeric, as a string otherwise.
pub fn id_to_value(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) if n.to_string() == id => Value::from(n),
        _ => Value::from(id),
    }
}
