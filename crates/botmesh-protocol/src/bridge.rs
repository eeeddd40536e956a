//! Translation between [`InternalMessage`] and the two wire dialects.
//!
//! Both directions are pure. The string dialect carries message content as a
//! single escaped string, the array dialect as a list of `{type, data}`
//! segments. Inbound frames are accepted in either dialect regardless of what
//! the peer announced at handshake time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cqcode;
use crate::message::{id_from_value, id_to_value, InternalMessage, PostType, Segment, Sender};
use crate::ProtocolError;

/// Wire dialect spoken by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Dialect B: structured segment list.
    #[default]
    Array,
    /// Dialect A: string with inline directives.
    String,
}

impl Dialect {
    /// Parse the handshake `X-Protocol` value. Unknown values mean `Array`.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "string" | "cq" | "cqcode" | "v11-string" => Self::String,
            _ => Self::Array,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::String => "string",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys the bridge maps onto typed fields; everything else goes to `extras`.
const KNOWN_KEYS: &[&str] = &[
    "time",
    "self_id",
    "platform",
    "post_type",
    "message_type",
    "notice_type",
    "request_type",
    "meta_event_type",
    "sub_type",
    "message_id",
    "user_id",
    "group_id",
    "message",
    "raw_message",
    "sender",
];

/// Which dialect a frame's `message` field uses, if it has one.
pub fn detect_dialect(frame: &Value) -> Option<Dialect> {
    match frame.get("message") {
        Some(Value::String(_)) => Some(Dialect::String),
        Some(Value::Array(_)) => Some(Dialect::Array),
        _ => None,
    }
}

/// Decode an event frame from either dialect.
pub fn from_wire(frame: &Value) -> Result<InternalMessage, ProtocolError> {
    let obj = frame
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("event frame is not an object".into()))?;

    let post_type_str = obj
        .get("post_type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MissingField("post_type".into()))?;
    let post_type = PostType::parse(post_type_str)
        .ok_or_else(|| ProtocolError::Unsupported(format!("post_type '{post_type_str}'")))?;

    let segments = match obj.get("message") {
        Some(Value::String(s)) => cqcode::decode(s),
        Some(Value::Array(items)) => decode_segments(items)?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(ProtocolError::MissingField("message".into())),
    };

    let raw_message = obj
        .get("raw_message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| cqcode::encode(&segments));

    let sender = match obj.get("sender") {
        Some(Value::Object(s)) => Sender {
            user_id: id_from_value(s.get("user_id")),
            nickname: str_field(s, "nickname"),
            card: str_field(s, "card"),
            role: str_field(s, "role"),
        },
        _ => Sender::default(),
    };

    let id = match id_from_value(obj.get("message_id")) {
        id if id.is_empty() => uuid::Uuid::new_v4().to_string(),
        id => id,
    };

    let extras: Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(InternalMessage {
        id,
        time: obj
            .get("time")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        platform: str_field(obj, "platform"),
        self_id: id_from_value(obj.get("self_id")),
        post_type,
        message_type: str_field(obj, post_type.detail_key()),
        sub_type: str_field(obj, "sub_type"),
        user_id: id_from_value(obj.get("user_id")),
        group_id: id_from_value(obj.get("group_id")),
        segments,
        raw_message,
        sender,
        extras,
    })
}

/// Encode an internal message as an event frame in the given dialect.
pub fn to_wire(msg: &InternalMessage, dialect: Dialect) -> Value {
    let mut obj = Map::new();
    obj.insert("time".into(), Value::from(msg.time));
    obj.insert("self_id".into(), id_to_value(&msg.self_id));
    if !msg.platform.is_empty() {
        obj.insert("platform".into(), Value::from(msg.platform.clone()));
    }
    obj.insert("post_type".into(), Value::from(msg.post_type.as_str()));
    obj.insert(
        msg.post_type.detail_key().into(),
        Value::from(msg.message_type.clone()),
    );
    if !msg.sub_type.is_empty() {
        obj.insert("sub_type".into(), Value::from(msg.sub_type.clone()));
    }
    if !msg.user_id.is_empty() {
        obj.insert("user_id".into(), id_to_value(&msg.user_id));
    }
    if !msg.group_id.is_empty() {
        obj.insert("group_id".into(), id_to_value(&msg.group_id));
    }

    if msg.post_type.is_message() {
        obj.insert("message_id".into(), id_to_value(&msg.id));
        let message = match dialect {
            Dialect::String => Value::from(cqcode::encode(&msg.segments)),
            Dialect::Array => serde_json::to_value(&msg.segments).unwrap_or(Value::Array(Vec::new())),
        };
        obj.insert("message".into(), message);
        obj.insert("raw_message".into(), Value::from(msg.raw_message.clone()));
        obj.insert(
            "sender".into(),
            serde_json::json!({
                "user_id": id_to_value(&msg.sender.user_id),
                "nickname": msg.sender.nickname,
                "card": msg.sender.card,
                "role": msg.sender.role,
            }),
        );
    }

    for (k, v) in &msg.extras {
        obj.entry(k.clone()).or_insert_with(|| v.clone());
    }
    Value::Object(obj)
}

/// Convert a message body in either dialect into segments.
pub fn segments_from_value(value: &Value) -> Result<Vec<Segment>, ProtocolError> {
    match value {
        Value::String(s) => Ok(cqcode::decode(s)),
        Value::Array(items) => decode_segments(items),
        Value::Object(_) => decode_segments(std::slice::from_ref(value)),
        Value::Null => Ok(Vec::new()),
        _ => Err(ProtocolError::MissingField("message".into())),
    }
}

fn decode_segments(items: &[Value]) -> Result<Vec<Segment>, ProtocolError> {
    items
        .iter()
        .map(|item| {
            serde_json::from_value::<Segment>(item.clone())
                .map_err(|e| ProtocolError::Malformed(format!("bad segment: {e}")))
        })
        .collect()
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
