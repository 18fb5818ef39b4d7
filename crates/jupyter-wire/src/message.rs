//! Core Jupyter message types.
//!
//! The gateway never interprets `content`; it only needs enough of the header
//! to route a message (`msg_type`) and to correlate replies (`msg_id`,
//! `parent_header.msg_id`). Every other field is carried through verbatim.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::base64::{deserialize_buffers, serialize_buffers};
use crate::timestamp;

/// Version of the Jupyter messaging protocol stamped on locally built requests.
pub const PROTOCOL_VERSION: &str = "5.3";

/// One of the four logical kernel channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Control,
    Stdin,
    IOPub,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::Control => write!(f, "control"),
            Channel::Stdin => write!(f, "stdin"),
            Channel::IOPub => write!(f, "iopub"),
        }
    }
}

/// Message header.
///
/// Only the routing-relevant fields are typed. Everything else (`username`,
/// `version`, `subshell_id`, ...) lives in `extra` and is re-emitted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Kept as a raw value so non-string timestamps can be normalized later.
    /// `None` means the key was absent; an explicit `null` is `Some(Null)`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub date: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Header {
    fn new(msg_type: &str, session: &str) -> Self {
        let mut extra = Map::new();
        extra.insert("username".into(), Value::String("kernel-gateway".into()));
        extra.insert("version".into(), Value::String(PROTOCOL_VERSION.into()));
        Header {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            session: Some(session.to_string()),
            date: Some(Value::String(
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            )),
            extra,
        }
    }

    fn normalize_date(&mut self) {
        if let Some(date) = self.date.as_mut() {
            timestamp::normalize(date);
        }
    }
}

/// A Jupyter message as it crosses the gateway.
///
/// The JSON form matches what browser-side Jupyter clients speak:
/// - `parent_header` may be `{}`, `null`, absent, or a full header
/// - `buffers` are base64-encoded strings
/// - `content` is an arbitrary JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,

    #[serde(
        default,
        deserialize_with = "deserialize_parent_header",
        serialize_with = "serialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    pub content: Value,

    #[serde(
        default,
        serialize_with = "serialize_buffers",
        deserialize_with = "deserialize_buffers"
    )]
    pub buffers: Vec<Bytes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl Message {
    /// Build a fresh request with a new message id and the current time.
    pub fn request(msg_type: &str, session: &str, content: Value) -> Self {
        Message {
            header: Header::new(msg_type, session),
            parent_header: None,
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
            channel: None,
        }
    }

    /// Build a message that answers `self` on the same channel.
    pub fn reply(&self, msg_type: &str, content: Value) -> Self {
        Message {
            header: Header::new(msg_type, self.header.session.as_deref().unwrap_or_default()),
            parent_header: Some(self.header.clone()),
            metadata: empty_object(),
            content,
            buffers: Vec::new(),
            channel: self.channel,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Rewrite `header.date` and `parent_header.date` as ISO-8601 strings.
    pub fn normalize_timestamps(&mut self) {
        self.header.normalize_date();
        if let Some(parent) = self.parent_header.as_mut() {
            parent.normalize_date();
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Interpret a parent header value: `null` and `{}` mean "no parent".
pub(crate) fn parent_header_from_value(value: Value) -> serde_json::Result<Option<Header>> {
    match value {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        other => Header::deserialize(other).map(Some),
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn deserialize_parent_header<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    parent_header_from_value(value).map_err(de::Error::custom)
}

fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}
