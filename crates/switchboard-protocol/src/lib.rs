use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Authenticated user identifier. Valid principals are always `> 0`.
pub type UserId = i64;
/// Group identifier.
pub type GroupId = i64;
/// Durable message identifier assigned by the message store.
pub type MessageId = i64;

/// Maximum length of a chat message body, in characters.
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Maximum size of a single inbound text frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Envelope type tag.
///
/// Anything a client sends that is not one of the known tags decodes as
/// [`MessageType::Unknown`] so the dispatcher can answer it with an error
/// instead of dropping the whole frame as malformed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    PrivateMessage,
    GroupMessage,
    Typing,
    ReadStatus,
    Notification,
    UserOnline,
    UserOffline,
    Ping,
    Pong,
    Error,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PrivateMessage => "private_message",
            MessageType::GroupMessage => "group_message",
            MessageType::Typing => "typing",
            MessageType::ReadStatus => "read_status",
            MessageType::Notification => "notification",
            MessageType::UserOnline => "user_online",
            MessageType::UserOffline => "user_offline",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories reported to clients in `error` envelopes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownType,
    EmptyContent,
    ContentTooLong,
    MissingTarget,
    Forbidden,
    NotGroupMember,
    PersistenceFailed,
    RateLimited,
    FrameTooLarge,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::EmptyContent => "empty_content",
            ErrorCode::ContentTooLong => "content_too_long",
            ErrorCode::MissingTarget => "missing_target",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotGroupMember => "not_group_member",
            ErrorCode::PersistenceFailed => "persistence_failed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::FrameTooLarge => "frame_too_large",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Whether a typing indicator targets a single user or a group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

/// The unit exchanged over a connection, encoded as one JSON text frame.
///
/// Envelopes are built once and never mutated afterwards; the hub encodes
/// each one a single time and shares the encoded frame between every
/// destination queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Sender. `0` for frames synthesized by the server.
    #[serde(default)]
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn new(kind: MessageType, from: UserId) -> Self {
        Self {
            kind,
            content: None,
            from,
            to: None,
            group_id: None,
            message_id: None,
            timestamp: now_ms(),
            data: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn to_user(mut self, user_id: UserId) -> Self {
        self.to = Some(user_id);
        self
    }

    pub fn in_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add one entry to the open payload map.
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// An `error` envelope carrying a category code and a client-safe message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(MessageType::Error, 0)
            .with_content(message)
            .with_data("code", code.as_str())
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong, 0)
    }

    /// Look up a boolean in the payload map.
    pub fn data_bool(&self, key: &str) -> Option<bool> {
        self.data.as_ref()?.get(key)?.as_bool()
    }

    /// Error code of an `error` envelope.
    pub fn error_code(&self) -> Option<ErrorCode> {
        let value = self.data.as_ref()?.get("code")?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A private message as stored by the message store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at_ms: u64,
    #[serde(default)]
    pub read_at_ms: Option<u64>,
}

impl PrivateMessageRecord {
    /// The envelope that carries this message to its recipient.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(MessageType::PrivateMessage, self.sender_id)
            .to_user(self.recipient_id)
            .with_content(self.content.clone())
            .with_message_id(self.id)
            .with_timestamp(self.created_at_ms)
    }
}

/// A group message as stored by the message store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GroupMessageRecord {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at_ms: u64,
}

impl GroupMessageRecord {
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(MessageType::GroupMessage, self.sender_id)
            .in_group(self.group_id)
            .with_content(self.content.clone())
            .with_message_id(self.id)
            .with_timestamp(self.created_at_ms)
    }
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
