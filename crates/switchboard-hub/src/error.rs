use switchboard_protocol::{ErrorCode, GroupId, MessageType, UserId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("invalid message: {0}")]
    Malformed(String),

    #[error("unsupported message type: {0}")]
    UnsupportedType(MessageType),

    #[error("message content is empty")]
    EmptyContent,

    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("message is missing its {0}")]
    MissingTarget(&'static str),

    #[error("not allowed to message user {0}")]
    Forbidden(UserId),

    #[error("not a member of group {0}")]
    NotGroupMember(GroupId),

    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("social graph lookup failed: {0:#}")]
    Graph(anyhow::Error),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("hub is shut down")]
    HubClosed,

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HubError {
    /// Convert to protocol error code and sanitized message.
    ///
    /// Collaborator failures never leak their underlying cause to clients.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            HubError::Malformed(_) => (ErrorCode::InvalidMessage, self.to_string()),
            HubError::UnsupportedType(_) => (ErrorCode::UnknownType, self.to_string()),
            HubError::EmptyContent => (ErrorCode::EmptyContent, self.to_string()),
            HubError::ContentTooLong { .. } => (ErrorCode::ContentTooLong, self.to_string()),
            HubError::MissingTarget(_) => (ErrorCode::MissingTarget, self.to_string()),
            HubError::Forbidden(_) => (ErrorCode::Forbidden, self.to_string()),
            HubError::NotGroupMember(_) => (ErrorCode::NotGroupMember, self.to_string()),
            HubError::Persistence(_) => (
                ErrorCode::PersistenceFailed,
                "message could not be saved".to_string(),
            ),
            HubError::Graph(_) => (
                ErrorCode::Internal,
                "could not verify permissions".to_string(),
            ),
            HubError::RateLimited => (ErrorCode::RateLimited, self.to_string()),
            HubError::FrameTooLarge { .. } => (ErrorCode::FrameTooLarge, self.to_string()),
            HubError::HubClosed | HubError::Encode(_) => {
                (ErrorCode::Internal, "internal server error".to_string())
            }
        }
    }
}
