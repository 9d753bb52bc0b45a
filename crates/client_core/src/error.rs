use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid session identifier: {0:?}")]
    InvalidSession(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport closed before the frame could be queued")]
    TransportClosed,
    #[error("no active session")]
    NoSession,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("not authorized; sign in again")]
    Unauthorized,
    #[error("{0}")]
    Conflict(String),
    #[error("request failed with status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oauth state mismatch")]
    OAuthStateMismatch,
    #[error("oauth provider returned an error: {0}")]
    OAuthDenied(String),
    #[error("invalid oauth callback: {0}")]
    InvalidCallback(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}
