use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream failed: {0}")]
    Stream(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Http(_) | SessionError::Status { .. } | SessionError::Stream(_)
        )
    }
}

/// Misuse of the confirmation sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("no operation is awaiting confirmation")]
    NoPendingOperation,

    #[error("cannot execute an operation before the backend has assigned a conversation id")]
    MissingConversation,

    #[error("confirmation chain exceeded {limit} rounds")]
    ChainTooDeep { limit: u32 },

    #[error("an operation is awaiting confirmation; approve or reject it first")]
    ConfirmationPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("an operation is awaiting confirmation; approve or reject it instead of stopping")]
    AwaitingConfirmation,
}

pub type SessionResult<T> = Result<T, SessionError>;
