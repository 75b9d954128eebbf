use thiserror::Error;

/// Failures raised while handling a socket event.
///
/// The first four variants are caused by the client and their text is sent back
/// verbatim in an `error` event. Storage failures are server-side and get logged.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ChatError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ChatError::Invalid(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ChatError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ChatError::Forbidden(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ChatError::Conflict(message.into())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChatError::Invalid(_) | ChatError::NotFound(_) | ChatError::Forbidden(_) | ChatError::Conflict(_)
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
