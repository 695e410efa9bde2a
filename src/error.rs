use thiserror::Error;

use crate::key::KeyError;

/// Client-side error taxonomy.
///
/// Every variant maps to a stable numeric identifier via
/// [`ClientError::code`], shared with other client implementations of the
/// protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The server emitted an `error` envelope, or a message could not be
    /// understood.
    #[error("internal error: {0}")]
    Internal(String),
    /// A key failed validation before any network operation.
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    /// A client-side constructor or argument failure.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The server rejected a request.
    #[error("request failed: {msg}")]
    Request { code: Option<i64>, msg: String },
}

impl ClientError {
    /// Stable numeric identifier for this error class.
    pub fn code(&self) -> u8 {
        match self {
            ClientError::Internal(_) => 1,
            ClientError::InvalidKey(_) => 2,
            ClientError::InvalidRequest(_) => 3,
            ClientError::Request { .. } => 4,
        }
    }

    pub(crate) fn request(code: i64, msg: impl Into<String>) -> Self {
        ClientError::Request {
            code: Some(code),
            msg: msg.into(),
        }
    }

    pub(crate) fn rejected(msg: impl Into<String>) -> Self {
        ClientError::Request {
            code: None,
            msg: msg.into(),
        }
    }
}
