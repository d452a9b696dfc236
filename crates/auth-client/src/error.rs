//! Error types for authenticated requests

use std::time::Duration;

/// Errors surfaced to callers of the authenticated client.
///
/// `Clone` because one refresh failure is handed to every request that was
/// waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("refresh token rejected: {0}")]
    RefreshRejected(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("token refresh abandoned before it settled")]
    RefreshAborted,

    #[error("timed out after {0:?} waiting for token refresh")]
    RefreshTimeout(Duration),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl Error {
    /// HTTP status of the failed response, if the failure was a status.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

impl From<session_auth::Error> for Error {
    fn from(err: session_auth::Error) -> Self {
        match err {
            session_auth::Error::Http(msg) => Error::Http(msg),
            session_auth::Error::Refresh(msg) => Error::RefreshFailed(msg),
            session_auth::Error::InvalidCredentials(msg) => Error::RefreshRejected(msg),
            other @ (session_auth::Error::CredentialParse(_) | session_auth::Error::Io(_)) => {
                Error::Credential(other.to_string())
            }
        }
    }
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
