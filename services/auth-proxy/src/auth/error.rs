use thiserror::Error;

use crate::kube::UpstreamError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer credential")]
    MissingCredential,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Token review failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Authentication timed out")]
    Timeout,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::InvalidToken(err.to_string())
    }
}

impl AuthError {
    /// Whether a decision could not be obtained, as opposed to a rejection.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, AuthError::Upstream(_) | AuthError::Timeout)
    }
}
