use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit delivery failed: {0}")]
    Delivery(String),

    #[error("invalid audit configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Encoding(err.to_string())
    }
}
