//! Error types for Google OAuth operations

/// Errors from credential storage, authorization URL building and the token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("invalid token record: {0}")]
    InvalidRecord(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
