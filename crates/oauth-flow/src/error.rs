//! Error types for flow operations

/// Errors surfaced by the flow controller.
///
/// Only `Network` is transient: the caller may retry the whole operation.
/// `InvalidGrant` and `AuthorizationDenied` mean the user has to go through
/// consent again.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown or expired authorization state")]
    InvalidState,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("credential store error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether retrying later may succeed without user involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::InvalidRequest(_) => "invalid_request",
            Error::InvalidState => "invalid_state",
            Error::AuthorizationDenied(_) => "denied",
            Error::Provider { .. } => "provider",
            Error::Network(_) => "network",
            Error::InvalidGrant(_) => "invalid_grant",
            Error::Storage(_) => "storage",
        }
    }
}

impl From<google_auth::Error> for Error {
    fn from(err: google_auth::Error) -> Self {
        match err {
            google_auth::Error::Configuration(msg) => Error::Configuration(msg),
            google_auth::Error::Provider { status, body } => Error::Provider { status, body },
            google_auth::Error::Network(msg) => Error::Network(msg),
            google_auth::Error::InvalidGrant(msg) => Error::InvalidGrant(msg),
            e @ (google_auth::Error::InvalidRecord(_)
            | google_auth::Error::Io(_)
            | google_auth::Error::CredentialParse(_)) => Error::Storage(e.to_string()),
        }
    }
}

/// Result alias for flow operations.
pub type Result<T> = std::result::Result<T, Error>;
