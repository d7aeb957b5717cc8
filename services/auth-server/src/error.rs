//! HTTP mapping for flow errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// A flow error on its way out as an HTTP response.
///
/// `Network` maps to 503 so the bot can retry later; everything that needs
/// the user to consent again maps to 4xx.
#[derive(Debug)]
pub struct ApiError(pub oauth_flow::Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use oauth_flow::Error;
        match &self.0 {
            Error::InvalidRequest(_)
            | Error::InvalidState
            | Error::AuthorizationDenied(_)
            | Error::InvalidGrant(_) => StatusCode::BAD_REQUEST,
            Error::Provider { .. } => StatusCode::BAD_GATEWAY,
            Error::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Configuration(_) | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<oauth_flow::Error> for ApiError {
    fn from(err: oauth_flow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.label(),
            "retryable": self.0.is_retryable(),
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
