//! OAuth HTTP endpoints
//!
//! Endpoints:
//! - GET    /                   service banner
//! - GET    /generate-auth-url  start a flow for `?email=<user_id>`
//! - GET    /auth/google        provider redirect target, renders HTML
//! - GET    /token/{user_id}    token status, refreshing when expired
//! - DELETE /token/{user_id}    revoke stored tokens

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use oauth_flow::FlowController;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::pages;

/// Shared state for OAuth handlers.
#[derive(Clone)]
pub struct ApiState {
    flow: Arc<FlowController>,
}

impl ApiState {
    pub fn new(flow: Arc<FlowController>) -> Self {
        Self { flow }
    }
}

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/generate-auth-url", get(generate_auth_url))
        .route("/auth/google", get(auth_callback))
        .route("/token/{user_id}", get(token_status).delete(revoke_token))
        .with_state(state)
}

fn json_ok(body: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn root() -> Response {
    json_ok(serde_json::json!({ "message": "TaskIQ Auth Server is running" }))
}

#[derive(Deserialize)]
struct AuthUrlQuery {
    #[serde(default)]
    email: String,
}

/// GET /generate-auth-url: issue an authorization URL bound to `email`.
async fn generate_auth_url(
    State(state): State<ApiState>,
    Query(query): Query<AuthUrlQuery>,
) -> Result<Response, ApiError> {
    let issued = state.flow.request_authorization(&query.email).await?;
    Ok(json_ok(serde_json::json!({
        "auth_url": issued.authorization_url,
        "email": query.email,
    })))
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// GET /auth/google: the provider's redirect back to us.
///
/// Always answers with an HTML page since a browser is on the other end.
async fn auth_callback(
    State(state): State<ApiState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        let err = state.flow.reject_callback(query.state.as_deref(), &error).await;
        return html_error(ApiError(err));
    }

    let Some(oauth_state) = query.state else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page("missing state parameter")),
        )
            .into_response();
    };
    let Some(code) = query.code else {
        return (
            StatusCode::BAD_REQUEST,
            Html(pages::error_page("No authorization code received")),
        )
            .into_response();
    };

    match state.flow.handle_callback(&code, &oauth_state).await {
        Ok(user) => (StatusCode::OK, Html(pages::success_page(&user.user_id))).into_response(),
        Err(e) => html_error(ApiError(e)),
    }
}

fn html_error(err: ApiError) -> Response {
    let message = match &err.0 {
        oauth_flow::Error::InvalidState => {
            "This sign-in link is invalid or has expired. Request a new one.".to_string()
        }
        oauth_flow::Error::Provider { status, .. } => {
            format!("Google rejected the sign-in (HTTP {status}).")
        }
        oauth_flow::Error::Network(_) => {
            "Google could not be reached. Please try again in a moment.".to_string()
        }
        oauth_flow::Error::Storage(_) | oauth_flow::Error::Configuration(_) => {
            "The server could not complete the sign-in.".to_string()
        }
        other => other.to_string(),
    };
    (err.status(), Html(pages::error_page(&message))).into_response()
}

/// GET /token/{user_id}: report whether the bot can act for this user.
///
/// Network failures during a refresh answer 503 with `"retryable": true`,
/// distinct from `reauthorization_required`.
async fn token_status(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.flow.check_status(&user_id).await?;
    let mut body = serde_json::json!({
        "user_id": user_id,
        "status": status.label(),
        "has_token": status.is_valid(),
        "valid": status.is_valid(),
    });
    if let Some(expires_at) = status.expires_at() {
        body["expires_at"] = serde_json::json!(expires_at);
    }
    Ok(json_ok(body))
}

/// DELETE /token/{user_id}: forget the user's tokens. Idempotent.
async fn revoke_token(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Response, ApiError> {
    if let Err(e) = state.flow.revoke(&user_id).await {
        warn!(user_id = %user_id, error = %e, "revocation failed");
        return Err(e.into());
    }
    info!(user_id = %user_id, "tokens revoked via API");
    Ok(json_ok(serde_json::json!({
        "user_id": user_id,
        "status": "revoked",
    })))
}
