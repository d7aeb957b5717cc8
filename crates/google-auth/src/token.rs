//! Token endpoint: authorization code exchange and refresh
//!
//! Both calls POST a form body to the client's `token_uri` with different
//! grant types. Every request carries the client timeout; a timeout, DNS
//! failure or reset connection surfaces as `Network` and is safe to retry.
//! Non-success responses surface as `Provider` with the status and raw body,
//! except a refresh rejected with `invalid_grant`, which is terminal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::ClientConfig;
use crate::constants::{DEFAULT_TIMEOUT_SECS, INVALID_GRANT};
use crate::credentials::{BoxFuture, unix_millis};
use crate::error::{Error, Result};

/// Token endpoint response for both exchange and refresh.
///
/// `expires_in` is seconds from the response time.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    /// Space-delimited granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// OAuth error body (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Tokens obtained from an authorization code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: BTreeSet<String>,
    /// Unix milliseconds
    pub expires_at: u64,
}

/// Result of a refresh. `refresh_token` is set only if the provider rotated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: u64,
}

/// Calls to the provider's token endpoint.
///
/// Implementations keep no state between calls.
pub trait TokenExchanger: Send + Sync {
    /// Exchange an authorization code (grant type `authorization_code`).
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        code_verifier: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant>>;

    /// Obtain a new access token (grant type `refresh_token`).
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<RefreshedToken>>;
}

/// reqwest-backed [`TokenExchanger`].
pub struct HttpTokenExchanger {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl HttpTokenExchanger {
    /// Build an exchanger whose requests time out after `timeout`.
    pub fn new(config: Arc<ClientConfig>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("building HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn with_default_timeout(config: Arc<ClientConfig>) -> Result<Self> {
        Self::new(config, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<reqwest::Response> {
        self.client
            .post(&self.config.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timed out" } else { "failed" };
                Error::Network(format!("token endpoint request {kind}: {e}"))
            })
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenGrant> {
        let response = self
            .post_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("code_verifier", code_verifier),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.secret_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .await?;

        let token = read_token_response(response).await?;
        let scopes = match token.scope.as_deref() {
            Some(scope) => parse_scopes(scope),
            None => self.config.scopes.iter().cloned().collect(),
        };
        debug!(
            scopes = scopes.len(),
            has_refresh = token.refresh_token.is_some(),
            "authorization code exchanged"
        );

        Ok(TokenGrant {
            expires_at: expires_at(token.expires_in),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            scopes,
        })
    }

    async fn refresh_access(&self, refresh_token: &str) -> Result<RefreshedToken> {
        let response = self
            .post_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.secret_str()),
            ])
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body(response).await?;
            if is_invalid_grant(&body) {
                warn!(status = status.as_u16(), "refresh token rejected by provider");
                return Err(Error::InvalidGrant(body));
            }
            return Err(Error::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let token = parse_token_body(status, read_body(response).await?)?;
        Ok(RefreshedToken {
            expires_at: expires_at(token.expires_in),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
        })
    }
}

impl TokenExchanger for HttpTokenExchanger {
    fn exchange<'a>(
        &'a self,
        code: &'a str,
        code_verifier: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant>> {
        Box::pin(self.exchange_code(code, code_verifier))
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<RefreshedToken>> {
        Box::pin(self.refresh_access(refresh_token))
    }
}

async fn read_body(response: reqwest::Response) -> Result<String> {
    response
        .text()
        .await
        .map_err(|e| Error::Network(format!("reading token endpoint response: {e}")))
}

async fn read_token_response(response: reqwest::Response) -> Result<TokenResponse> {
    let status = response.status();
    let body = read_body(response).await?;
    if !status.is_success() {
        return Err(Error::Provider {
            status: status.as_u16(),
            body,
        });
    }
    parse_token_body(status, body)
}

fn parse_token_body(status: reqwest::StatusCode, body: String) -> Result<TokenResponse> {
    serde_json::from_str(&body).map_err(|e| {
        warn!(error = %e, "token endpoint returned an unparseable body");
        Error::Provider {
            status: status.as_u16(),
            body,
        }
    })
}

fn is_invalid_grant(body: &str) -> bool {
    serde_json::from_str::<ErrorResponse>(body)
        .map(|e| {
            if let Some(description) = &e.error_description {
                debug!(error = %e.error, description = %description, "provider error response");
            }
            e.error == INVALID_GRANT
        })
        .unwrap_or(false)
}

/// Split a space-delimited scope string into a set.
pub fn parse_scopes(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(String::from).collect()
}

fn expires_at(expires_in_secs: u64) -> u64 {
    unix_millis().saturating_add(expires_in_secs.saturating_mul(1000))
}
