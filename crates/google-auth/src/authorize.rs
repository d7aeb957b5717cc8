//! Authorization request construction
//!
//! Produces the provider authorization URL together with the pending record
//! that lets the callback be matched back to a user. Each request carries two
//! random values:
//!
//! - `state`: anti-forgery token echoed back by the provider on redirect
//! - a PKCE code verifier (RFC 7636), sent only in the later token exchange;
//!   its S256 challenge goes into the URL
//!
//! Building a request performs no network call. Registering the pending
//! record is the flow controller's job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use url::Url;

use crate::client::ClientConfig;
use crate::constants::{STATE_BYTES, VERIFIER_BYTES};
use crate::error::{Error, Result};

/// An issued authorization URL that has not been redeemed yet.
#[derive(Clone)]
pub struct PendingAuthorization {
    pub state: String,
    pub user_id: String,
    pub created_at: Instant,
    pub code_verifier: String,
}

impl PendingAuthorization {
    /// Whether this entry is older than `ttl` and must no longer be honored.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Output of [`AuthorizationRequestBuilder::build`].
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub state: String,
    pub pending: PendingAuthorization,
}

/// Builds provider authorization URLs bound to a user identifier.
#[derive(Debug, Clone)]
pub struct AuthorizationRequestBuilder {
    config: Arc<ClientConfig>,
}

impl AuthorizationRequestBuilder {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Generate a fresh state + verifier and the matching authorization URL.
    ///
    /// Fails with `Configuration` if the client id, client secret or redirect
    /// URI are missing, or an endpoint is not a valid URL.
    pub fn build(&self, user_id: &str) -> Result<AuthorizationRequest> {
        self.config.validate()?;

        let state = generate_state();
        let code_verifier = generate_verifier();
        let challenge = compute_challenge(&code_verifier);
        let authorization_url = self.authorization_url(&state, &challenge)?;

        Ok(AuthorizationRequest {
            authorization_url,
            state: state.clone(),
            pending: PendingAuthorization {
                state,
                user_id: user_id.to_string(),
                created_at: Instant::now(),
                code_verifier,
            },
        })
    }

    fn authorization_url(&self, state: &str, challenge: &str) -> Result<String> {
        let scope = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.config.auth_uri,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", state),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| Error::Configuration(format!("auth_uri is not a valid URL: {e}")))?;
        Ok(url.into())
    }
}

/// Generate an unguessable `state` value (256 random bits, URL-safe base64).
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a PKCE code verifier.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
