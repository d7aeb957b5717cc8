//! Google OAuth building blocks
//!
//! Authorization URL construction, token endpoint calls and per-user token
//! storage. This crate holds no flow state of its own; the `oauth-flow` crate
//! wires these pieces into the authorization state machine.
//!
//! Credential flow:
//! 1. `AuthorizationRequestBuilder::build()` produces the URL, `state` and a
//!    pending record with a PKCE verifier
//! 2. The user consents and Google redirects back with `code` and `state`
//! 3. `TokenExchanger::exchange()` trades the code for tokens
//! 4. The resulting `TokenRecord` is written via `CredentialStore::put()`
//! 5. Expired access tokens are renewed on demand with `TokenExchanger::refresh()`

pub mod authorize;
pub mod client;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use authorize::{
    AuthorizationRequest, AuthorizationRequestBuilder, PendingAuthorization, compute_challenge,
    generate_state, generate_verifier,
};
pub use client::{ClientConfig, default_scopes};
pub use constants::*;
pub use credentials::{
    BoxFuture, CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenRecord,
    unix_millis,
};
pub use error::{Error, Result};
pub use token::{HttpTokenExchanger, RefreshedToken, TokenExchanger, TokenGrant, TokenResponse};
