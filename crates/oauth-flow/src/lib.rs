//! OAuth authorization flow for per-user Google credentials
//!
//! [`FlowController`] owns the set of pending authorizations and drives each
//! user through the flow. Token data lives in a `CredentialStore`; the
//! controller never caches validity and re-derives status from the stored
//! expiry on every check.
//!
//! User lifecycle:
//! 1. `request_authorization` → pending entry + authorization URL
//! 2. Provider redirects back → `handle_callback` consumes the entry exactly
//!    once, exchanges the code and stores the tokens
//! 3. `check_status` reports validity, refreshing an expired access token on
//!    demand (no background refresh task)
//! 4. A refresh rejected with `invalid_grant` deletes the record; the user
//!    has to consent again
//! 5. `revoke` removes everything for the user

pub mod controller;
pub mod error;
pub mod status;

pub use controller::{DEFAULT_PENDING_TTL, FlowController};
pub use error::{Error, Result};
pub use status::{AuthorizedUser, IssuedAuthorization, TokenStatus};
