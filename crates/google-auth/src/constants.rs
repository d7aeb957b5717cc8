//! Google OAuth endpoints and defaults
//!
//! These are the values used when the client secrets file omits them. The
//! client id and secret themselves always come from configuration.

/// Google's OAuth 2.0 authorization endpoint (browser redirect)
pub const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/auth";

/// Google's token endpoint for code exchange and refresh
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Scopes the chat bot needs: identity, Gmail and Calendar.
pub const DEFAULT_SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://mail.google.com/",
    "https://www.googleapis.com/auth/calendar",
];

/// Random bytes in a generated `state` value (256 bits).
pub const STATE_BYTES: usize = 32;

/// Random bytes in a PKCE code verifier. Encodes to 86 characters, inside
/// the 43-128 range RFC 7636 allows.
pub const VERIFIER_BYTES: usize = 64;

/// Default timeout applied to every token endpoint call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// OAuth error code the provider returns for revoked or expired refresh tokens.
pub const INVALID_GRANT: &str = "invalid_grant";
