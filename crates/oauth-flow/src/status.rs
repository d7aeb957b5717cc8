//! Per-user authorization status

use std::collections::BTreeSet;

/// Outcome of a status check.
///
/// Transitions (implicit, derived from stored data at call time):
/// - NoAuth → Pending (authorization URL issued)
/// - Pending → Valid (callback exchanged a code)
/// - Valid → RefreshedAndValid (access token expired, refresh succeeded)
/// - Valid → ReauthorizationRequired (refresh rejected or no refresh token)
/// - any → NoAuth (revoked)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    NoAuth,
    Pending,
    Valid { expires_at: u64 },
    RefreshedAndValid { expires_at: u64 },
    ReauthorizationRequired,
}

impl TokenStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TokenStatus::NoAuth => "no_auth",
            TokenStatus::Pending => "pending",
            TokenStatus::Valid { .. } => "valid",
            TokenStatus::RefreshedAndValid { .. } => "refreshed_and_valid",
            TokenStatus::ReauthorizationRequired => "reauthorization_required",
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(
            self,
            TokenStatus::Valid { .. } | TokenStatus::RefreshedAndValid { .. }
        )
    }

    /// Access token expiry (unix ms) when the status is valid.
    pub fn expires_at(&self) -> Option<u64> {
        match self {
            TokenStatus::Valid { expires_at } | TokenStatus::RefreshedAndValid { expires_at } => {
                Some(*expires_at)
            }
            _ => None,
        }
    }
}

/// A freshly issued authorization URL.
#[derive(Debug, Clone)]
pub struct IssuedAuthorization {
    pub authorization_url: String,
    pub state: String,
}

/// Result of a successful callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedUser {
    pub user_id: String,
    pub scopes: BTreeSet<String>,
    pub expires_at: u64,
    pub has_refresh_token: bool,
}
