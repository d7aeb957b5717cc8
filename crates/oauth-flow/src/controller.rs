//! Authorization flow state machine
//!
//! State per user is implicit: a pending entry and/or a stored token record.
//! The pending set is owned here and nowhere else. Lookup-and-remove of a
//! pending entry happens under one lock, so two callbacks racing on the same
//! `state` produce exactly one code exchange.
//!
//! Expired access tokens are refreshed lazily inside `check_status`. A
//! per-user guard makes concurrent checks for one user share a single
//! refresh; the record is re-read after the guard is taken. Callback writes
//! and revocations take the same guard, so a refresh never writes over them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use google_auth::{
    AuthorizationRequestBuilder, CredentialStore, PendingAuthorization, TokenExchanger,
    TokenGrant, TokenRecord, unix_millis,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::status::{AuthorizedUser, IssuedAuthorization, TokenStatus};

/// Maximum age of a pending authorization before its `state` is rejected.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600); // 10 minutes

/// Orchestrates authorization requests, callbacks and status checks.
pub struct FlowController {
    builder: AuthorizationRequestBuilder,
    exchanger: Arc<dyn TokenExchanger>,
    store: Arc<dyn CredentialStore>,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
    pending_ttl: Duration,
    refresh_guards: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FlowController {
    pub fn new(
        builder: AuthorizationRequestBuilder,
        exchanger: Arc<dyn TokenExchanger>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            builder,
            exchanger,
            store,
            pending: Mutex::new(HashMap::new()),
            pending_ttl: DEFAULT_PENDING_TTL,
            refresh_guards: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn pending_ttl(&self) -> Duration {
        self.pending_ttl
    }

    /// NoAuth → Pending: issue an authorization URL for `user_id`.
    pub async fn request_authorization(&self, user_id: &str) -> Result<IssuedAuthorization> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidRequest("user_id must not be empty".into()));
        }

        let request = self.builder.build(user_id)?;

        let mut pending = self.pending.lock().await;
        // Lazy cleanup: drop expired entries while holding the lock
        let ttl = self.pending_ttl;
        pending.retain(|_, p| !p.is_expired(ttl));
        pending.insert(request.state.clone(), request.pending);
        info!(user_id, pending = pending.len(), "authorization requested");
        drop(pending);

        metrics::counter!("oauth_authorizations_requested_total").increment(1);

        Ok(IssuedAuthorization {
            authorization_url: request.authorization_url,
            state: request.state,
        })
    }

    /// Pending → Authorized: redeem the provider's redirect.
    ///
    /// The pending entry is removed before anything else, so a `state` can be
    /// used once whatever the outcome. Unknown or expired states fail with
    /// `InvalidState`; exchange and storage failures are surfaced as-is and
    /// the user must start over.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<AuthorizedUser> {
        let pending = self.pending.lock().await.remove(state);

        let pending = match pending {
            Some(p) if !p.is_expired(self.pending_ttl) => p,
            Some(p) => {
                warn!(user_id = %p.user_id, "authorization state expired");
                record_callback("expired_state");
                return Err(Error::InvalidState);
            }
            None => {
                warn!("callback with unknown authorization state");
                record_callback("invalid_state");
                return Err(Error::InvalidState);
            }
        };
        let user_id = pending.user_id;

        if code.is_empty() {
            record_callback("invalid_request");
            return Err(Error::InvalidRequest("authorization code is empty".into()));
        }

        let grant = match self.exchanger.exchange(code, &pending.code_verifier).await {
            Ok(grant) => grant,
            Err(e) => {
                let err = Error::from(e);
                warn!(user_id = %user_id, error = %err, "authorization code exchange failed");
                record_callback(err.label());
                return Err(err);
            }
        };

        // Writes for this user are serialized with refreshes, so an in-flight
        // refresh cannot overwrite the new grant with the old record.
        let guard = self.refresh_guard(&user_id);
        let stored = {
            let _held = guard.lock().await;
            self.store_grant(&user_id, grant).await
        };
        drop(guard);
        self.release_refresh_guard(&user_id);

        let record = match stored {
            Ok(record) => record,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "failed to store token record");
                record_callback(err.label());
                return Err(err);
            }
        };

        info!(
            user_id = %user_id,
            scopes = record.scopes.len(),
            has_refresh_token = record.refresh_token.is_some(),
            "authorization completed"
        );
        record_callback("authorized");

        Ok(AuthorizedUser {
            user_id,
            scopes: record.scopes,
            expires_at: record.expires_at,
            has_refresh_token: record.refresh_token.is_some(),
        })
    }

    /// Build the record for a fresh grant and store it. Caller holds the
    /// user's refresh guard.
    async fn store_grant(&self, user_id: &str, grant: TokenGrant) -> Result<TokenRecord> {
        // Re-consent without prompt=consent omits the refresh token; the
        // previously granted one stays valid.
        let refresh_token = match grant.refresh_token {
            Some(token) => Some(token),
            None => self
                .store
                .get(user_id)
                .await?
                .and_then(|existing| existing.refresh_token),
        };

        let record = TokenRecord {
            user_id: user_id.to_string(),
            access_token: grant.access_token,
            refresh_token,
            scopes: grant.scopes,
            expires_at: grant.expires_at,
            obtained_at: unix_millis(),
        };
        self.store.put(user_id, &record).await?;
        Ok(record)
    }

    /// The provider redirected with an `error` instead of a code (e.g. the
    /// user pressed "Cancel"). Discards the pending entry when the state is
    /// known and returns `AuthorizationDenied`.
    pub async fn reject_callback(&self, state: Option<&str>, error: &str) -> Error {
        let discarded = match state {
            Some(state) => self.pending.lock().await.remove(state),
            None => None,
        };
        match discarded {
            Some(p) => warn!(user_id = %p.user_id, error, "authorization denied"),
            None => warn!(error, "authorization denied for unknown state"),
        }
        record_callback("denied");
        Error::AuthorizationDenied(error.to_string())
    }

    /// Report the user's token status, refreshing an expired access token.
    ///
    /// `Network` and `Provider` failures during a refresh are returned as
    /// errors so callers can tell "try again later" from
    /// `ReauthorizationRequired`.
    pub async fn check_status(&self, user_id: &str) -> Result<TokenStatus> {
        let status = self.derive_status(user_id).await;
        match &status {
            Ok(s) => {
                debug!(user_id, status = s.label(), "status checked");
                metrics::counter!("oauth_status_checks_total", "status" => s.label()).increment(1);
            }
            Err(e) => {
                metrics::counter!("oauth_status_checks_total", "status" => e.label()).increment(1);
            }
        }
        status
    }

    async fn derive_status(&self, user_id: &str) -> Result<TokenStatus> {
        let Some(record) = self.store.get(user_id).await? else {
            return Ok(self.status_without_record(user_id).await);
        };
        if !record.is_expired_at(unix_millis()) {
            return Ok(TokenStatus::Valid {
                expires_at: record.expires_at,
            });
        }

        let guard = self.refresh_guard(user_id);
        let status = {
            let _held = guard.lock().await;
            self.refresh_expired(user_id).await
        };
        drop(guard);
        self.release_refresh_guard(user_id);
        status
    }

    /// Expired → Authorized | Revoked. Caller holds the user's refresh guard.
    async fn refresh_expired(&self, user_id: &str) -> Result<TokenStatus> {
        // Another check may have refreshed or revoked while we waited
        let Some(record) = self.store.get(user_id).await? else {
            return Ok(self.status_without_record(user_id).await);
        };
        if !record.is_expired_at(unix_millis()) {
            return Ok(TokenStatus::Valid {
                expires_at: record.expires_at,
            });
        }

        let Some(refresh_token) = record.refresh_token.clone() else {
            info!(user_id, "access token expired and no refresh token stored");
            return Ok(TokenStatus::ReauthorizationRequired);
        };

        match self.exchanger.refresh(&refresh_token).await {
            Ok(refreshed) => {
                let updated = TokenRecord {
                    access_token: refreshed.access_token,
                    refresh_token: refreshed.refresh_token.or(record.refresh_token),
                    expires_at: refreshed.expires_at,
                    obtained_at: unix_millis(),
                    ..record
                };
                self.store.put(user_id, &updated).await?;
                info!(user_id, "access token refreshed");
                record_refresh("refreshed");
                Ok(TokenStatus::RefreshedAndValid {
                    expires_at: updated.expires_at,
                })
            }
            Err(google_auth::Error::InvalidGrant(reason)) => {
                warn!(user_id, reason = %reason, "refresh token rejected, removing record");
                record_refresh("invalid_grant");
                self.store.delete(user_id).await?;
                Ok(TokenStatus::ReauthorizationRequired)
            }
            Err(e) => {
                let err = Error::from(e);
                warn!(user_id, error = %err, retryable = err.is_retryable(), "token refresh failed");
                record_refresh(err.label());
                Err(err)
            }
        }
    }

    async fn status_without_record(&self, user_id: &str) -> TokenStatus {
        let pending = self.pending.lock().await;
        let ttl = self.pending_ttl;
        if pending
            .values()
            .any(|p| p.user_id == user_id && !p.is_expired(ttl))
        {
            TokenStatus::Pending
        } else {
            TokenStatus::NoAuth
        }
    }

    /// * → NoAuth: remove the user's token record and pending entries.
    ///
    /// Waits for an in-flight refresh of the same user, so the refresh
    /// cannot write the record back after it is deleted.
    pub async fn revoke(&self, user_id: &str) -> Result<()> {
        let guard = self.refresh_guard(user_id);
        let deleted = {
            let _held = guard.lock().await;
            self.store.delete(user_id).await
        };
        drop(guard);
        self.release_refresh_guard(user_id);
        deleted?;

        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.user_id != user_id);
        info!(user_id, discarded_pending = before - pending.len(), "authorization revoked");
        Ok(())
    }

    /// Number of pending authorizations that can still be redeemed.
    pub async fn pending_count(&self) -> usize {
        let pending = self.pending.lock().await;
        let ttl = self.pending_ttl;
        pending.values().filter(|p| !p.is_expired(ttl)).count()
    }

    fn refresh_guard(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.refresh_guards.lock().unwrap_or_else(|e| e.into_inner());
        guards.entry(user_id.to_string()).or_default().clone()
    }

    fn release_refresh_guard(&self, user_id: &str) {
        let mut guards = self.refresh_guards.lock().unwrap_or_else(|e| e.into_inner());
        if guards.get(user_id).is_some_and(|g| Arc::strong_count(g) == 1) {
            guards.remove(user_id);
        }
    }
}

fn record_callback(outcome: &'static str) {
    metrics::counter!("oauth_callbacks_total", "outcome" => outcome).increment(1);
}

fn record_refresh(outcome: &'static str) {
    metrics::counter!("oauth_token_refreshes_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_auth::{
        BoxFuture, ClientConfig, FileCredentialStore, MemoryCredentialStore, RefreshedToken,
    };
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        InvalidGrant,
        Network,
        Provider,
    }

    /// Token endpoint stand-in that counts calls.
    struct StubExchanger {
        exchange_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
        exchange_outcome: Outcome,
        refresh_outcome: Outcome,
        grants_refresh_token: bool,
        delay: Duration,
        refresh_delay: Duration,
    }

    impl StubExchanger {
        fn new() -> Self {
            Self {
                exchange_calls: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
                exchange_outcome: Outcome::Succeed,
                refresh_outcome: Outcome::Succeed,
                grants_refresh_token: true,
                delay: Duration::ZERO,
                refresh_delay: Duration::ZERO,
            }
        }

        fn failing(outcome: Outcome) -> google_auth::Error {
            match outcome {
                Outcome::InvalidGrant => google_auth::Error::InvalidGrant(
                    r#"{"error":"invalid_grant"}"#.into(),
                ),
                Outcome::Network => google_auth::Error::Network("connection reset".into()),
                Outcome::Provider | Outcome::Succeed => google_auth::Error::Provider {
                    status: 400,
                    body: r#"{"error":"invalid_request"}"#.into(),
                },
            }
        }
    }

    impl TokenExchanger for StubExchanger {
        fn exchange<'a>(
            &'a self,
            _code: &'a str,
            _code_verifier: &'a str,
        ) -> BoxFuture<'a, google_auth::Result<TokenGrant>> {
            Box::pin(async move {
                self.exchange_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                match self.exchange_outcome {
                    Outcome::Succeed => Ok(TokenGrant {
                        access_token: "AT1".into(),
                        refresh_token: self.grants_refresh_token.then(|| "RT1".to_string()),
                        scopes: BTreeSet::from(["openid".to_string()]),
                        expires_at: unix_millis() + 3_600_000,
                    }),
                    other => Err(Self::failing(other)),
                }
            })
        }

        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> BoxFuture<'a, google_auth::Result<RefreshedToken>> {
            Box::pin(async move {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay + self.refresh_delay).await;
                match self.refresh_outcome {
                    Outcome::Succeed => Ok(RefreshedToken {
                        access_token: "AT2".into(),
                        refresh_token: None,
                        expires_at: unix_millis() + 3_600_000,
                    }),
                    other => Err(Self::failing(other)),
                }
            })
        }
    }

    fn client_config() -> Arc<ClientConfig> {
        Arc::new(ClientConfig::new(
            "client-123",
            "GOCSPX-abc",
            "https://taskiq.io/auth/google",
        ))
    }

    fn controller(
        exchanger: Arc<StubExchanger>,
        store: Arc<dyn CredentialStore>,
    ) -> FlowController {
        FlowController::new(
            AuthorizationRequestBuilder::new(client_config()),
            exchanger,
            store,
        )
    }

    fn expired_record(user_id: &str, refresh_token: Option<&str>) -> TokenRecord {
        TokenRecord {
            user_id: user_id.to_string(),
            access_token: "AT_old".into(),
            refresh_token: refresh_token.map(String::from),
            scopes: BTreeSet::from([
                "openid".to_string(),
                "https://mail.google.com/".to_string(),
            ]),
            expires_at: unix_millis() - 1_000,
            obtained_at: unix_millis() - 3_601_000,
        }
    }

    #[tokio::test]
    async fn request_then_status_is_pending() {
        let flow = controller(Arc::new(StubExchanger::new()), Arc::new(MemoryCredentialStore::new()));

        flow.request_authorization("alice@example.com").await.unwrap();
        let status = flow.check_status("alice@example.com").await.unwrap();
        assert_eq!(status, TokenStatus::Pending);
        assert_eq!(flow.check_status("bob@example.com").await.unwrap(), TokenStatus::NoAuth);
    }

    #[tokio::test]
    async fn alice_scenario_ends_valid() {
        let store = Arc::new(MemoryCredentialStore::new());
        let exchanger = Arc::new(StubExchanger::new());
        let flow = controller(exchanger.clone(), store.clone());

        let issued = flow.request_authorization("alice@example.com").await.unwrap();
        assert!(
            issued
                .authorization_url
                .contains(&format!("state={}", issued.state))
        );

        let user = flow.handle_callback("abc", &issued.state).await.unwrap();
        assert_eq!(user.user_id, "alice@example.com");
        assert!(user.has_refresh_token);

        let status = flow.check_status("alice@example.com").await.unwrap();
        assert!(matches!(status, TokenStatus::Valid { .. }), "got {status:?}");

        let record = store.get("alice@example.com").await.unwrap().unwrap();
        assert_eq!(record.access_token, "AT1");
        assert_eq!(record.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_state_is_rejected_without_record() {
        let store = Arc::new(MemoryCredentialStore::new());
        let exchanger = Arc::new(StubExchanger::new());
        let flow = controller(exchanger.clone(), store.clone());

        let result = flow.handle_callback("abc", "never-issued").await;
        assert!(matches!(result, Err(Error::InvalidState)));
        assert!(store.is_empty().await);
        assert_eq!(exchanger.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn racing_callbacks_exchange_once() {
        let mut stub = StubExchanger::new();
        stub.delay = Duration::from_millis(50);
        let exchanger = Arc::new(stub);
        let flow = Arc::new(controller(
            exchanger.clone(),
            Arc::new(MemoryCredentialStore::new()),
        ));

        let issued = flow.request_authorization("alice@example.com").await.unwrap();

        let (a, b) = tokio::join!(
            flow.handle_callback("abc", &issued.state),
            flow.handle_callback("abc", &issued.state),
        );

        assert_eq!(exchanger.exchange_calls.load(Ordering::SeqCst), 1);
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::InvalidState)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn racing_callbacks_across_tasks_exchange_once() {
        let mut stub = StubExchanger::new();
        stub.delay = Duration::from_millis(20);
        let exchanger = Arc::new(stub);
        let flow = Arc::new(controller(
            exchanger.clone(),
            Arc::new(MemoryCredentialStore::new()),
        ));
        let issued = flow.request_authorization("alice@example.com").await.unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let flow = flow.clone();
            let state = issued.state.clone();
            handles.push(tokio::spawn(async move {
                flow.handle_callback("abc", &state).await.is_ok()
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(exchanger.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_is_single_use() {
        let flow = controller(Arc::new(StubExchanger::new()), Arc::new(MemoryCredentialStore::new()));
        let issued = flow.request_authorization("alice").await.unwrap();

        flow.handle_callback("abc", &issued.state).await.unwrap();
        let replay = flow.handle_callback("abc", &issued.state).await;
        assert!(matches!(replay, Err(Error::InvalidState)));
    }

    #[tokio::test]
    async fn expired_state_is_rejected_and_discarded() {
        let exchanger = Arc::new(StubExchanger::new());
        let flow = controller(exchanger.clone(), Arc::new(MemoryCredentialStore::new()));
        let issued = flow.request_authorization("alice").await.unwrap();

        {
            let mut pending = flow.pending.lock().await;
            let entry = pending.get_mut(&issued.state).unwrap();
            entry.created_at = Instant::now() - (DEFAULT_PENDING_TTL + Duration::from_secs(60));
        }

        let result = flow.handle_callback("abc", &issued.state).await;
        assert!(matches!(result, Err(Error::InvalidState)));
        assert_eq!(exchanger.exchange_calls.load(Ordering::SeqCst), 0);
        assert!(flow.pending.lock().await.is_empty());
        assert_eq!(flow.check_status("alice").await.unwrap(), TokenStatus::NoAuth);
    }

    #[tokio::test]
    async fn exchange_failure_consumes_state() {
        let mut stub = StubExchanger::new();
        stub.exchange_outcome = Outcome::Provider;
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(Arc::new(stub), store.clone());
        let issued = flow.request_authorization("alice").await.unwrap();

        let first = flow.handle_callback("abc", &issued.state).await;
        assert!(matches!(first, Err(Error::Provider { status: 400, .. })));
        assert!(store.is_empty().await);

        let retry = flow.handle_callback("abc", &issued.state).await;
        assert!(matches!(retry, Err(Error::InvalidState)));
        assert_eq!(flow.check_status("alice").await.unwrap(), TokenStatus::NoAuth);
    }

    #[tokio::test]
    async fn empty_code_consumes_state() {
        let exchanger = Arc::new(StubExchanger::new());
        let flow = controller(exchanger.clone(), Arc::new(MemoryCredentialStore::new()));
        let issued = flow.request_authorization("alice").await.unwrap();

        let result = flow.handle_callback("", &issued.state).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
        assert_eq!(exchanger.exchange_calls.load(Ordering::SeqCst), 0);
        assert_eq!(flow.pending_count().await, 0);
    }

    #[tokio::test]
    async fn repeat_consent_without_refresh_token_keeps_previous_one() {
        let store = Arc::new(MemoryCredentialStore::new());
        let first = controller(Arc::new(StubExchanger::new()), store.clone());
        let issued = first.request_authorization("alice").await.unwrap();
        first.handle_callback("abc", &issued.state).await.unwrap();

        let mut stub = StubExchanger::new();
        stub.grants_refresh_token = false;
        let second = controller(Arc::new(stub), store.clone());
        let issued = second.request_authorization("alice").await.unwrap();
        let user = second.handle_callback("def", &issued.state).await.unwrap();

        assert!(user.has_refresh_token);
        let record = store.get("alice").await.unwrap().unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("RT1"));
    }

    #[tokio::test]
    async fn valid_record_needs_no_refresh() {
        let store = Arc::new(MemoryCredentialStore::new());
        let exchanger = Arc::new(StubExchanger::new());
        let flow = controller(exchanger.clone(), store.clone());

        let mut record = expired_record("alice", Some("RT1"));
        record.expires_at = unix_millis() + 60_000;
        store.put("alice", &record).await.unwrap();

        let status = flow.check_status("alice").await.unwrap();
        assert_eq!(status, TokenStatus::Valid { expires_at: record.expires_at });
        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let store = Arc::new(MemoryCredentialStore::new());
        let exchanger = Arc::new(StubExchanger::new());
        let flow = controller(exchanger.clone(), store.clone());
        let before = expired_record("alice", Some("RT1"));
        store.put("alice", &before).await.unwrap();

        let status = flow.check_status("alice").await.unwrap();

        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 1);
        let TokenStatus::RefreshedAndValid { expires_at } = status else {
            panic!("expected RefreshedAndValid, got {status:?}");
        };
        assert!(expires_at > before.expires_at);

        let after = store.get("alice").await.unwrap().unwrap();
        assert_eq!(after.access_token, "AT2");
        assert_eq!(after.expires_at, expires_at);
        assert_eq!(after.refresh_token, before.refresh_token);
        assert_eq!(after.scopes, before.scopes);
        assert!(after.obtained_at > before.obtained_at);

        // Now fresh: no second refresh
        let again = flow.check_status("alice").await.unwrap();
        assert!(matches!(again, TokenStatus::Valid { .. }));
        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_checks_share_one_refresh() {
        let mut stub = StubExchanger::new();
        stub.delay = Duration::from_millis(50);
        let exchanger = Arc::new(stub);
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(exchanger.clone(), store.clone());
        store
            .put("alice", &expired_record("alice", Some("RT1")))
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            flow.check_status("alice"),
            flow.check_status("alice"),
            flow.check_status("alice"),
        );

        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 1);
        for status in [a, b, c] {
            assert!(status.unwrap().is_valid());
        }
        assert!(flow.refresh_guards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_grant_requires_reauthorization_and_deletes_record() {
        let mut stub = StubExchanger::new();
        stub.refresh_outcome = Outcome::InvalidGrant;
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(Arc::new(stub), store.clone());
        store
            .put("alice", &expired_record("alice", Some("RT_revoked")))
            .await
            .unwrap();

        let status = flow.check_status("alice").await.unwrap();
        assert_eq!(status, TokenStatus::ReauthorizationRequired);
        assert!(store.get("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn network_failure_during_refresh_is_retryable_and_keeps_record() {
        let mut stub = StubExchanger::new();
        stub.refresh_outcome = Outcome::Network;
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(Arc::new(stub), store.clone());
        let record = expired_record("alice", Some("RT1"));
        store.put("alice", &record).await.unwrap();

        let err = flow.check_status("alice").await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.is_retryable());
        assert_eq!(store.get("alice").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn provider_failure_during_refresh_is_not_reauthorization() {
        let mut stub = StubExchanger::new();
        stub.refresh_outcome = Outcome::Provider;
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(Arc::new(stub), store.clone());
        store
            .put("alice", &expired_record("alice", Some("RT1")))
            .await
            .unwrap();

        let err = flow.check_status("alice").await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert!(store.get("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_without_refresh_token_requires_reauthorization() {
        let exchanger = Arc::new(StubExchanger::new());
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(exchanger.clone(), store.clone());
        store
            .put("alice", &expired_record("alice", None))
            .await
            .unwrap();

        let status = flow.check_status("alice").await.unwrap();
        assert_eq!(status, TokenStatus::ReauthorizationRequired);
        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revoke_returns_user_to_no_auth() {
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(Arc::new(StubExchanger::new()), store.clone());
        let issued = flow.request_authorization("alice").await.unwrap();
        flow.handle_callback("abc", &issued.state).await.unwrap();
        flow.request_authorization("alice").await.unwrap();

        flow.revoke("alice").await.unwrap();
        assert_eq!(flow.check_status("alice").await.unwrap(), TokenStatus::NoAuth);
        assert_eq!(flow.pending_count().await, 0);

        // Idempotent
        flow.revoke("alice").await.unwrap();
    }

    #[tokio::test]
    async fn revoke_during_refresh_leaves_no_record() {
        let mut stub = StubExchanger::new();
        stub.refresh_delay = Duration::from_millis(100);
        let exchanger = Arc::new(stub);
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(exchanger.clone(), store.clone());
        store
            .put("alice", &expired_record("alice", Some("RT1")))
            .await
            .unwrap();

        let (status, revoked) = tokio::join!(flow.check_status("alice"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flow.revoke("alice").await
        });

        assert!(status.unwrap().is_valid());
        revoked.unwrap();
        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(store.get("alice").await.unwrap().is_none());
        assert_eq!(flow.check_status("alice").await.unwrap(), TokenStatus::NoAuth);
        assert!(flow.refresh_guards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn callback_during_refresh_keeps_new_grant() {
        let mut stub = StubExchanger::new();
        stub.refresh_delay = Duration::from_millis(100);
        let exchanger = Arc::new(stub);
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(exchanger.clone(), store.clone());
        store
            .put("alice", &expired_record("alice", Some("RT_old")))
            .await
            .unwrap();
        let issued = flow.request_authorization("alice").await.unwrap();

        let (status, authorized) = tokio::join!(flow.check_status("alice"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flow.handle_callback("abc", &issued.state).await
        });

        assert!(status.unwrap().is_valid());
        authorized.unwrap();
        let record = store.get("alice").await.unwrap().unwrap();
        assert_eq!(record.access_token, "AT1");
        assert_eq!(record.refresh_token.as_deref(), Some("RT1"));
        assert!(flow.refresh_guards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_after_revoke_sees_no_record() {
        let mut stub = StubExchanger::new();
        stub.refresh_delay = Duration::from_millis(50);
        let exchanger = Arc::new(stub);
        let store = Arc::new(MemoryCredentialStore::new());
        let flow = controller(exchanger.clone(), store.clone());
        store
            .put("alice", &expired_record("alice", Some("RT1")))
            .await
            .unwrap();

        // The second check queues behind the refresh, the revoke behind both.
        let (first, second, revoked) = tokio::join!(
            flow.check_status("alice"),
            flow.check_status("alice"),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                flow.revoke("alice").await
            },
        );

        assert!(first.unwrap().is_valid());
        assert!(second.unwrap().is_valid());
        revoked.unwrap();
        assert_eq!(exchanger.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(store.get("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn denied_callback_discards_pending_entry() {
        let flow = controller(Arc::new(StubExchanger::new()), Arc::new(MemoryCredentialStore::new()));
        let issued = flow.request_authorization("alice").await.unwrap();

        let err = flow.reject_callback(Some(&issued.state), "access_denied").await;
        assert!(matches!(err, Error::AuthorizationDenied(ref e) if e == "access_denied"));

        let late = flow.handle_callback("abc", &issued.state).await;
        assert!(matches!(late, Err(Error::InvalidState)));
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let flow = controller(Arc::new(StubExchanger::new()), Arc::new(MemoryCredentialStore::new()));
        let result = flow.request_authorization("   ").await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn missing_client_config_is_configuration_error() {
        let config = Arc::new(ClientConfig::new("", "", "https://taskiq.io/auth/google"));
        let flow = FlowController::new(
            AuthorizationRequestBuilder::new(config),
            Arc::new(StubExchanger::new()),
            Arc::new(MemoryCredentialStore::new()),
        );
        let result = flow.request_authorization("alice").await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(flow.pending_count().await, 0);
    }

    #[tokio::test]
    async fn stale_pending_entries_are_purged() {
        let flow = controller(Arc::new(StubExchanger::new()), Arc::new(MemoryCredentialStore::new()))
            .with_pending_ttl(Duration::from_millis(30));
        flow.request_authorization("alice").await.unwrap();
        flow.request_authorization("bob").await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(flow.pending_count().await, 0);
        assert_eq!(flow.check_status("alice").await.unwrap(), TokenStatus::NoAuth);

        flow.request_authorization("carol").await.unwrap();
        assert_eq!(flow.pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn flow_persists_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileCredentialStore::open(dir.path().join("tokens"))
                .await
                .unwrap(),
        );
        let flow = controller(Arc::new(StubExchanger::new()), store);
        let issued = flow.request_authorization("alice@example.com").await.unwrap();
        flow.handle_callback("abc", &issued.state).await.unwrap();
        drop(flow);

        let reopened = Arc::new(
            FileCredentialStore::open(dir.path().join("tokens"))
                .await
                .unwrap(),
        );
        let flow = controller(Arc::new(StubExchanger::new()), reopened);
        let status = flow.check_status("alice@example.com").await.unwrap();
        assert!(matches!(status, TokenStatus::Valid { .. }));
    }

    #[tokio::test]
    async fn callback_outcomes_are_counted() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let flow = controller(Arc::new(StubExchanger::new()), Arc::new(MemoryCredentialStore::new()));
        let issued = flow.request_authorization("alice").await.unwrap();
        flow.handle_callback("abc", &issued.state).await.unwrap();
        let _ = flow.handle_callback("abc", "forged").await;

        let output = handle.render();
        assert!(output.contains("oauth_authorizations_requested_total"));
        assert!(output.contains("outcome=\"authorized\""), "got: {output}");
        assert!(output.contains("outcome=\"invalid_state\""), "got: {output}");
    }
}
