/// Session state machine: sign-in, callback, validation, refresh and sign-out
use crate::callback::CallbackParams;
use crate::config::KickConfig;
use crate::error::{AuthError, Result};
use crate::gateway::IdentityGateway;
use crate::http::{HttpClient, ReqwestClient};
use crate::lock::RefreshLockManager;
use crate::pkce::{self, OsRandom, Pkce, RandomSource};
use crate::storage::DurableStore;
use crate::timer::{refresh_delay, RefreshTimer};
use crate::token_store::{Clock, SystemClock, TokenStore};
use crate::users::{self, LocalUser, UserDirectory};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use url::Url;

const REFRESH_LOCK_KEY: &str = "kick_tokens";

/// Where the session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, no check has run yet
    Uninitialized,
    Checking,
    Authenticated,
    Anonymous,
    LoggingIn,
    LoggingOut,
    Refreshing,
}

impl SessionPhase {
    pub fn is_loading(self) -> bool {
        !matches!(self, SessionPhase::Authenticated | SessionPhase::Anonymous)
    }
}

/// Point-in-time view of the session handed to readers and listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user: Option<LocalUser>,
    pub phase: SessionPhase,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.phase.is_loading()
    }
}

/// Authorization flow result
#[derive(Debug, Clone)]
pub struct AuthFlowResult {
    /// Provider authorization URL to navigate to
    pub url: String,
    pub state: String,
}

/// Sends the user agent to the provider's authorization page
pub trait Navigator: Send + Sync {
    fn navigate(&self, url: &str) -> Result<()>;
}

/// Opens the authorization URL in the system browser
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserNavigator;

impl Navigator for BrowserNavigator {
    fn navigate(&self, url: &str) -> Result<()> {
        webbrowser::open(url)?;
        Ok(())
    }
}

pub type SessionListener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Everything the session manager talks to
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub http: Arc<dyn HttpClient>,
    pub directory: Arc<dyn UserDirectory>,
    pub random: Arc<dyn RandomSource>,
    pub clock: Arc<dyn Clock>,
    /// Serializes refreshes with other processes sharing `store`
    pub refresh_lock: Option<RefreshLockManager>,
}

impl Collaborators {
    /// Production wiring: reqwest with the configured timeout, OS randomness,
    /// system clock
    pub fn new(
        config: &KickConfig,
        store: Arc<dyn DurableStore>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            http: Arc::new(ReqwestClient::new(config.request_timeout())?),
            directory,
            random: Arc::new(OsRandom),
            clock: Arc::new(SystemClock),
            refresh_lock: None,
        })
    }

    pub fn with_refresh_lock(mut self, manager: RefreshLockManager) -> Self {
        self.refresh_lock = Some(manager);
        self
    }
}

/// Session manager
///
/// Every state-changing operation runs under one operation lock, so a manual
/// refresh never races the passive refresh timer. Listeners are called
/// synchronously while that lock is held and must not call back into
/// operations.
pub struct SessionManager {
    tokens: Arc<TokenStore>,
    gateway: IdentityGateway,
    directory: Arc<dyn UserDirectory>,
    random: Arc<dyn RandomSource>,
    refresh_lock: Option<RefreshLockManager>,
    state: RwLock<SessionSnapshot>,
    operation: Mutex<()>,
    timer: RefreshTimer,
    listeners: RwLock<Vec<(SubscriptionId, SessionListener)>>,
    next_subscription: AtomicU64,
    this: Weak<SessionManager>,
}

/// Marks an operation in flight; settles the phase when dropped
struct Transition<'a> {
    manager: &'a SessionManager,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        self.manager.settle();
    }
}

impl SessionManager {
    pub fn new(config: KickConfig, collaborators: Collaborators) -> Arc<Self> {
        let tokens = Arc::new(TokenStore::new(collaborators.store, collaborators.clock));
        let gateway = IdentityGateway::new(config, collaborators.http, tokens.clone());

        Arc::new_cyclic(|this| Self {
            tokens,
            gateway,
            directory: collaborators.directory,
            random: collaborators.random,
            refresh_lock: collaborators.refresh_lock,
            state: RwLock::new(SessionSnapshot {
                user: None,
                phase: SessionPhase::Uninitialized,
            }),
            operation: Mutex::new(()),
            timer: RefreshTimer::new(),
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &KickConfig {
        self.gateway.config()
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.read().clone()
    }

    pub fn user(&self) -> Option<LocalUser> {
        self.state.read().user.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.read().phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        self.state.read().is_loading()
    }

    /// When the passive refresh is due, if one is armed
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Call `listener` with a snapshot after every phase change
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Prepare a sign-in and return the URL to send the user to
    ///
    /// Persists a fresh state and code verifier, abandoning any earlier
    /// pending sign-in.
    pub fn begin_login(&self) -> Result<AuthFlowResult> {
        self.run(SessionPhase::LoggingIn, || {
            let result = self.prepare_login();
            if result.is_err() {
                self.discard_flow_state();
            }
            result
        })
    }

    /// Prepare a sign-in and navigate to the provider
    pub fn login(&self, navigator: &dyn Navigator) -> Result<AuthFlowResult> {
        let flow = self.begin_login()?;
        if let Err(e) = navigator.navigate(&flow.url) {
            tracing::warn!(error = %e, "Failed to open the authorization page");
            self.discard_flow_state();
            return Err(e);
        }
        Ok(flow)
    }

    /// Complete a sign-in from the provider redirect
    ///
    /// The pending flow state is consumed whatever the outcome. A state or
    /// verifier failure leaves an existing session alone; an exchange or
    /// validation failure clears it.
    pub fn handle_auth_callback(&self, code: &str, state: &str) -> Result<SessionSnapshot> {
        self.run(SessionPhase::Checking, || {
            let code_verifier = self.consume_flow_state(state)?;

            if let Err(e) = self.gateway.exchange_code_for_token(code, &code_verifier) {
                tracing::warn!(error = %e, "Authorization code exchange failed");
                self.invalidate();
                return Err(e);
            }

            self.validate()?;
            tracing::info!("Kick sign-in completed");
            Ok(())
        })?;

        Ok(self.snapshot())
    }

    pub fn resume_from_callback(&self, params: &CallbackParams) -> Result<SessionSnapshot> {
        self.handle_auth_callback(&params.code, &params.state)
    }

    /// Validate the stored session and publish the resulting user
    ///
    /// The session ends up Anonymous, with tokens cleared, whenever the
    /// stored token cannot be used; the cause is returned as the error. A
    /// missing token or an expired one without refresh token is not an error.
    pub fn check_session(&self) -> Result<SessionSnapshot> {
        self.run(SessionPhase::Checking, || self.validate())?;
        Ok(self.snapshot())
    }

    /// Refresh the tokens now and revalidate
    pub fn refresh_session(&self) -> Result<SessionSnapshot> {
        self.run(SessionPhase::Refreshing, || {
            let refresh_token = self
                .tokens
                .get_stored_tokens()?
                .refresh_token
                .ok_or(AuthError::NoRefreshToken)?;

            if let Err(e) = self.refresh_tokens(&refresh_token) {
                self.invalidate();
                return Err(e);
            }
            self.validate()
        })?;

        Ok(self.snapshot())
    }

    /// Sign out; cannot fail
    ///
    /// Revocation is best effort, local state is cleared regardless.
    pub fn logout(&self) -> SessionSnapshot {
        {
            let _operation = self.operation.lock();
            let _transition = self.begin(SessionPhase::LoggingOut);

            self.timer.cancel();
            match self.tokens.get_stored_tokens() {
                Ok(stored) => {
                    if let Some(access_token) = stored.access_token {
                        self.gateway.revoke_token(&access_token);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to read tokens for revocation"),
            }

            if let Err(e) = self.tokens.clear_stored_tokens() {
                tracing::warn!(error = %e, "Failed to clear stored tokens");
            }
            self.set_user(None);
            tracing::info!("Signed out");
        }

        self.snapshot()
    }

    /// Stop background work
    pub fn shutdown(&self) {
        self.timer.cancel();
    }

    fn run<T>(&self, phase: SessionPhase, operation: impl FnOnce() -> Result<T>) -> Result<T> {
        let _operation = self.operation.lock();
        let _transition = self.begin(phase);
        operation()
    }

    fn prepare_login(&self) -> Result<AuthFlowResult> {
        let pkce = Pkce::generate(self.random.as_ref())?;
        let state = pkce::generate_state(self.random.as_ref())?;
        let url = self.authorization_url(&state, pkce.code_challenge())?;

        self.tokens.set_flow_state(&state, pkce.code_verifier())?;
        tracing::info!("Starting Kick sign-in");

        Ok(AuthFlowResult { url, state })
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String> {
        let config = self.gateway.config();
        let url = Url::parse_with_params(
            &config.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", config.client_id.as_str()),
                ("redirect_uri", config.redirect_uri.as_str()),
                ("scope", config.scope.as_str()),
                ("code_challenge", code_challenge),
                ("code_challenge_method", Pkce::code_challenge_method()),
                ("state", state),
            ],
        )?;
        Ok(url.to_string())
    }

    fn consume_flow_state(&self, state: &str) -> Result<String> {
        let flow = self.tokens.get_flow_state();
        self.discard_flow_state();
        let flow = flow?;

        if flow.is_empty() {
            tracing::warn!("Callback received without a pending sign-in");
            return Err(AuthError::MissingVerifier);
        }
        if flow.state.as_deref() != Some(state) {
            tracing::warn!("Callback state does not match the pending sign-in");
            return Err(AuthError::StateMismatch);
        }
        flow.code_verifier.ok_or(AuthError::MissingVerifier)
    }

    fn discard_flow_state(&self) {
        if let Err(e) = self.tokens.clear_flow_state() {
            tracing::warn!(error = %e, "Failed to clear pending sign-in state");
        }
    }

    /// Session check body; the operation lock is held by the caller
    fn validate(&self) -> Result<()> {
        let stored = self.tokens.get_stored_tokens()?;

        let Some(mut access_token) = stored.access_token.clone() else {
            self.timer.cancel();
            self.set_user(None);
            return Ok(());
        };

        if stored.is_expired(self.tokens.now_millis()) {
            let Some(refresh_token) = stored.refresh_token.as_deref() else {
                tracing::info!("Access token expired and no refresh token is stored");
                self.invalidate();
                return Ok(());
            };

            if let Err(e) = self.refresh_tokens(refresh_token) {
                self.invalidate();
                return Err(e);
            }
            match self.tokens.get_stored_tokens()?.access_token {
                Some(token) => access_token = token,
                None => {
                    self.invalidate();
                    return Ok(());
                }
            }
        }

        let profile = self.gateway.get_user_data(&access_token).and_then(|payload| {
            payload
                .into_profile()
                .ok_or_else(|| AuthError::InvalidResponse("users endpoint returned no profile".into()))
        });
        let profile = match profile {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(error = %e, "Profile fetch failed, ending session");
                self.invalidate();
                return Err(e);
            }
        };

        let user = match users::reconcile(self.directory.as_ref(), &profile) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(error = %e, kick_id = profile.user_id, "User reconciliation failed");
                self.invalidate();
                return Err(e);
            }
        };

        self.set_user(Some(user));
        self.schedule_refresh();
        Ok(())
    }

    /// Redeem the refresh token, coordinating with other processes if configured
    fn refresh_tokens(&self, refresh_token: &str) -> Result<()> {
        let _lock = match &self.refresh_lock {
            Some(manager) => {
                let lock = manager.acquire(REFRESH_LOCK_KEY)?;
                // Another holder may have rotated or cleared the tokens while we waited.
                let current = self.tokens.get_stored_tokens()?;
                if current.refresh_token.as_deref() != Some(refresh_token) {
                    tracing::debug!("Tokens changed while waiting for refresh lock, skipping");
                    return Ok(());
                }
                Some(lock)
            }
            None => None,
        };

        self.gateway.refresh_token(refresh_token)?;
        tracing::info!("Access token refreshed");
        Ok(())
    }

    fn schedule_refresh(&self) {
        let expiry = match self.tokens.get_stored_tokens() {
            Ok(stored) => stored.token_expiry,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read token expiry");
                None
            }
        };
        let Some(expiry) = expiry else {
            self.timer.cancel();
            return;
        };

        let delay = refresh_delay(
            expiry,
            self.tokens.now_millis(),
            self.gateway.config().refresh_lead(),
        );
        let manager = self.this.clone();
        self.timer.arm(delay, move || {
            if let Some(manager) = manager.upgrade() {
                manager.passive_refresh();
            }
        });
        tracing::debug!(delay_secs = delay.as_secs(), "Passive token refresh armed");
    }

    fn passive_refresh(&self) {
        let result = self.run(SessionPhase::Refreshing, || {
            match self.tokens.get_stored_tokens()?.refresh_token {
                Some(refresh_token) => {
                    if let Err(e) = self.refresh_tokens(&refresh_token) {
                        tracing::warn!(error = %e, "Passive token refresh failed");
                    }
                }
                None => tracing::debug!("No refresh token stored, revalidating only"),
            }
            self.validate()
        });

        if let Err(e) = result {
            tracing::warn!(error = %e, "Session check after passive refresh failed");
        }
    }

    fn invalidate(&self) {
        self.timer.cancel();
        if let Err(e) = self.tokens.clear_stored_tokens() {
            tracing::warn!(error = %e, "Failed to clear stored tokens");
        }
        self.set_user(None);
    }

    fn set_user(&self, user: Option<LocalUser>) {
        self.state.write().user = user;
    }

    fn begin(&self, phase: SessionPhase) -> Transition<'_> {
        let snapshot = {
            let mut state = self.state.write();
            state.phase = phase;
            state.clone()
        };
        self.notify(&snapshot);
        Transition { manager: self }
    }

    fn settle(&self) {
        let snapshot = {
            let mut state = self.state.write();
            state.phase = if state.user.is_some() {
                SessionPhase::Authenticated
            } else {
                SessionPhase::Anonymous
            };
            state.clone()
        };
        self.notify(&snapshot);
    }

    fn notify(&self, snapshot: &SessionSnapshot) {
        let listeners: Vec<SessionListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkce::generate_code_challenge;
    use crate::storage::MemoryStore;
    use crate::testing::{FakeHttp, ManualClock, RecordingNavigator};
    use crate::token_store::ALL_KEYS;
    use crate::users::{MemoryUserDirectory, NewLocalUser};
    use std::thread;
    use std::time::Duration;

    const TOKEN_URL: &str = "https://id.kick.com/oauth/token";
    const USERS_URL: &str = "https://api.kick.com/public/v1/users";
    const REVOKE_URL: &str = "https://id.kick.com/oauth/revoke";
    const PROFILE: &str = r#"{"data":[{"user_id":42,"email":"alice@example.com","name":"alice","profile_picture":null}]}"#;
    const NOW: u64 = 1_700_000_000_000;

    struct Harness {
        manager: Arc<SessionManager>,
        http: Arc<FakeHttp>,
        store: MemoryStore,
        clock: Arc<ManualClock>,
    }

    fn harness_with(config: KickConfig, directory: Arc<dyn UserDirectory>) -> Harness {
        let http = Arc::new(FakeHttp::new());
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(NOW));

        let manager = SessionManager::new(
            config,
            Collaborators {
                store: Arc::new(store.clone()),
                http: http.clone(),
                directory,
                random: Arc::new(OsRandom),
                clock: clock.clone(),
                refresh_lock: None,
            },
        );

        Harness {
            manager,
            http,
            store,
            clock,
        }
    }

    fn config() -> KickConfig {
        KickConfig::kick("client", "secret", "http://localhost:5173/callback")
    }

    fn harness() -> Harness {
        harness_with(config(), Arc::new(MemoryUserDirectory::new()))
    }

    fn assert_all_keys_absent(store: &MemoryStore) {
        for key in ALL_KEYS {
            assert!(store.get(key).unwrap().is_none(), "{} still stored", key);
        }
    }

    fn signed_in() -> Harness {
        let h = harness();
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T","refresh_token":"R","expires_in":3600}"#);
        h.http.respond(USERS_URL, 200, PROFILE);

        let flow = h.manager.begin_login().unwrap();
        h.manager.handle_auth_callback("code-1", &flow.state).unwrap();
        h
    }

    struct FailingDirectory;

    impl UserDirectory for FailingDirectory {
        fn find_by_kick_id(&self, _kick_id: u64) -> Result<Option<LocalUser>> {
            Err(AuthError::StorageError("datastore unreachable".into()))
        }

        fn insert(&self, _user: NewLocalUser) -> Result<LocalUser> {
            Err(AuthError::StorageError("datastore unreachable".into()))
        }
    }

    #[test]
    fn test_new_manager_is_loading() {
        let h = harness();
        assert_eq!(h.manager.phase(), SessionPhase::Uninitialized);
        assert!(h.manager.is_loading());
        assert!(!h.manager.is_authenticated());
    }

    #[test]
    fn test_check_session_without_token_makes_no_network_call() {
        let h = harness();
        let snapshot = h.manager.check_session().unwrap();

        assert!(!snapshot.is_authenticated());
        assert!(!snapshot.is_loading());
        assert_eq!(snapshot.phase, SessionPhase::Anonymous);
        assert_eq!(h.http.request_count(), 0);
    }

    #[test]
    fn test_expired_token_without_refresh_token_is_cleared() {
        let h = harness();
        h.manager
            .token_store()
            .set_stored_tokens("stale", None, 60)
            .unwrap();
        h.clock.advance_millis(61_000);

        let snapshot = h.manager.check_session().unwrap();

        assert!(!snapshot.is_authenticated());
        assert_all_keys_absent(&h.store);
        assert_eq!(h.http.request_count(), 0);
    }

    #[test]
    fn test_expired_token_is_refreshed_before_profile_fetch() {
        let h = harness();
        h.manager
            .token_store()
            .set_stored_tokens("stale", Some("R"), 60)
            .unwrap();
        h.clock.advance_millis(61_000);
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"fresh","expires_in":3600}"#);
        h.http.respond(USERS_URL, 200, PROFILE);

        let snapshot = h.manager.check_session().unwrap();

        assert!(snapshot.is_authenticated());
        let requests = h.http.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].form_field("refresh_token"), Some("R"));
        assert_eq!(requests[1].header_value("Authorization"), Some("Bearer fresh"));
    }

    #[test]
    fn test_failed_refresh_clears_session() {
        let h = harness();
        h.manager
            .token_store()
            .set_stored_tokens("stale", Some("R"), 60)
            .unwrap();
        h.clock.advance_millis(61_000);
        h.http.respond(TOKEN_URL, 400, r#"{"error":"invalid_grant"}"#);

        assert!(matches!(
            h.manager.check_session(),
            Err(AuthError::TokenRefresh { status: 400, .. })
        ));
        assert!(!h.manager.is_authenticated());
        assert!(!h.manager.is_loading());
        assert_all_keys_absent(&h.store);
    }

    #[test]
    fn test_profile_failure_invalidates_session() {
        let h = harness();
        h.manager
            .token_store()
            .set_stored_tokens("revoked", Some("R"), 3600)
            .unwrap();
        h.http.respond(USERS_URL, 401, "Unauthorized");

        assert!(matches!(
            h.manager.check_session(),
            Err(AuthError::ProfileFetch { status: 401, .. })
        ));
        assert!(!h.manager.is_authenticated());
        assert!(!h.manager.is_loading());
        assert_all_keys_absent(&h.store);
        // No retry
        assert_eq!(h.http.requests_to(USERS_URL), 1);
    }

    #[test]
    fn test_empty_profile_list_invalidates_session() {
        let h = harness();
        h.manager
            .token_store()
            .set_stored_tokens("T", None, 3600)
            .unwrap();
        h.http.respond(USERS_URL, 200, r#"{"data":[]}"#);

        assert!(matches!(
            h.manager.check_session(),
            Err(AuthError::InvalidResponse(_))
        ));
        assert_all_keys_absent(&h.store);
    }

    #[test]
    fn test_login_url_carries_pkce_parameters() {
        let h = harness();
        let navigator = RecordingNavigator::new();

        let flow = h.manager.login(&navigator).unwrap();
        assert_eq!(navigator.visited(), vec![flow.url.clone()]);

        let url = Url::parse(&flow.url).unwrap();
        assert!(flow.url.starts_with("https://id.kick.com/oauth/authorize?"));
        assert!(flow.url.contains("code_challenge_method=S256"));

        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let stored = h.manager.token_store().get_flow_state().unwrap();
        assert_eq!(param("state"), stored.state);
        assert_eq!(param("response_type").as_deref(), Some("code"));
        assert_eq!(param("client_id").as_deref(), Some("client"));
        assert_eq!(
            param("redirect_uri").as_deref(),
            Some("http://localhost:5173/callback")
        );
        assert_eq!(param("scope").as_deref(), Some("user:read"));
        assert_eq!(
            param("code_challenge"),
            stored.code_verifier.as_deref().map(generate_code_challenge)
        );

        assert!(!h.manager.is_loading());
        assert_eq!(h.http.request_count(), 0);
    }

    #[test]
    fn test_second_login_abandons_first() {
        let h = harness();
        let first = h.manager.begin_login().unwrap();
        let second = h.manager.begin_login().unwrap();
        assert_ne!(first.state, second.state);

        let stored = h.manager.token_store().get_flow_state().unwrap();
        assert_eq!(stored.state, Some(second.state));

        assert!(matches!(
            h.manager.handle_auth_callback("code", &first.state),
            Err(AuthError::StateMismatch)
        ));
    }

    #[test]
    fn test_state_mismatch_makes_no_network_call() {
        let h = harness();
        h.manager.begin_login().unwrap();

        assert!(matches!(
            h.manager.handle_auth_callback("code", "forged-state"),
            Err(AuthError::StateMismatch)
        ));
        assert_eq!(h.http.request_count(), 0);
        assert!(h.manager.token_store().get_flow_state().unwrap().is_empty());
        assert!(!h.manager.is_loading());
    }

    #[test]
    fn test_callback_without_verifier() {
        let h = harness();
        h.store.set("kick_state", "s").unwrap();

        assert!(matches!(
            h.manager.handle_auth_callback("code", "s"),
            Err(AuthError::MissingVerifier)
        ));
        assert_eq!(h.http.request_count(), 0);
    }

    #[test]
    fn test_callback_signs_in() {
        let h = harness();
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T","expires_in":3600}"#);
        h.http.respond(USERS_URL, 200, PROFILE);

        let flow = h.manager.begin_login().unwrap();
        let snapshot = h.manager.handle_auth_callback("code-1", &flow.state).unwrap();

        assert_eq!(h.store.get("kick_access_token").unwrap(), Some("T".to_string()));
        assert!(snapshot.is_authenticated());
        assert!(!snapshot.is_loading());
        let user = snapshot.user.unwrap();
        assert_eq!(user.kick_id, 42);
        assert_eq!(user.username, "alice");
        assert_eq!(user.email, "alice@example.com");

        assert!(h.manager.token_store().get_flow_state().unwrap().is_empty());
        assert!(h.manager.refresh_deadline().is_some());
    }

    #[test]
    fn test_callback_exchange_failure_leaves_clean_state() {
        let h = harness();
        h.http.respond(TOKEN_URL, 400, r#"{"error":"invalid_grant"}"#);

        let flow = h.manager.begin_login().unwrap();
        assert!(matches!(
            h.manager.handle_auth_callback("code", &flow.state),
            Err(AuthError::TokenExchange { status: 400, .. })
        ));

        assert!(!h.manager.is_authenticated());
        assert!(!h.manager.is_loading());
        assert_all_keys_absent(&h.store);
    }

    #[test]
    fn test_replayed_code_fails_without_corrupting_session() {
        let h = signed_in();
        let flow_state = "any-state";

        assert!(matches!(
            h.manager.handle_auth_callback("code-1", flow_state),
            Err(AuthError::MissingVerifier)
        ));

        assert!(h.manager.is_authenticated());
        assert_eq!(h.store.get("kick_access_token").unwrap(), Some("T".to_string()));
        assert_eq!(h.http.requests_to(TOKEN_URL), 1);
    }

    #[test]
    fn test_reconciliation_failure_surfaces_and_clears() {
        let h = harness_with(config(), Arc::new(FailingDirectory));
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T","expires_in":3600}"#);
        h.http.respond(USERS_URL, 200, PROFILE);

        let flow = h.manager.begin_login().unwrap();
        assert!(matches!(
            h.manager.handle_auth_callback("code", &flow.state),
            Err(AuthError::Reconciliation(_))
        ));
        assert!(!h.manager.is_authenticated());
        assert_all_keys_absent(&h.store);
    }

    #[test]
    fn test_repeated_sign_in_reuses_local_user() {
        let directory = Arc::new(MemoryUserDirectory::new());
        let h = harness_with(config(), directory.clone());
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T","expires_in":3600}"#);
        h.http.respond(USERS_URL, 200, PROFILE);

        let flow = h.manager.begin_login().unwrap();
        let first = h.manager.handle_auth_callback("c1", &flow.state).unwrap();
        let flow = h.manager.begin_login().unwrap();
        let second = h.manager.handle_auth_callback("c2", &flow.state).unwrap();

        assert_eq!(directory.len(), 1);
        assert_eq!(first.user.unwrap().id, second.user.unwrap().id);
    }

    #[test]
    fn test_logout_with_failing_revoke_clears_everything() {
        let h = signed_in();
        h.http.time_out(REVOKE_URL);
        h.manager.begin_login().unwrap();

        let snapshot = h.manager.logout();

        assert!(!snapshot.is_authenticated());
        assert!(!snapshot.is_loading());
        assert_all_keys_absent(&h.store);
        assert!(h.manager.refresh_deadline().is_none());

        let revoke = h.http.last_request().unwrap();
        assert_eq!(revoke.url, REVOKE_URL);
        assert_eq!(revoke.form_field("token"), Some("T"));
    }

    #[test]
    fn test_logout_without_session_skips_revoke() {
        let h = harness();
        let snapshot = h.manager.logout();
        assert_eq!(snapshot.phase, SessionPhase::Anonymous);
        assert_eq!(h.http.request_count(), 0);
    }

    #[test]
    fn test_manual_refresh_without_refresh_token() {
        let h = harness();
        assert!(matches!(
            h.manager.refresh_session(),
            Err(AuthError::NoRefreshToken)
        ));
        assert!(!h.manager.is_loading());
    }

    #[test]
    fn test_manual_refresh_rotates_tokens() {
        let h = signed_in();
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T2","refresh_token":"R2","expires_in":3600}"#);

        let snapshot = h.manager.refresh_session().unwrap();

        assert!(snapshot.is_authenticated());
        let stored = h.manager.token_store().get_stored_tokens().unwrap();
        assert_eq!(stored.access_token.as_deref(), Some("T2"));
        assert_eq!(stored.refresh_token.as_deref(), Some("R2"));
    }

    #[test]
    fn test_refresh_skipped_when_tokens_rotated_elsewhere() {
        let dir = std::env::temp_dir().join(format!("kick_session_lock_{}", rand::random::<u32>()));
        let http = Arc::new(FakeHttp::new());
        let store = MemoryStore::new();
        let manager = SessionManager::new(
            config(),
            Collaborators {
                store: Arc::new(store.clone()),
                http: http.clone(),
                directory: Arc::new(MemoryUserDirectory::new()),
                random: Arc::new(OsRandom),
                clock: Arc::new(ManualClock::new(NOW)),
                refresh_lock: Some(RefreshLockManager::new(dir.clone()).unwrap()),
            },
        );
        manager
            .token_store()
            .set_stored_tokens("T-other", Some("R-other"), 3600)
            .unwrap();

        manager.refresh_tokens("R-mine").unwrap();
        assert_eq!(http.request_count(), 0);

        http.respond(TOKEN_URL, 200, r#"{"access_token":"T3","expires_in":3600}"#);
        manager.refresh_tokens("R-other").unwrap();
        assert_eq!(http.requests_to(TOKEN_URL), 1);
        assert_eq!(store.get("kick_access_token").unwrap(), Some("T3".to_string()));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_listeners_observe_loading_then_settled() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = h.manager.subscribe(move |snapshot| sink.lock().push(snapshot.phase));

        h.manager.check_session().unwrap();
        assert_eq!(
            *seen.lock(),
            vec![SessionPhase::Checking, SessionPhase::Anonymous]
        );

        assert!(h.manager.unsubscribe(id));
        assert!(!h.manager.unsubscribe(id));
        h.manager.check_session().unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_passive_refresh_fires_before_expiry() {
        // A lead longer than the token lifetime clamps the timer to its minimum delay
        let mut config = config();
        config.refresh_lead_secs = 7200;
        let h = harness_with(config, Arc::new(MemoryUserDirectory::new()));
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T","refresh_token":"R","expires_in":3600}"#);
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T2","refresh_token":"R2","expires_in":3600}"#);
        h.http.respond(USERS_URL, 200, PROFILE);

        let flow = h.manager.begin_login().unwrap();
        h.manager.handle_auth_callback("code", &flow.state).unwrap();
        assert!(h.manager.refresh_deadline().is_some());

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.store.get("kick_access_token").unwrap().as_deref() != Some("T2") {
            assert!(Instant::now() < deadline, "passive refresh did not run");
            thread::sleep(Duration::from_millis(50));
        }

        // Wait for the revalidation that follows the refresh
        while h.http.requests_to(USERS_URL) < 2 || h.manager.is_loading() {
            assert!(Instant::now() < deadline, "revalidation did not run");
            thread::sleep(Duration::from_millis(50));
        }
        assert!(h.manager.is_authenticated());
        let last_profile_fetch = h
            .http
            .requests()
            .into_iter()
            .rev()
            .find(|r| r.url == USERS_URL)
            .unwrap();
        assert_eq!(
            last_profile_fetch.header_value("Authorization"),
            Some("Bearer T2")
        );
        h.manager.shutdown();
    }

    #[test]
    fn test_passive_refresh_failure_keeps_session() {
        let mut config = config();
        config.refresh_lead_secs = 7200;
        let h = harness_with(config, Arc::new(MemoryUserDirectory::new()));
        h.http
            .respond(TOKEN_URL, 200, r#"{"access_token":"T","refresh_token":"R","expires_in":3600}"#);
        h.http.respond(TOKEN_URL, 503, "unavailable");
        h.http.respond(USERS_URL, 200, PROFILE);

        let flow = h.manager.begin_login().unwrap();
        h.manager.handle_auth_callback("code", &flow.state).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.http.requests_to(USERS_URL) < 2 || h.manager.is_loading() {
            assert!(Instant::now() < deadline, "passive refresh did not run");
            thread::sleep(Duration::from_millis(50));
        }

        assert!(h.manager.is_authenticated());
        assert_eq!(h.store.get("kick_access_token").unwrap(), Some("T".to_string()));
        h.manager.shutdown();
    }
}
