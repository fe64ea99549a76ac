/// Persistence of Kick tokens and in-flight sign-in state
use crate::error::Result;
use crate::storage::DurableStore;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_KEY: &str = "kick_access_token";
pub const REFRESH_TOKEN_KEY: &str = "kick_refresh_token";
pub const TOKEN_EXPIRY_KEY: &str = "kick_token_expiry";
pub const STATE_KEY: &str = "kick_state";
pub const CODE_VERIFIER_KEY: &str = "kick_code_verifier";

/// Every key the token store may write
pub const ALL_KEYS: [&str; 5] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    TOKEN_EXPIRY_KEY,
    STATE_KEY,
    CODE_VERIFIER_KEY,
];

/// Wall clock in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Tokens as read back from storage; any part may be missing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Absolute expiry instant in milliseconds since the Unix epoch
    pub token_expiry: Option<u64>,
}

impl StoredTokens {
    /// Check if the access token is past its expiry
    ///
    /// A token without a known expiry is not considered expired.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.token_expiry
            .map(|expiry| now_millis >= expiry)
            .unwrap_or(false)
    }
}

/// The pending sign-in's correlation state and PKCE secret
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowState {
    pub state: Option<String>,
    pub code_verifier: Option<String>,
}

impl FlowState {
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.code_verifier.is_none()
    }
}

/// Token store over a durable key-value store
///
/// A plain persistence layer: token shapes are not validated.
pub struct TokenStore {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current time according to the store's clock
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn get_stored_tokens(&self) -> Result<StoredTokens> {
        let token_expiry = match self.store.get(TOKEN_EXPIRY_KEY)? {
            Some(raw) => match raw.parse::<u64>() {
                Ok(expiry) => Some(expiry),
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring unparsable token expiry");
                    None
                }
            },
            None => None,
        };

        Ok(StoredTokens {
            access_token: self.store.get(ACCESS_TOKEN_KEY)?,
            refresh_token: self.store.get(REFRESH_TOKEN_KEY)?,
            token_expiry,
        })
    }

    /// Store a token set, replacing the previous one
    ///
    /// The expiry is written as `now + expires_in_secs * 1000`. A `None`
    /// refresh token removes any stored one.
    pub fn set_stored_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_secs: u64,
    ) -> Result<()> {
        let expiry = self
            .clock
            .now_millis()
            .saturating_add(expires_in_secs.saturating_mul(1000))
            .to_string();

        self.store.apply(&[
            (ACCESS_TOKEN_KEY, Some(access_token)),
            (REFRESH_TOKEN_KEY, refresh_token),
            (TOKEN_EXPIRY_KEY, Some(expiry.as_str())),
        ])
    }

    /// Remove tokens and any pending sign-in state
    pub fn clear_stored_tokens(&self) -> Result<()> {
        let changes: Vec<(&str, Option<&str>)> = ALL_KEYS.iter().map(|key| (*key, None)).collect();
        self.store.apply(&changes)
    }

    /// Record a new pending sign-in, abandoning any previous one
    pub fn set_flow_state(&self, state: &str, code_verifier: &str) -> Result<()> {
        self.store.apply(&[
            (STATE_KEY, Some(state)),
            (CODE_VERIFIER_KEY, Some(code_verifier)),
        ])
    }

    pub fn get_flow_state(&self) -> Result<FlowState> {
        Ok(FlowState {
            state: self.store.get(STATE_KEY)?,
            code_verifier: self.store.get(CODE_VERIFIER_KEY)?,
        })
    }

    pub fn clear_flow_state(&self) -> Result<()> {
        self.store
            .apply(&[(STATE_KEY, None), (CODE_VERIFIER_KEY, None)])
    }
}
