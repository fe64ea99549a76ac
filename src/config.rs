//! Configuration for the Kick identity provider and the user datastore
//!
//! Loads configuration from:
//! 1. Built-in Kick endpoint defaults
//! 2. Environment variables (`KICK_*`, `DATASTORE_*`)

use crate::error::Result;
use serde::Deserialize;
use std::time::Duration;

pub const KICK_AUTHORIZATION_ENDPOINT: &str = "https://id.kick.com/oauth/authorize";
pub const KICK_TOKEN_ENDPOINT: &str = "https://id.kick.com/oauth/token";
pub const KICK_REVOCATION_ENDPOINT: &str = "https://id.kick.com/oauth/revoke";
pub const KICK_API_BASE_URL: &str = "https://api.kick.com/public/v1";
pub const KICK_DEFAULT_SCOPE: &str = "user:read";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REFRESH_LEAD_SECS: u64 = 300;

/// Kick OAuth client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KickConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    /// Base of the public API, e.g. "https://api.kick.com/public/v1"
    pub api_base_url: String,
    pub scope: String,
    /// Timeout applied to every remote call
    pub request_timeout_secs: u64,
    /// How long before expiry the passive refresh fires
    pub refresh_lead_secs: u64,
}

impl KickConfig {
    /// Kick preset with the provider's fixed endpoints
    ///
    /// # Example
    ///
    /// ```
    /// use kick_session::config::KickConfig;
    ///
    /// let config = KickConfig::kick("client", "secret", "http://localhost:5173/callback");
    /// assert_eq!(config.scope, "user:read");
    /// ```
    pub fn kick(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            authorization_endpoint: KICK_AUTHORIZATION_ENDPOINT.to_string(),
            token_endpoint: KICK_TOKEN_ENDPOINT.to_string(),
            revocation_endpoint: KICK_REVOCATION_ENDPOINT.to_string(),
            api_base_url: KICK_API_BASE_URL.to_string(),
            scope: KICK_DEFAULT_SCOPE.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_lead_secs: DEFAULT_REFRESH_LEAD_SECS,
        }
    }

    /// Load from `KICK_*` environment variables
    ///
    /// `KICK_CLIENT_ID`, `KICK_CLIENT_SECRET` and `KICK_REDIRECT_URI` are
    /// required; endpoints, scope and timings fall back to the Kick defaults.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("authorization_endpoint", KICK_AUTHORIZATION_ENDPOINT)?
            .set_default("token_endpoint", KICK_TOKEN_ENDPOINT)?
            .set_default("revocation_endpoint", KICK_REVOCATION_ENDPOINT)?
            .set_default("api_base_url", KICK_API_BASE_URL)?
            .set_default("scope", KICK_DEFAULT_SCOPE)?
            .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
            .set_default("refresh_lead_secs", DEFAULT_REFRESH_LEAD_SECS)?
            .add_source(config::Environment::with_prefix("KICK").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Profile endpoint of the public API
    pub fn users_endpoint(&self) -> String {
        format!("{}/users", self.api_base_url.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_lead(&self) -> Duration {
        Duration::from_secs(self.refresh_lead_secs)
    }
}

/// Hosted datastore (PostgREST dialect) connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatastoreConfig {
    /// Project URL, e.g. "https://abc.supabase.co"
    pub url: String,
    /// Anonymous or service API key
    pub api_key: String,
}

impl DatastoreConfig {
    /// Load from `DATASTORE_URL` and `DATASTORE_API_KEY`
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("DATASTORE"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
