/// Remote calls against the Kick identity provider
use crate::config::KickConfig;
use crate::error::{AuthError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::token_store::TokenStore;
use serde::Deserialize;
use std::sync::Arc;

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// The provider's view of the signed-in account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityProfile {
    pub user_id: u64,
    #[serde(default)]
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

/// Raw payload of the users endpoint
///
/// The public API wraps profiles as `{"data": [...]}`; bare lists and bare
/// objects are accepted as well.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProfilePayload {
    Wrapped { data: Vec<IdentityProfile> },
    List(Vec<IdentityProfile>),
    Single(IdentityProfile),
}

impl ProfilePayload {
    /// The profile of the token's owner
    pub fn into_profile(self) -> Option<IdentityProfile> {
        match self {
            ProfilePayload::Wrapped { data } | ProfilePayload::List(data) => {
                data.into_iter().next()
            }
            ProfilePayload::Single(profile) => Some(profile),
        }
    }
}

/// Identity gateway
///
/// Token-producing calls write through the [`TokenStore`]; the store is the
/// source of truth, so they return nothing.
pub struct IdentityGateway {
    config: KickConfig,
    http: Arc<dyn HttpClient>,
    tokens: Arc<TokenStore>,
}

impl IdentityGateway {
    pub fn new(config: KickConfig, http: Arc<dyn HttpClient>, tokens: Arc<TokenStore>) -> Self {
        Self {
            config,
            http,
            tokens,
        }
    }

    pub fn config(&self) -> &KickConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens
    pub fn exchange_code_for_token(&self, code: &str, code_verifier: &str) -> Result<()> {
        let request = HttpRequest::post(&self.config.token_endpoint)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("code_verifier", code_verifier),
                ("code", code),
            ]);

        let response = self.http.send(request)?;
        if !response.is_success() {
            tracing::warn!(status = response.status, "Token exchange rejected");
            return Err(AuthError::TokenExchange {
                status: response.status,
                body: response.body,
            });
        }

        self.store_token_response(&response, None)
    }

    /// Obtain a new token set with a refresh token
    ///
    /// When the provider does not rotate the refresh token, the one used
    /// stays stored.
    pub fn refresh_token(&self, refresh_token: &str) -> Result<()> {
        let request = HttpRequest::post(&self.config.token_endpoint)
            .header("Accept", "application/json")
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ]);

        let response = self.http.send(request)?;
        if !response.is_success() {
            tracing::warn!(status = response.status, "Token refresh rejected");
            return Err(AuthError::TokenRefresh {
                status: response.status,
                body: response.body,
            });
        }

        self.store_token_response(&response, Some(refresh_token))
    }

    /// Revoke an access token, best effort
    ///
    /// Never fails: local token removal is what ends the session.
    pub fn revoke_token(&self, access_token: &str) {
        let request = HttpRequest::post(&self.config.revocation_endpoint).form(&[
            ("token", access_token),
            ("token_hint_type", "access_token"),
        ]);

        match self.http.send(request) {
            Ok(response) if response.is_success() => {
                tracing::debug!("Access token revoked");
            }
            Ok(response) => {
                tracing::warn!(status = response.status, "Token revocation rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token revocation failed");
            }
        }
    }

    /// Fetch the profile of the token's owner
    pub fn get_user_data(&self, access_token: &str) -> Result<ProfilePayload> {
        let request = HttpRequest::get(self.config.users_endpoint())
            .bearer(access_token)
            .header("Accept", "application/json");

        let response = self.http.send(request)?;
        if !response.is_success() {
            return Err(AuthError::ProfileFetch {
                status: response.status,
                body: response.body,
            });
        }

        response.json()
    }

    fn store_token_response(
        &self,
        response: &HttpResponse,
        previous_refresh_token: Option<&str>,
    ) -> Result<()> {
        let token: TokenResponse = response.json()?;

        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::MissingField("access_token".into()))?;
        let expires_in = token
            .expires_in
            .ok_or_else(|| AuthError::MissingField("expires_in".into()))?;
        let refresh_token = token.refresh_token.as_deref().or(previous_refresh_token);

        self.tokens
            .set_stored_tokens(&access_token, refresh_token, expires_in)
    }
}
