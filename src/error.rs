/// Error types for Kick sign-in and session operations
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("State parameter does not match the pending sign-in")]
    StateMismatch,

    #[error("No code verifier stored for this sign-in")]
    MissingVerifier,

    #[error("Authorization failed: {error}, description: {description:?}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("Failed to exchange code for token: {status} {body}")]
    TokenExchange { status: u16, body: String },

    #[error("Failed to refresh token: {status} {body}")]
    TokenRefresh { status: u16, body: String },

    #[error("Failed to fetch user profile: {status} {body}")]
    ProfileFetch { status: u16, body: String },

    #[error("User reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Request to {url} timed out")]
    NetworkTimeout { url: String },

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Session context is not available")]
    ContextUnavailable,

    #[error("Secure random source unavailable: {0}")]
    RandomUnavailable(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AuthError {
    /// Whether the error came from the remote side rejecting or dropping a call
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            AuthError::HttpError(_)
                | AuthError::TokenExchange { .. }
                | AuthError::TokenRefresh { .. }
                | AuthError::ProfileFetch { .. }
                | AuthError::NetworkTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
