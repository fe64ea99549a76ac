//! Kick Session - OAuth 2.0 sign-in with PKCE and token lifecycle for Kick
//!
//! This library signs a user in with their Kick account, keeps the tokens
//! fresh, and maps the Kick identity onto a local user record.
//!
//! # Features
//!
//! - OAuth 2.0 authorization code flow with PKCE (RFC 7636) against id.kick.com
//! - Pluggable durable storage (memory, file, OS keyring)
//! - Session validation with profile fetch and find-or-create of the local user
//! - Passive token refresh ahead of expiry, optionally serialized across processes
//! - Loopback callback server for native hosts
//!
//! # Example
//!
//! ```
//! use kick_session::prelude::*;
//! use std::sync::Arc;
//!
//! let config = KickConfig::kick("your-client-id", "your-client-secret", "http://localhost:5173/callback");
//! let collaborators = Collaborators::new(
//!     &config,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryUserDirectory::new()),
//! )
//! .unwrap();
//!
//! let manager = SessionManager::new(config, collaborators);
//! let flow = manager.begin_login().unwrap();
//! println!("Authorization URL: {}", flow.url);
//! ```

pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod http;
pub mod lock;
pub mod pkce;
pub mod session;
pub mod storage;
pub mod timer;
pub mod token_store;
pub mod users;

#[cfg(test)]
mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::callback::{strip_callback_params, CallbackParams, CallbackServer};
    pub use crate::config::{DatastoreConfig, KickConfig};
    pub use crate::context::{Location, MemoryLocation, SessionContext, SessionHandle};
    pub use crate::error::{AuthError, Result};
    pub use crate::lock::RefreshLockManager;
    pub use crate::pkce::Pkce;
    pub use crate::session::{
        AuthFlowResult, BrowserNavigator, Collaborators, Navigator, SessionManager, SessionPhase,
        SessionSnapshot,
    };
    pub use crate::storage::{DurableStore, FileStore, KeyringStore, MemoryStore};
    pub use crate::users::{LocalUser, MemoryUserDirectory, RestUserDirectory, UserDirectory};
}
