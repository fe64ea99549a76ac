/// Local user records and reconciliation of Kick identities against them
use crate::config::DatastoreConfig;
use crate::error::{AuthError, Result};
use crate::gateway::IdentityProfile;
use crate::http::{HttpClient, HttpRequest};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A user row in the application's `users` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: String,
    /// Kick `user_id` this row belongs to
    pub kick_id: u64,
    pub email: String,
    pub username: String,
    #[serde(rename = "is_stremear", default)]
    pub is_streamer: bool,
    #[serde(default)]
    pub is_moderator: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a first sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewLocalUser {
    pub kick_id: u64,
    pub email: String,
    pub username: String,
    #[serde(rename = "is_stremear")]
    pub is_streamer: bool,
    pub is_moderator: bool,
}

impl NewLocalUser {
    /// Row for a profile seen for the first time, with both role flags off
    pub fn from_profile(profile: &IdentityProfile) -> Self {
        Self {
            kick_id: profile.user_id,
            email: profile.email.clone(),
            username: profile.name.clone(),
            is_streamer: false,
            is_moderator: false,
        }
    }
}

/// The datastore's `users` table
pub trait UserDirectory: Send + Sync {
    fn find_by_kick_id(&self, kick_id: u64) -> Result<Option<LocalUser>>;

    fn insert(&self, user: NewLocalUser) -> Result<LocalUser>;
}

/// Find or create the local user for a profile
///
/// The returned view keeps the stored id, role flags and timestamps and takes
/// email and username from the fresh profile. A failed insert is followed by
/// one more lookup, so a concurrent first sign-in resolves to the row that won.
pub fn reconcile(directory: &dyn UserDirectory, profile: &IdentityProfile) -> Result<LocalUser> {
    let stored = match lookup(directory, profile.user_id)? {
        Some(user) => user,
        None => match directory.insert(NewLocalUser::from_profile(profile)) {
            Ok(user) => {
                tracing::info!(kick_id = profile.user_id, user_id = %user.id, "Created local user");
                user
            }
            Err(insert_error) => match lookup(directory, profile.user_id)? {
                Some(user) => user,
                None => return Err(AuthError::Reconciliation(insert_error.to_string())),
            },
        },
    };

    Ok(LocalUser {
        email: profile.email.clone(),
        username: profile.name.clone(),
        ..stored
    })
}

fn lookup(directory: &dyn UserDirectory, kick_id: u64) -> Result<Option<LocalUser>> {
    directory
        .find_by_kick_id(kick_id)
        .map_err(|e| AuthError::Reconciliation(e.to_string()))
}

/// In-memory user table
///
/// Enforces one row per Kick id the way the datastore's unique constraint does.
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<u64, LocalUser>>,
    next_id: AtomicU64,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// Update the role flags of an existing row
    pub fn set_roles(&self, kick_id: u64, is_streamer: bool, is_moderator: bool) -> Result<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(&kick_id)
            .ok_or_else(|| AuthError::StorageError(format!("No user for kick id {}", kick_id)))?;
        user.is_streamer = is_streamer;
        user.is_moderator = is_moderator;
        user.updated_at = Utc::now();
        Ok(())
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn find_by_kick_id(&self, kick_id: u64) -> Result<Option<LocalUser>> {
        Ok(self.users.read().get(&kick_id).cloned())
    }

    fn insert(&self, user: NewLocalUser) -> Result<LocalUser> {
        let mut users = self.users.write();
        if users.contains_key(&user.kick_id) {
            return Err(AuthError::StorageError(format!(
                "duplicate key value for kick_id {}",
                user.kick_id
            )));
        }

        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let row = LocalUser {
            id: id.to_string(),
            kick_id: user.kick_id,
            email: user.email,
            username: user.username,
            is_streamer: user.is_streamer,
            is_moderator: user.is_moderator,
            created_at: now,
            updated_at: now,
        };
        users.insert(row.kick_id, row.clone());
        Ok(row)
    }
}

/// `users` table behind the hosted datastore's REST interface (PostgREST)
pub struct RestUserDirectory {
    config: DatastoreConfig,
    http: Arc<dyn HttpClient>,
}

impl RestUserDirectory {
    pub fn new(config: DatastoreConfig, http: Arc<dyn HttpClient>) -> Self {
        Self { config, http }
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/users", self.config.url.trim_end_matches('/'))
    }

    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        request
            .header("apikey", self.config.api_key.as_str())
            .bearer(&self.config.api_key)
            .header("Accept", "application/json")
    }
}

impl UserDirectory for RestUserDirectory {
    fn find_by_kick_id(&self, kick_id: u64) -> Result<Option<LocalUser>> {
        let url = format!("{}?kick_id=eq.{}&select=*&limit=1", self.table_url(), kick_id);
        let response = self.http.send(self.authorized(HttpRequest::get(url)))?;
        if !response.is_success() {
            return Err(AuthError::StorageError(format!(
                "users lookup failed: {} {}",
                response.status, response.body
            )));
        }

        let rows: Vec<LocalUser> = response.json()?;
        Ok(rows.into_iter().next())
    }

    fn insert(&self, user: NewLocalUser) -> Result<LocalUser> {
        let request = self
            .authorized(HttpRequest::post(self.table_url()))
            .header("Prefer", "return=representation")
            .json(serde_json::to_value(&user)?);

        let response = self.http.send(request)?;
        if !response.is_success() {
            return Err(AuthError::StorageError(format!(
                "users insert failed: {} {}",
                response.status, response.body
            )));
        }

        let rows: Vec<LocalUser> = response.json()?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AuthError::InvalidResponse("insert returned no row".into()))
    }
}
