/// Durable key-value storage backends for session state
use crate::error::{AuthError, Result};
use keyring::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// String key-value store that survives application restarts
///
/// The native counterpart of browser local storage: every value is a string,
/// and a missing key reads as `None`.
pub trait DurableStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Apply several changes as one write where the backend allows it
    ///
    /// `None` removes the key.
    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        for (key, value) in changes {
            match value {
                Some(value) => self.set(key, value)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

/// In-memory storage implementation
///
/// Thread-safe, lost on restart. Suitable for testing and embedding.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        let mut values = self.values.write();
        for (key, value) in changes {
            match value {
                Some(value) => {
                    values.insert(key.to_string(), value.to_string());
                }
                None => {
                    values.remove(*key);
                }
            }
        }
        Ok(())
    }
}

/// File-based storage using XDG conventions
///
/// All keys live in one JSON document, rewritten on each change so that a
/// batch from [`DurableStore::apply`] lands in a single write.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStore {
    const FILE_NAME: &'static str = "session.json";

    /// Create a file store for an application
    ///
    /// Respects XDG Base Directory Specification on Unix systems:
    /// - Checks $XDG_DATA_HOME environment variable first
    /// - Falls back to the platform data directory
    ///
    /// Stores data in <data_dir>/<app_name>/session.json
    ///
    /// # Example
    ///
    /// ```
    /// use kick_session::storage::FileStore;
    ///
    /// let store = FileStore::new("kick-curator").unwrap();
    /// ```
    pub fn new(app_name: &str) -> Result<Self> {
        let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data)
        } else {
            dirs::data_dir().ok_or_else(|| {
                AuthError::StorageError("Could not determine data directory".to_string())
            })?
        };

        Self::with_dir(base_dir.join(app_name))
    }

    /// Create a file store rooted at a custom directory
    pub fn with_dir(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            AuthError::StorageError(format!("Failed to create storage directory: {}", e))
        })?;

        Ok(Self {
            path: dir.join(Self::FILE_NAME),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Path of the backing JSON document
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| AuthError::StorageError(format!("Failed to read store: {}", e)))?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        serde_json::from_str(&content)
            .map_err(|e| AuthError::StorageError(format!("Failed to parse store: {}", e)))
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| AuthError::StorageError(format!("Failed to serialize store: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| AuthError::StorageError(format!("Failed to write store: {}", e)))
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.apply(&[(key, Some(value))])
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.apply(&[(key, None)])
    }

    fn apply(&self, changes: &[(&str, Option<&str>)]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut values = self.load()?;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    values.insert(key.to_string(), value.to_string());
                }
                None => {
                    values.remove(*key);
                }
            }
        }
        self.save(&values)
    }
}

/// Storage in the OS credential manager
///
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service API (libsecret)
///
/// Each key is a separate credential under the `kick-session-<app>` service.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Create a keyring store for an application
    pub fn new(app_name: &str) -> Self {
        Self {
            service: format!("kick-session-{}", app_name),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key)
            .map_err(|e| AuthError::StorageError(format!("Failed to create keyring entry: {}", e)))
    }
}

impl DurableStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AuthError::StorageError(format!(
                "Failed to read from keyring: {}",
                e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| AuthError::StorageError(format!("Failed to write to keyring: {}", e)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::StorageError(format!(
                "Failed to delete from keyring: {}",
                e
            ))),
        }
    }
}
