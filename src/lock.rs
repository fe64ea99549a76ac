/// Cross-process lock serializing token refreshes on a shared store
use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// File locks for processes sharing one durable store
///
/// Two processes reading the same [`FileStore`](crate::storage::FileStore)
/// would otherwise both redeem the same refresh token; the provider honours
/// only the first.
#[derive(Debug, Clone)]
pub struct RefreshLockManager {
    lock_dir: PathBuf,
}

impl RefreshLockManager {
    pub fn new(lock_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    /// Lock directory for an application
    ///
    /// Uses $XDG_RUNTIME_DIR when set, the temp directory otherwise.
    pub fn for_app(app_name: &str) -> Result<Self> {
        let base = std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        Self::new(base.join("kick-session-locks").join(app_name))
    }

    /// Block until the lock for `key` is held
    ///
    /// Released when the returned guard is dropped.
    pub fn acquire(&self, key: &str) -> Result<RefreshLock> {
        let (file, path) = self.open(key)?;
        file.lock_exclusive()?;
        Ok(RefreshLock { file, path })
    }

    /// Take the lock for `key` if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Result<Option<RefreshLock>> {
        let (file, path) = self.open(key)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RefreshLock { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open(&self, key: &str) -> Result<(File, PathBuf)> {
        let safe_key: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self.lock_dir.join(format!("{}.lock", safe_key));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }
}

/// RAII guard for a refresh lock
pub struct RefreshLock {
    file: File,
    path: PathBuf,
}

impl RefreshLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        // The lock file stays: removing it would let a waiter lock an unlinked inode.
        let _ = FileExt::unlock(&self.file);
    }
}
