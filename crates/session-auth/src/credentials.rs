//! Credential storage for the signed-in session
//!
//! The app persists its session as a flat map of string keys to string values
//! that survives restarts. `CredentialStore` is the only way the rest of the
//! workspace touches that map, so the backend (JSON file, in-memory fake, OS
//! keychain) can be swapped without changing the client.
//!
//! `FileCredentialStore` writes through on every mutation using an atomic
//! temp-file + rename. A tokio Mutex serializes writes from request-time
//! refresh and session teardown.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by store operations (keeps the trait dyn-compatible).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Every key the session writes. Teardown clears all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AccessToken,
    RefreshToken,
    UserId,
    Email,
    Username,
    Membership,
    Name,
    FarmName,
    FarmLocation,
}

impl StorageKey {
    pub const ALL: [StorageKey; 9] = [
        StorageKey::AccessToken,
        StorageKey::RefreshToken,
        StorageKey::UserId,
        StorageKey::Email,
        StorageKey::Username,
        StorageKey::Membership,
        StorageKey::Name,
        StorageKey::FarmName,
        StorageKey::FarmLocation,
    ];

    /// Key name as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::AccessToken => "accessToken",
            StorageKey::RefreshToken => "refreshToken",
            StorageKey::UserId => "userId",
            StorageKey::Email => "email",
            StorageKey::Username => "username",
            StorageKey::Membership => "membership",
            StorageKey::Name => "name",
            StorageKey::FarmName => "farmName",
            StorageKey::FarmLocation => "farmLocation",
        }
    }
}

/// Persisted key-value store for the session.
///
/// Pure get/set/clear with no logic of its own. `replace` swaps every
/// session key in one step; `clear` is `replace` with nothing, so a
/// teardown never leaves half a session behind.
pub trait CredentialStore: Send + Sync {
    /// Read one key. Absent keys are `Ok(None)`.
    fn get(&self, key: StorageKey) -> StoreFuture<'_, Option<String>>;

    /// Write one key, leaving the others untouched.
    fn set(&self, key: StorageKey, value: String) -> StoreFuture<'_, ()>;

    /// Remove one key. Removing an absent key is not an error.
    fn remove(&self, key: StorageKey) -> StoreFuture<'_, ()>;

    /// Drop every session key, then write `entries`.
    fn replace(&self, entries: Vec<(StorageKey, String)>) -> StoreFuture<'_, ()>;

    /// Drop every session key.
    fn clear(&self) -> StoreFuture<'_, ()> {
        self.replace(Vec::new())
    }
}

/// In-memory store for tests and short-lived tools.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<HashMap<StorageKey, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with the given entries.
    pub fn with_entries<I, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (StorageKey, V)>,
        V: Into<String>,
    {
        let state = entries.into_iter().map(|(k, v)| (k, v.into())).collect();
        Self {
            state: Mutex::new(state),
        }
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: StorageKey) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(&key).cloned()) })
    }

    fn set(&self, key: StorageKey, value: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.insert(key, value);
            Ok(())
        })
    }

    fn remove(&self, key: StorageKey) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().await.remove(&key);
            Ok(())
        })
    }

    fn replace(&self, entries: Vec<(StorageKey, String)>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.clear();
            state.extend(entries);
            Ok(())
        })
    }
}

/// JSON file store, the durable backend.
///
/// Reads acquire the lock briefly to clone a value. Every mutation rewrites
/// the whole file atomically. Keys the session doesn't own are preserved.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileCredentialStore {
    /// Load the store from the given file path.
    ///
    /// If the file doesn't exist it is created as `{}` (signed-out cold start).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing session file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded session store");
            entries
        } else {
            info!(path = %path.display(), "session file not found, starting signed out");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, key: StorageKey) -> StoreFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key.as_str()).cloned()) })
    }

    fn set(&self, key: StorageKey, value: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.insert(key.as_str().to_string(), value);
            debug!(key = key.as_str(), "stored session key");
            write_atomic(&self.path, &state).await
        })
    }

    fn remove(&self, key: StorageKey) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key.as_str()).is_some() {
                debug!(key = key.as_str(), "removed session key");
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }

    fn replace(&self, entries: Vec<(StorageKey, String)>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            for key in StorageKey::ALL {
                state.remove(key.as_str());
            }
            for (key, value) in entries {
                state.insert(key.as_str().to_string(), value);
            }
            write_atomic(&self.path, &state).await
        })
    }
}

/// Per-process sequence for temp file names, so two stores on the same path
/// never share one.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write the session map to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Permissions are 0600 since the file holds bearer tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing session: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;

    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".session.tmp.{}.{seq}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}
