use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{domain::UserId, protocol::LoginResponse};
use tracing::{debug, warn};

use crate::{config::ClientSettings, error::ClientError};

pub const AUTH_TOKEN_KEY: &str = "chat.auth_token";
pub const USERNAME_KEY: &str = "chat.username";
pub const USER_ID_KEY: &str = "chat.user_id";
pub const OAUTH_STATE_KEY: &str = "chat.oauth_state";

/// String key-value persistence for client state.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), ClientError>;
    fn remove(&self, key: &str) -> Result<(), ClientError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Keeps every entry in one JSON object on disk, rewritten on each change.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens the store at `path`. A missing file starts empty; an unreadable
    /// one is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), %err, "store: discarding corrupt state file");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        debug!(path = %path.display(), entries = entries.len(), "store: opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `change` in memory only once the new state is on disk.
    fn update<F>(&self, change: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.clone();
        change(&mut next);
        let raw = serde_json::to_string_pretty(&next)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if let Err(err) = fs::write(&self.path, raw) {
            warn!(path = %self.path.display(), %err, "store: write failed, keeping previous state");
            return Err(err.into());
        }
        *entries = next;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Opens the configured file store, or an in-memory one when no path is set.
pub fn open_store(settings: &ClientSettings) -> Result<Arc<dyn KeyValueStore>, ClientError> {
    Ok(match &settings.store_path {
        Some(path) => Arc::new(FileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}

/// The signed-in identity as persisted in a [`KeyValueStore`].
#[derive(Clone)]
pub struct AuthSession {
    store: Arc<dyn KeyValueStore>,
}

impl AuthSession {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn token(&self) -> Option<String> {
        self.store.get(AUTH_TOKEN_KEY).filter(|token| !token.is_empty())
    }

    pub fn username(&self) -> Option<String> {
        self.store.get(USERNAME_KEY)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.store
            .get(USER_ID_KEY)
            .and_then(|raw| raw.trim().parse().ok())
            .map(UserId)
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some() && self.user_id().is_some()
    }

    pub fn save(&self, login: &LoginResponse) -> Result<(), ClientError> {
        self.store.set(AUTH_TOKEN_KEY, &login.access_token)?;
        self.store.set(USERNAME_KEY, &login.username)?;
        self.store.set(USER_ID_KEY, &login.user_id.to_string())?;
        debug!(user_id = login.user_id.0, "store: session saved");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), ClientError> {
        self.store.remove(AUTH_TOKEN_KEY)?;
        self.store.remove(USERNAME_KEY)?;
        self.store.remove(USER_ID_KEY)?;
        debug!("store: session cleared");
        Ok(())
    }

    pub fn oauth_state(&self) -> Option<String> {
        self.store.get(OAUTH_STATE_KEY)
    }

    pub fn set_oauth_state(&self, state: &str) -> Result<(), ClientError> {
        self.store.set(OAUTH_STATE_KEY, state)
    }

    pub fn take_oauth_state(&self) -> Result<Option<String>, ClientError> {
        let state = self.oauth_state();
        self.store.remove(OAUTH_STATE_KEY)?;
        Ok(state)
    }
}

#[cfg(test)]
#[path = "tests/session_store_tests.rs"]
mod tests;
