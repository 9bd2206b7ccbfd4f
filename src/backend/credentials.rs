// =============================================================================
// Credential Store — process-local key/value cache for tokens and preferences
// =============================================================================
//
// Values are opaque JSON. The bearer token lives under `AUTH_TOKEN_KEY`; user
// preferences share the same store under their own keys.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SyncResult;

pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Source of the bearer token attached to backend requests.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;

    fn set_token(&self, token: String);

    fn clear(&self);

    /// The backend rejected the current token.
    fn invalidate(&self) {
        self.clear();
    }
}

/// Thread-safe JSON key/value store.
#[derive(Debug, Default)]
pub struct LocalStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed read. A value that does not decode as `T` is treated as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.entries.read().get(key).cloned()?;
        match serde_json::from_value(raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "stored value has unexpected shape");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        let raw = serde_json::to_value(value)?;
        self.entries.write().insert(key.to_string(), raw);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

type InvalidationHook = Box<dyn Fn() + Send + Sync>;

/// [`CredentialProvider`] backed by a [`LocalStore`], with invalidation hooks.
pub struct StoredCredentials {
    store: Arc<LocalStore>,
    hooks: RwLock<Vec<InvalidationHook>>,
}

impl StoredCredentials {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Register a callback run after the token is invalidated.
    pub fn on_invalidate(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().push(Box::new(hook));
    }
}

impl CredentialProvider for StoredCredentials {
    fn token(&self) -> Option<String> {
        self.store
            .get::<String>(AUTH_TOKEN_KEY)
            .filter(|t| !t.is_empty())
    }

    fn set_token(&self, token: String) {
        if let Err(e) = self.store.set(AUTH_TOKEN_KEY, &token) {
            warn!(error = %e, "failed to store auth token");
            return;
        }
        debug!("auth token stored");
    }

    fn clear(&self) {
        if self.store.remove(AUTH_TOKEN_KEY) {
            info!("auth token cleared");
        }
    }

    fn invalidate(&self) {
        self.clear();
        warn!("auth token invalidated by backend");
        for hook in self.hooks.read().iter() {
            hook();
        }
    }
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("token", &self.token().map(|_| "<redacted>"))
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}
