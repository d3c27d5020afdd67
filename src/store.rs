//! # Secure Key-Value Store
//!
//! The relay address, fallback address and shared secret are owned by an
//! external secure-storage collaborator (OS keychain, encrypted settings file).
//! The engine consumes it only through [`SecureStore`].
//!
//! [`MemoryStore`] is an in-process implementation for tests and for
//! applications that inject settings directly.

use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Key holding the primary relay address string
pub const RELAY_ADDRESS_KEY: &str = "relay.address";

/// Key holding the fallback relay address string
pub const FALLBACK_ADDRESS_KEY: &str = "relay.fallback_address";

/// Key holding the shared secret (password)
pub const SHARED_SECRET_KEY: &str = "relay.shared_secret";

/// Asynchronous secure key-value lookups.
pub trait SecureStore: Send + Sync + 'static {
    /// Value for `key`, or `None` when nothing is stored.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }

    pub async fn remove(&self, key: &str) -> Option<String> {
        self.values.write().await.remove(key)
    }
}

impl SecureStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        async move { Ok(self.values.read().await.get(key).cloned()) }.boxed()
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.values
                .write()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
        .boxed()
    }
}
