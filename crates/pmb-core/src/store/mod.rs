//! Durable key-value persistence.
//!
//! Components never talk to a concrete backend: they hold one or more
//! [`DurableStore`]s, usually composed into a priority-ordered [`StoreChain`]
//! (database first, filesystem last).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{errors::Error, Result};

mod file;
mod memory;
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Priority-ordered list of stores.
///
/// Reads return the first value that decodes; a store that errors or holds
/// undecodable data is skipped with a warning. Writes go to every store and
/// succeed if at least one store accepted them.
#[derive(Clone)]
pub struct StoreChain {
    stores: Vec<Arc<dyn DurableStore>>,
}

impl StoreChain {
    pub fn new(stores: Vec<Arc<dyn DurableStore>>) -> Self {
        Self { stores }
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name().to_string()).collect()
    }

    /// Load and decode `key`. Errors only when every store failed outright.
    pub async fn load_with<T>(
        &self,
        key: &str,
        decode: impl Fn(&str) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut failures = 0usize;

        for (idx, store) in self.stores.iter().enumerate() {
            let raw = match store.get(key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(store = store.name(), key, error = %e, "store read failed, trying next store");
                    failures += 1;
                    continue;
                }
            };

            match decode(&raw) {
                Ok(value) => {
                    if idx > 0 {
                        info!(store = store.name(), key, "loaded from fallback store");
                    }
                    return Ok(Some(value));
                }
                Err(e) => {
                    warn!(store = store.name(), key, error = %e, "stored value is malformed, trying next store");
                }
            }
        }

        if failures > 0 && failures == self.stores.len() {
            return Err(Error::store(
                self.names().join("+"),
                format!("every store failed to read {key}"),
            ));
        }
        Ok(None)
    }

    /// Write to every store. Returns how many stores accepted the value.
    pub async fn put_all(&self, key: &str, value: &str) -> Result<usize> {
        let mut written = 0usize;
        for store in &self.stores {
            match store.put(key, value).await {
                Ok(()) => written += 1,
                Err(e) => warn!(store = store.name(), key, error = %e, "store write failed"),
            }
        }

        if written == 0 && !self.stores.is_empty() {
            return Err(Error::store(
                self.names().join("+"),
                format!("no store accepted {key}"),
            ));
        }
        Ok(written)
    }

    pub async fn delete_all(&self, key: &str) -> Result<()> {
        let mut last_err = None;
        for store in &self.stores {
            if let Err(e) = store.delete(key).await {
                warn!(store = store.name(), key, error = %e, "store delete failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
