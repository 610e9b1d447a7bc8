//! Transport session credentials and their persistence.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    store::{DurableStore, StoreChain},
    Result,
};

pub const CREDENTIALS_KEY: &str = "session-credentials";

/// Opaque identity material needed to re-authenticate without re-pairing.
///
/// `creds` holds the identity document (registration id, signing keys, ...);
/// `keys` holds per-session key material keyed by `"<kind>:<id>"`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCredentials {
    #[serde(default)]
    pub creds: Map<String, Value>,
    #[serde(default)]
    pub keys: BTreeMap<String, Value>,
}

/// Partial credential change emitted by the transport.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CredentialUpdate {
    /// Top-level identity fields to overwrite.
    pub creds: Map<String, Value>,
    /// Key material to set. `Value::Null` removes the key.
    pub keys: BTreeMap<String, Value>,
}

impl SessionCredentials {
    pub fn registration_id(&self) -> Option<u64> {
        self.creds.get("registrationId").and_then(Value::as_u64)
    }

    /// True once pairing completed and the transport knows our account.
    pub fn is_registered(&self) -> bool {
        match self.creds.get("registered") {
            Some(Value::Bool(b)) => *b,
            _ => self.creds.get("me").is_some_and(|v| !v.is_null()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.creds.is_empty() && self.keys.is_empty()
    }

    pub fn apply(&mut self, update: &CredentialUpdate) {
        for (k, v) in &update.creds {
            self.creds.insert(k.clone(), v.clone());
        }
        for (k, v) in &update.keys {
            if v.is_null() {
                self.keys.remove(k);
            } else {
                self.keys.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Loads and saves [`SessionCredentials`] through a primary/fallback store chain.
#[derive(Clone)]
pub struct CredentialRepository {
    chain: StoreChain,
}

impl CredentialRepository {
    pub fn new(stores: Vec<Arc<dyn DurableStore>>) -> Self {
        Self {
            chain: StoreChain::new(stores),
        }
    }

    /// Returns empty credentials when nothing is stored yet. Errors only if
    /// every store is unusable.
    pub async fn load(&self) -> Result<SessionCredentials> {
        let loaded = self
            .chain
            .load_with(CREDENTIALS_KEY, |raw| {
                Ok(serde_json::from_str::<SessionCredentials>(raw)?)
            })
            .await?;

        match loaded {
            Some(c) => {
                debug!(
                    registered = c.is_registered(),
                    keys = c.keys.len(),
                    "loaded session credentials"
                );
                Ok(c)
            }
            None => {
                info!("no stored session credentials; a new pairing will be required");
                Ok(SessionCredentials::default())
            }
        }
    }

    pub async fn save(&self, creds: &SessionCredentials) -> Result<()> {
        let raw = serde_json::to_string(creds)?;
        self.chain.put_all(CREDENTIALS_KEY, &raw).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        info!("resetting stored session credentials");
        self.chain.delete_all(CREDENTIALS_KEY).await
    }
}
