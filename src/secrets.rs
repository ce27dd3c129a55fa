/// PastelID passphrase storage.
///
/// Passphrases authorize ticket signing and downloads. They are fetched
/// per call and never written to the task table or the logs.
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Passphrase for a PastelID.
    async fn passphrase(&self, pastel_id: &str) -> Result<String>;

    /// Store a passphrase for a PastelID.
    async fn put_passphrase(&self, pastel_id: &str, passphrase: &str) -> Result<()>;
}

/// Environment-seeded in-memory store.
///
/// The gateway's own PastelID passphrase comes from
/// `GATEWAY_PASTEL_ID_PASSPHRASE`; per-client PastelIDs are registered
/// at key creation time.
pub struct EnvSecretStore {
    entries: RwLock<HashMap<String, String>>,
}

impl EnvSecretStore {
    pub fn new(gateway_pastel_id: &str) -> Result<Self> {
        let passphrase = std::env::var("GATEWAY_PASTEL_ID_PASSPHRASE")
            .map_err(|_| GatewayError::Secret("GATEWAY_PASTEL_ID_PASSPHRASE not set".into()))?;
        let mut entries = HashMap::new();
        entries.insert(gateway_pastel_id.to_string(), passphrase);
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    #[cfg(test)]
    pub fn with_entries(entries: HashMap<String, String>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn passphrase(&self, pastel_id: &str) -> Result<String> {
        self.entries
            .read()
            .await
            .get(pastel_id)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Secret(format!("no passphrase for PastelID {pastel_id}"))
            })
    }

    async fn put_passphrase(&self, pastel_id: &str, passphrase: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(pastel_id.to_string(), passphrase.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_passphrase_is_not_retryable() {
        let store = EnvSecretStore::with_entries(HashMap::new());
        let err = store.passphrase("jXunknown").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = EnvSecretStore::with_entries(HashMap::new());
        store.put_passphrase("jXabc", "hunter2").await.unwrap();
        assert_eq!(store.passphrase("jXabc").await.unwrap(), "hunter2");
    }
}
