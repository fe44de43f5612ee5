//! Tenant side of the bridge
//!
//! A [`TenantBridge`] is the only capability a tenant context holds. Every
//! call is an asynchronous round-trip to the host; the tenant never names its
//! own identity.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! // Store a value
//! bridge.set_item("user:123", json!({"name": "Alice"})).await?;
//!
//! // Retrieve it
//! if let Some(value) = bridge.get_item("user:123").await? {
//!     println!("Got: {}", value);
//! }
//!
//! // Typed helpers
//! bridge.set_json("settings", &settings).await?;
//! let settings: Option<Settings> = bridge.get_json("settings").await?;
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use vault_core::{
    ClearOutcome, DeleteOutcome, Receipt, Record, StorageStats, Tag, TagDraft, TenantId, VaultError,
};

use crate::protocol::{AppInfo, Command, Reply};

/// Bridge error
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The host ran the command and it failed
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("bridge host disconnected")]
    Disconnected,
    #[error("failed to convert value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Clone)]
pub struct TenantBridge {
    tx: mpsc::Sender<Command>,
}

impl TenantBridge {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| BridgeError::Disconnected)?;
        Ok(rx.await.map_err(|_| BridgeError::Disconnected)??)
    }

    /// Store a value by key
    ///
    /// # Arguments
    /// * `key` - The key to store the value under
    /// * `value` - Any JSON value
    ///
    /// # Returns
    /// * `Ok(Receipt)` - Value durably stored, with its write timestamp
    /// * `Err(BridgeError)` - Storage operation failed
    pub async fn set_item(&self, key: &str, value: serde_json::Value) -> Result<Receipt> {
        let key = key.to_string();
        self.call(|reply| Command::SetItem { key, value, reply }).await
    }

    /// Get a value by key
    ///
    /// # Returns
    /// * `Ok(Some(value))` - Value found
    /// * `Ok(None)` - Key doesn't exist
    /// * `Err(BridgeError)` - Read or decryption failed
    pub async fn get_item(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let key = key.to_string();
        self.call(|reply| Command::GetItem { key, reply }).await
    }

    /// All keys of this tenant, sorted
    pub async fn get_all_keys(&self) -> Result<Vec<String>> {
        self.call(|reply| Command::GetAllKeys { reply }).await
    }

    /// Every readable record of this tenant with its timestamp. Unreadable
    /// records are omitted.
    pub async fn get_all_data(&self) -> Result<BTreeMap<String, Record>> {
        self.call(|reply| Command::GetAllData { reply }).await
    }

    /// Delete a key
    ///
    /// # Returns
    /// * `Ok(DeleteOutcome { deleted: true })` - Key existed and was removed
    /// * `Ok(DeleteOutcome { deleted: false })` - Key didn't exist
    pub async fn remove_item(&self, key: &str) -> Result<DeleteOutcome> {
        let key = key.to_string();
        self.call(|reply| Command::RemoveItem { key, reply }).await
    }

    /// Delete every key of this tenant
    pub async fn clear(&self) -> Result<ClearOutcome> {
        self.call(|reply| Command::Clear { reply }).await
    }

    /// Check if a readable value exists for `key`
    pub async fn has_item(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.call(|reply| Command::HasItem { key, reply }).await
    }

    pub async fn get_storage_info(&self) -> Result<StorageStats> {
        self.call(|reply| Command::GetStorageInfo { reply }).await
    }

    /// Shared tag catalog, sorted by name
    pub async fn tags_get_all(&self) -> Result<Vec<Tag>> {
        self.call(|reply| Command::TagsGetAll { reply }).await
    }

    /// Create a tag attributed to this tenant
    pub async fn tags_create(&self, draft: TagDraft) -> Result<Tag> {
        self.call(|reply| Command::TagsCreate { draft, reply }).await
    }

    /// Identity the host bound this context to
    pub async fn tenant_id(&self) -> Result<TenantId> {
        self.call(|reply| Command::TenantId { reply }).await
    }

    pub async fn app_info(&self) -> Result<AppInfo> {
        self.call(|reply| Command::AppInfo { reply }).await
    }

    /// Store a serializable value as JSON
    ///
    /// # Example
    /// ```rust,ignore
    /// #[derive(Serialize)]
    /// struct Settings { theme: String }
    ///
    /// bridge.set_json("settings", &Settings { theme: "dark".into() }).await?;
    /// ```
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<Receipt> {
        self.set_item(key, serde_json::to_value(value)?).await
    }

    /// Get a JSON value and deserialize it
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_item(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
