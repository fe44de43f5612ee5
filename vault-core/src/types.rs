//! Shared value types for tenant storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, VaultError};

/// Maximum length of a tenant id in bytes (it becomes a directory name)
const MAX_TENANT_ID_LEN: usize = 128;

/// Validated tenant identity.
///
/// A tenant id names a directory under the data root, so it is restricted to
/// ASCII alphanumerics plus `-`, `_` and `.`, may not start with `.`, and may
/// not be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(VaultError::InvalidTenantId("empty".to_string()));
        }
        if id.len() > MAX_TENANT_ID_LEN {
            return Err(VaultError::InvalidTenantId(format!(
                "longer than {} bytes",
                MAX_TENANT_ID_LEN
            )));
        }
        if id.starts_with('.') {
            return Err(VaultError::InvalidTenantId(format!("'{}' starts with '.'", id)));
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(VaultError::InvalidTenantId(format!(
                "'{}' contains forbidden character {:?}",
                id, c
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Check that a storage key can be persisted.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(VaultError::InvalidKey("empty".to_string()));
    }
    if key.contains('\0') {
        return Err(VaultError::InvalidKey("contains NUL".to_string()));
    }
    Ok(())
}

/// Confirmation of a durable write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

/// A decrypted record as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub tenant_id: TenantId,
    pub key: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOutcome {
    pub deleted_count: usize,
}

/// Per-key size and modification time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStat {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Aggregate storage usage of one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub tenant_id: TenantId,
    pub total_keys: usize,
    pub total_size: u64,
    pub entries: Vec<KeyStat>,
}
