//! Namespaced record store
//!
//! One JSON file per (tenant, key):
//!
//! ```text
//! <root>/<tenant_id>/<percent-encoded key>.json
//! <root>/<tenant_id>/+<sha256 of key>.json      keys too long for a file name
//! <root>/.rotation/                             re-encrypted records awaiting commit
//! ```
//!
//! Every file carries its owning tenant id and its key. Reads and deletes
//! compare both with the request and refuse a mismatch.
//!
//! Master password rotation re-encrypts in three steps so a crash never
//! strands records under a key that no longer exists:
//!
//! 1. [`RecordStore::stage_rotation`] writes every sealed record, re-sealed
//!    under the new key, into `.rotation/` along with the new password hash.
//! 2. The caller commits the new key configuration.
//! 3. [`RecordStore::commit_rotation`] renames the staged files into place.
//!
//! On startup [`RecordStore::recover_rotation`] finishes step 3 if the
//! committed hash matches the staged one, and discards the stage otherwise.
//! Writers are held off for the whole sequence by [`RecordStore::lock_exclusive`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::cipher::{CipherCodec, Envelope};
use crate::error::{Result, VaultError};
use crate::keys::{KeyMaterial, MasterKey};
use crate::persist::write_atomic;
use crate::types::{
    validate_key, ClearOutcome, DeleteOutcome, KeyStat, Receipt, Record, StorageStats, TenantId,
};

const RECORD_EXT: &str = ".json";

/// Longest percent-encoded key used verbatim as a file name stem
const MAX_ENCODED_STEM: usize = 160;

/// Marks file names derived from a key digest. Percent-encoding always
/// escapes it, so verbatim names never start with it.
const DIGEST_PREFIX: char = '+';

const ROTATION_DIR: &str = ".rotation";
const ROTATION_MANIFEST: &str = "manifest.json";

/// On-disk record
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    key: String,
    data: Envelope,
    timestamp: DateTime<Utc>,
    tenant_id: String,
}

/// Ownership header, readable without touching the payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordHeader {
    key: String,
    tenant_id: String,
}

/// Identifies the key configuration a staged rotation belongs to
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RotationManifest {
    password_hash: String,
}

/// Outcome of [`RecordStore::stage_rotation`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationStage {
    /// Records re-sealed under the new key
    pub staged: usize,
    /// Sealed records that could not be read under the old key
    pub skipped: usize,
}

pub struct RecordStore {
    root: PathBuf,
    codec: CipherCodec,
    initialized: AtomicBool,
    /// Shared by reads and writes, held exclusively while re-encrypting
    gate: RwLock<()>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>, codec: CipherCodec) -> Self {
        Self {
            root: root.into(),
            codec,
            initialized: AtomicBool::new(false),
            gate: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &CipherCodec {
        &self.codec
    }

    /// Create the data directory. Safe to call more than once.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("Record store initialized at {}", self.root.display());
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VaultError::NotInitialized)
        }
    }

    fn tenant_dir(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str())
    }

    fn record_path(&self, tenant: &TenantId, key: &str) -> PathBuf {
        self.tenant_dir(tenant).join(file_name_for(key))
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(ROTATION_DIR)
    }

    /// Hold off every read, write and delete until the guard is dropped
    pub async fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Encrypt and persist `value` under (`tenant`, `key`), replacing any
    /// previous record.
    pub async fn write(&self, tenant: &TenantId, key: &str, value: &serde_json::Value) -> Result<Receipt> {
        self.ensure_initialized()?;
        validate_key(key)?;
        let _gate = self.gate.read().await;

        let timestamp = Utc::now();
        let data = self.codec.encrypt(value)?;
        let encrypted = data.is_encrypted();
        self.persist(tenant, key, data, timestamp).await?;

        debug!("Stored {}/{} (encrypted={})", tenant, key, encrypted);
        Ok(Receipt { key: key.to_string(), timestamp })
    }

    async fn persist(&self, tenant: &TenantId, key: &str, data: Envelope, timestamp: DateTime<Utc>) -> Result<()> {
        tokio::fs::create_dir_all(self.tenant_dir(tenant)).await?;
        let record = StoredRecord {
            key: key.to_string(),
            data,
            timestamp,
            tenant_id: tenant.to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.record_path(tenant, key), &bytes).await
    }

    async fn load(&self, tenant: &TenantId, key: &str) -> Result<Option<StoredRecord>> {
        let bytes = match tokio::fs::read(self.record_path(tenant, key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let stored: StoredRecord = serde_json::from_slice(&bytes)?;
        check_owner(tenant, &stored.tenant_id)?;
        if stored.key != key {
            // Case-insensitive file systems fold distinct keys onto one file
            warn!("Record file for {}/{} holds key {:?}; treating as absent", tenant, key, stored.key);
            return Ok(None);
        }
        Ok(Some(stored))
    }

    /// Read and decrypt one record. A missing record is `Ok(None)`.
    pub async fn read(&self, tenant: &TenantId, key: &str) -> Result<Option<Record>> {
        self.ensure_initialized()?;
        validate_key(key)?;
        let _gate = self.gate.read().await;

        let Some(stored) = self.load(tenant, key).await? else {
            return Ok(None);
        };
        let value = self.codec.decrypt(&stored.data)?;
        Ok(Some(Record {
            tenant_id: tenant.clone(),
            key: stored.key,
            value,
            timestamp: stored.timestamp,
        }))
    }

    /// Keys stored for `tenant`, sorted
    pub async fn list_keys(&self, tenant: &TenantId) -> Result<Vec<String>> {
        self.ensure_initialized()?;

        let mut entries = match tokio::fs::read_dir(self.tenant_dir(tenant)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Dotfiles are in-flight temp files
            if name.starts_with('.') {
                continue;
            }
            let Some(stem) = name.strip_suffix(RECORD_EXT) else {
                continue;
            };
            if stem.starts_with(DIGEST_PREFIX) {
                match read_header(&entry.path()).await {
                    Ok(header) => keys.push(header.key),
                    Err(e) => warn!("Skipping unreadable record file {}/{}: {}", tenant, name, e),
                }
                continue;
            }
            match urlencoding::decode(stem) {
                Ok(key) => keys.push(key.into_owned()),
                Err(e) => warn!("Skipping undecodable record file {}/{}: {}", tenant, name, e),
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// All readable records of `tenant` by key. Records that fail to load or
    /// decrypt are logged and left out.
    pub async fn read_all(&self, tenant: &TenantId) -> Result<BTreeMap<String, Record>> {
        let mut all = BTreeMap::new();
        for key in self.list_keys(tenant).await? {
            match self.read(tenant, &key).await {
                Ok(Some(record)) => {
                    all.insert(key, record);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping {}/{}: {}", tenant, key, e),
            }
        }
        Ok(all)
    }

    /// Remove one record. Ownership is checked from the header, so encrypted
    /// records can be deleted while locked.
    pub async fn delete(&self, tenant: &TenantId, key: &str) -> Result<DeleteOutcome> {
        self.ensure_initialized()?;
        validate_key(key)?;
        let _gate = self.gate.read().await;

        let path = self.record_path(tenant, key);
        let header = match read_header(&path).await {
            Ok(header) => header,
            Err(VaultError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeleteOutcome { deleted: false })
            }
            Err(e) => return Err(e),
        };
        check_owner(tenant, &header.tenant_id)?;
        if header.key != key {
            debug!("delete({}/{}) found key {:?}; nothing removed", tenant, key, header.key);
            return Ok(DeleteOutcome { deleted: false });
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}/{}", tenant, key);
                Ok(DeleteOutcome { deleted: true })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome { deleted: false }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every record of `tenant`, counting only successful deletions
    pub async fn clear(&self, tenant: &TenantId) -> Result<ClearOutcome> {
        let mut deleted_count = 0;
        for key in self.list_keys(tenant).await? {
            match self.delete(tenant, &key).await {
                Ok(DeleteOutcome { deleted: true }) => deleted_count += 1,
                Ok(DeleteOutcome { deleted: false }) => {}
                Err(e) => warn!("Failed to delete {}/{} during clear: {}", tenant, key, e),
            }
        }
        info!("Cleared {} record(s) for tenant {}", deleted_count, tenant);
        Ok(ClearOutcome { deleted_count })
    }

    /// Whether a readable record exists. Never fails.
    pub async fn exists(&self, tenant: &TenantId, key: &str) -> bool {
        match self.read(tenant, key).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!("exists({}/{}) treated as absent: {}", tenant, key, e);
                false
            }
        }
    }

    /// Per-key sizes and modification times. Keys whose metadata cannot be
    /// read are excluded from every total.
    pub async fn stats(&self, tenant: &TenantId) -> Result<StorageStats> {
        let mut entries = Vec::new();
        for key in self.list_keys(tenant).await? {
            match tokio::fs::metadata(self.record_path(tenant, &key)).await {
                Ok(meta) => {
                    let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
                    entries.push(KeyStat { key, size: meta.len(), modified });
                }
                Err(e) => warn!("Excluding {}/{} from stats: {}", tenant, key, e),
            }
        }

        Ok(StorageStats {
            tenant_id: tenant.clone(),
            total_keys: entries.len(),
            total_size: entries.iter().map(|e| e.size).sum(),
            entries,
        })
    }

    /// Tenants that have a namespace on disk, sorted
    pub async fn list_tenants(&self) -> Result<Vec<TenantId>> {
        self.ensure_initialized()?;

        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut tenants = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Ok(tenant) = TenantId::new(name) {
                tenants.push(tenant);
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    /// Re-seal every record sealed under `old_key` with `new`'s key into the
    /// staging area. Nothing under a tenant directory changes. Call with
    /// [`RecordStore::lock_exclusive`] held.
    pub async fn stage_rotation(&self, old_key: &MasterKey, new: &KeyMaterial) -> Result<RotationStage> {
        self.ensure_initialized()?;
        self.discard_rotation().await?;

        let staging = self.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;

        let mut stage = RotationStage::default();
        for tenant in self.list_tenants().await? {
            for key in self.list_keys(&tenant).await? {
                let stored = match self.load(&tenant, &key).await {
                    Ok(Some(stored)) => stored,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Skipping {}/{} during re-encryption: {}", tenant, key, e);
                        stage.skipped += 1;
                        continue;
                    }
                };
                if !stored.data.is_encrypted() {
                    continue;
                }
                let value = match self.codec.decrypt_with(old_key, &stored.data) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Leaving {}/{} under its old key: {}", tenant, key, e);
                        stage.skipped += 1;
                        continue;
                    }
                };

                let record = StoredRecord {
                    data: self.codec.seal_with(new.key(), &value)?,
                    key: stored.key,
                    timestamp: stored.timestamp,
                    tenant_id: stored.tenant_id,
                };
                let dir = staging.join(tenant.as_str());
                tokio::fs::create_dir_all(&dir).await?;
                write_atomic(&dir.join(file_name_for(&key)), &serde_json::to_vec_pretty(&record)?).await?;
                stage.staged += 1;
            }
        }

        // Written last: a stage without a manifest is always discarded
        let manifest = RotationManifest { password_hash: new.verification_hash_hex() };
        write_atomic(&staging.join(ROTATION_MANIFEST), &serde_json::to_vec_pretty(&manifest)?).await?;

        debug!("Staged {} record(s) for re-encryption, skipped {}", stage.staged, stage.skipped);
        Ok(stage)
    }

    /// Move staged records over their originals and drop the staging area.
    /// Returns how many records were replaced. Safe to repeat after a crash.
    pub async fn commit_rotation(&self) -> Result<usize> {
        let staging = self.staging_dir();
        let mut tenants = match tokio::fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut moved = 0;
        while let Some(entry) = tenants.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(tenant) = entry.file_name().to_str().and_then(|name| TenantId::new(name).ok()) else {
                continue;
            };
            let target = self.tenant_dir(&tenant);
            tokio::fs::create_dir_all(&target).await?;

            let mut files = tokio::fs::read_dir(entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                tokio::fs::rename(file.path(), target.join(&name)).await?;
                moved += 1;
            }
        }

        tokio::fs::remove_dir_all(&staging).await?;
        info!("Re-encrypted {} record(s) under the new master key", moved);
        Ok(moved)
    }

    /// Drop any staged rotation. Returns whether there was one.
    pub async fn discard_rotation(&self) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.staging_dir()).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Settle a rotation interrupted by a crash. `committed_hash` is the hex
    /// verification hash currently on disk: if the stage was made for it the
    /// rotation is completed, otherwise the stage is thrown away.
    pub async fn recover_rotation(&self, committed_hash: Option<&str>) -> Result<()> {
        let manifest = match tokio::fs::read(self.staging_dir().join(ROTATION_MANIFEST)).await {
            Ok(bytes) => serde_json::from_slice::<RotationManifest>(&bytes).ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match manifest {
            Some(manifest) if committed_hash == Some(manifest.password_hash.as_str()) => {
                warn!("Completing interrupted master password rotation");
                self.commit_rotation().await?;
            }
            _ => {
                if self.discard_rotation().await? {
                    warn!("Discarded re-encryption stage of an uncommitted password rotation");
                }
            }
        }
        Ok(())
    }
}

async fn read_header(path: &Path) -> Result<RecordHeader> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn check_owner(requested: &TenantId, stored: &str) -> Result<()> {
    if stored == requested.as_str() {
        return Ok(());
    }
    error!(
        "Cross-tenant access: tenant '{}' resolved a record owned by '{}'",
        requested, stored
    );
    Err(VaultError::CrossTenantAccess {
        requested: requested.to_string(),
        stored: stored.to_string(),
    })
}

/// File name for `key`: the percent-encoded key, or a SHA-256 digest when the
/// encoding would be too long for a file name. A leading `.` is escaped as
/// well so no record file is mistaken for a temp file.
fn file_name_for(key: &str) -> String {
    let encoded = urlencoding::encode(key);
    let stem = match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded.into_owned(),
    };
    if stem.len() <= MAX_ENCODED_STEM {
        return format!("{}{}", stem, RECORD_EXT);
    }
    let digest = Sha256::digest(key.as_bytes());
    format!("{}{}{}", DIGEST_PREFIX, hex::encode(digest), RECORD_EXT)
}
