//! Vault facade
//!
//! Wires the key manager, cipher codec, record store, tag catalog, tenant
//! registry and bridge host together over one data directory:
//!
//! ```text
//! <data_dir>/
//!   encryption-config.json
//!   tags.json
//!   miniapp-data/<tenant_id>/<key>.json
//! ```
//!
//! Password hashing runs on the blocking pool with no lock held. The key
//! manager is write-locked only to install the result.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tenant_bridge::{BridgeHost, ContextBinding, TenantBridge};
use tracing::{debug, info, warn};
use vault_core::keys::{read_keys, write_keys, DEFAULT_KDF_ITERATIONS};
use vault_core::{
    AeadAlgorithm, CipherCodec, EncryptionStatus, KdfParams, KeyManager, RecordStore, Result,
    SharedKeyManager, TagCatalog, Tenant, TenantId, TenantRegistry, VaultError,
};

pub const CONFIG_FILE: &str = "encryption-config.json";
pub const TAGS_FILE: &str = "tags.json";
pub const RECORDS_DIR: &str = "miniapp-data";

#[derive(Debug, Clone)]
pub struct VaultOptions {
    pub data_dir: PathBuf,
    /// Where built-in tenants keep their content
    pub content_root: PathBuf,
    pub algorithm: AeadAlgorithm,
    pub kdf_iterations: u32,
}

impl VaultOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            content_root: data_dir.join("miniapps"),
            data_dir,
            algorithm: AeadAlgorithm::default(),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

#[derive(Clone)]
pub struct Vault {
    keys: SharedKeyManager,
    store: Arc<RecordStore>,
    tags: Arc<TagCatalog>,
    registry: Arc<TenantRegistry>,
    bridges: BridgeHost,
}

impl Vault {
    pub async fn open(options: VaultOptions) -> Result<Self> {
        tokio::fs::create_dir_all(&options.data_dir).await?;

        let config_path = options.data_dir.join(CONFIG_FILE);
        let iterations = options.kdf_iterations;
        let keys = tokio::task::spawn_blocking(move || KeyManager::open(config_path, iterations)).await??;
        let keys: SharedKeyManager = Arc::new(RwLock::new(keys));

        let codec = CipherCodec::new(keys.clone(), options.algorithm);
        let store = Arc::new(RecordStore::new(options.data_dir.join(RECORDS_DIR), codec));
        store.initialize().await?;
        let committed_hash = read_keys(&keys).verification_hash_hex();
        store.recover_rotation(committed_hash.as_deref()).await?;

        let tags = Arc::new(TagCatalog::open(options.data_dir.join(TAGS_FILE)).await?);
        let registry = Arc::new(TenantRegistry::new(&options.content_root)?);
        let bridges = BridgeHost::new(store.clone(), tags.clone());

        info!(
            data_dir = %options.data_dir.display(),
            cipher = %options.algorithm,
            "Vault opened"
        );

        Ok(Self { keys, store, tags, registry, bridges })
    }

    /// Run `f` against the key manager on the blocking pool. Config writes
    /// happen there.
    async fn with_keys<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut KeyManager) -> Result<T> + Send + 'static,
    {
        let keys = self.keys.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = write_keys(&keys);
            f(&mut *guard)
        })
        .await?
    }

    /// Run `f` against a snapshot of the derivation parameters on the
    /// blocking pool, without holding the key manager lock.
    async fn derive<T, F>(&self, f: F) -> Result<(KdfParams, T)>
    where
        T: Send + 'static,
        F: FnOnce(&KdfParams) -> Result<T> + Send + 'static,
    {
        let params = read_keys(&self.keys).kdf_params();
        tokio::task::spawn_blocking(move || {
            let derived = f(&params)?;
            Ok((params, derived))
        })
        .await?
    }

    pub fn status(&self) -> EncryptionStatus {
        read_keys(&self.keys).status()
    }

    /// Derive the key for `password` and commit its verification hash.
    /// Refused once a password is set; use
    /// [`Vault::change_master_password`] instead.
    pub async fn set_master_password(&self, password: String) -> Result<()> {
        let (_, material) = self.derive(move |params| params.derive_initial(&password)).await?;
        self.with_keys(move |keys| {
            keys.adopt(material)?;
            keys.commit_password_hash()
        })
        .await
    }

    pub async fn verify_master_password(&self, password: String) -> Result<bool> {
        let (params, key) = self.derive(move |params| Ok(params.verify(&password))).await?;
        match key {
            Some(key) => self.with_keys(move |keys| Ok(keys.load_verified(&params, key))).await,
            None => {
                debug!("Master password verification failed");
                Ok(false)
            }
        }
    }

    pub async fn unlock(&self, password: String) -> Result<bool> {
        self.verify_master_password(password).await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.with_keys(move |keys| keys.set_enabled(enabled)).await
    }

    /// Rotate the master password and re-encrypt every sealed record under the
    /// new key, keeping record timestamps. Returns how many records were
    /// re-encrypted. Records that do not decrypt under the old key are left
    /// untouched.
    ///
    /// Record reads and writes wait while the rotation runs. Works whether or
    /// not the vault is unlocked.
    pub async fn change_master_password(&self, old_password: String, new_password: String) -> Result<usize> {
        let (params, (old_key, material)) = self
            .derive(move |params| {
                let old_key = params.verify(&old_password).ok_or(VaultError::Authentication)?;
                let material = params.derive_fresh(&new_password)?;
                Ok((old_key, material))
            })
            .await?;

        let _exclusive = self.store.lock_exclusive().await;

        let stage = match self.store.stage_rotation(&old_key, &material).await {
            Ok(stage) => stage,
            Err(e) => {
                self.abandon_rotation().await;
                return Err(e);
            }
        };
        if let Err(e) = self.with_keys(move |keys| keys.install_rotation(&params, material)).await {
            self.abandon_rotation().await;
            return Err(e);
        }

        // From here the new key is committed; an interrupted commit is
        // finished by the next `Vault::open`
        let rewritten = self.store.commit_rotation().await?;
        if stage.skipped > 0 {
            warn!("{} record(s) did not decrypt under the old key and were left as is", stage.skipped);
        }
        info!("Master password rotated; re-encrypted {} record(s)", rewritten);
        Ok(rewritten)
    }

    async fn abandon_rotation(&self) {
        if let Err(e) = self.store.discard_rotation().await {
            warn!("Failed to discard re-encryption stage: {}", e);
        }
    }

    pub async fn remove_master_password(&self) -> Result<()> {
        self.with_keys(|keys| keys.remove_master_password()).await
    }

    pub fn lock(&self) {
        write_keys(&self.keys).lock();
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn tags(&self) -> &TagCatalog {
        &self.tags
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Resolve tenant `id` and hand out a bridge bound to it
    pub async fn launch(&self, id: &TenantId) -> Result<(Tenant, TenantBridge)> {
        let tenant = self.registry.launch(id).await?;
        let bridge = self.bridges.attach(id.clone());
        info!("Launched tenant {}", id);
        Ok((tenant, bridge))
    }

    /// Open a context whose identity is established later
    pub fn open_context(&self) -> (ContextBinding, TenantBridge) {
        self.bridges.open_context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    async fn vault(dir: &TempDir) -> Vault {
        let mut options = VaultOptions::new(dir.path());
        options.kdf_iterations = 1_000;
        Vault::open(options).await.unwrap()
    }

    #[tokio::test]
    async fn test_launch_binds_bridge_to_tenant() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let notes = TenantId::new("notes").unwrap();

        let (tenant, bridge) = vault.launch(&notes).await.unwrap();
        assert!(matches!(tenant, Tenant::Missing { .. }));
        assert_eq!(bridge.tenant_id().await.unwrap(), notes);

        bridge.set_item("k", json!(1)).await.unwrap();
        assert_eq!(vault.store().read(&notes, "k").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_launch_unknown_tenant_fails() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let ghost = TenantId::new("ghost").unwrap();
        assert!(matches!(vault.launch(&ghost).await, Err(VaultError::TenantNotFound(_))));
    }

    #[tokio::test]
    async fn test_change_password_reencrypts_records() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let notes = TenantId::new("notes").unwrap();

        vault.set_master_password("abcdefgh".into()).await.unwrap();
        vault.set_enabled(true).await.unwrap();
        vault.store().write(&notes, "a", &json!("one")).await.unwrap();
        vault.store().write(&notes, "b", &json!({"two": 2})).await.unwrap();

        let count = vault
            .change_master_password("abcdefgh".into(), "new password".into())
            .await
            .unwrap();
        assert_eq!(count, 2);

        vault.lock();
        assert!(!vault.unlock("abcdefgh".into()).await.unwrap());
        assert!(vault.unlock("new password".into()).await.unwrap());
        assert_eq!(vault.store().read(&notes, "b").await.unwrap().unwrap().value, json!({"two": 2}));
    }

    #[tokio::test]
    async fn test_change_password_checks_before_touching_records() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        vault.set_master_password("abcdefgh".into()).await.unwrap();

        assert!(matches!(
            vault.change_master_password("wrongpass".into(), "new password".into()).await,
            Err(VaultError::Authentication)
        ));
        assert!(matches!(
            vault.change_master_password("abcdefgh".into(), "short".into()).await,
            Err(VaultError::WeakPassword { .. })
        ));
        assert!(vault.verify_master_password("abcdefgh".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let vault = vault(&dir).await;
            vault.set_master_password("abcdefgh".into()).await.unwrap();
            vault.set_enabled(true).await.unwrap();
        }
        let vault = vault(&dir).await;
        let status = vault.status();
        assert!(status.enabled && status.has_password && !status.key_loaded);
    }

    #[tokio::test]
    async fn test_second_set_password_is_refused() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let notes = TenantId::new("notes").unwrap();

        vault.set_master_password("abcdefgh".into()).await.unwrap();
        vault.set_enabled(true).await.unwrap();
        vault.store().write(&notes, "k", &json!("sealed")).await.unwrap();

        assert!(matches!(
            vault.set_master_password("other password".into()).await,
            Err(VaultError::PasswordAlreadySet)
        ));

        vault.lock();
        assert!(!vault.unlock("other password".into()).await.unwrap());
        assert!(vault.unlock("abcdefgh".into()).await.unwrap());
        assert_eq!(vault.store().read(&notes, "k").await.unwrap().unwrap().value, json!("sealed"));
    }

    #[tokio::test]
    async fn test_change_password_while_locked() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let notes = TenantId::new("notes").unwrap();

        vault.set_master_password("abcdefgh".into()).await.unwrap();
        vault.set_enabled(true).await.unwrap();
        vault.store().write(&notes, "k", &json!(1)).await.unwrap();
        vault.lock();

        let count = vault
            .change_master_password("abcdefgh".into(), "new password".into())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(vault.store().read(&notes, "k").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_during_password_change_stay_readable() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir).await;
        let notes = TenantId::new("notes").unwrap();

        vault.set_master_password("abcdefgh".into()).await.unwrap();
        vault.set_enabled(true).await.unwrap();
        for i in 0..50 {
            vault.store().write(&notes, &format!("old-{}", i), &json!(i)).await.unwrap();
        }

        let rotating = {
            let vault = vault.clone();
            tokio::spawn(async move {
                vault.change_master_password("abcdefgh".into(), "new password".into()).await
            })
        };
        let writers: Vec<_> = (0..20)
            .map(|i| {
                let vault = vault.clone();
                let notes = notes.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(i)).await;
                    vault.store().write(&notes, &format!("new-{}", i), &json!(i)).await
                })
            })
            .collect();

        rotating.await.unwrap().unwrap();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        vault.lock();
        assert!(vault.unlock("new password".into()).await.unwrap());
        let all = vault.store().read_all(&notes).await.unwrap();
        assert_eq!(all.len(), 70);
        assert_eq!(all["new-7"].value, json!(7));
    }

    #[tokio::test]
    async fn test_committed_rotation_is_completed_on_reopen() {
        let dir = TempDir::new().unwrap();
        let notes = TenantId::new("notes").unwrap();
        {
            let vault = vault(&dir).await;
            vault.set_master_password("abcdefgh".into()).await.unwrap();
            vault.set_enabled(true).await.unwrap();
            vault.store().write(&notes, "k", &json!("v")).await.unwrap();

            // Stop after the new key is committed but before staged records move
            let keys = vault.store().codec().keys();
            let params = read_keys(keys).kdf_params();
            let old_key = params.verify("abcdefgh").unwrap();
            let material = params.derive_fresh("new password").unwrap();
            vault.store().stage_rotation(&old_key, &material).await.unwrap();
            write_keys(keys).install_rotation(&params, material).unwrap();
        }

        let vault = vault(&dir).await;
        assert!(!dir.path().join(RECORDS_DIR).join(".rotation").exists());
        assert!(vault.unlock("new password".into()).await.unwrap());
        assert_eq!(vault.store().read(&notes, "k").await.unwrap().unwrap().value, json!("v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_key_derivation_does_not_block_other_callers() {
        let dir = TempDir::new().unwrap();
        let mut options = VaultOptions::new(dir.path());
        options.kdf_iterations = 300_000;
        let vault = Vault::open(options).await.unwrap();
        let notes = TenantId::new("notes").unwrap();

        let started = Instant::now();
        let setting = {
            let vault = vault.clone();
            tokio::spawn(async move { vault.set_master_password("abcdefgh".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiting = Instant::now();
        let _ = vault.status();
        vault.store().write(&notes, "k", &json!(1)).await.unwrap();
        let waited = waiting.elapsed();

        setting.await.unwrap().unwrap();
        let total = started.elapsed();
        assert!(waited < total / 2, "waited {:?} of {:?}", waited, total);
        assert!(vault.status().has_password);
    }
}
