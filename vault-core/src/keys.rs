//! Master key lifecycle
//!
//! The master key is derived from the user's master password with
//! PBKDF2-HMAC-SHA256 over a persisted random salt. Only the salt and a
//! SHA-256 verification hash of the derived key are written to disk; the key
//! itself lives in memory, is zeroized on drop, and is cleared by [`KeyManager::lock`].
//!
//! Persisted configuration (`encryption-config.json`):
//!
//! ```json
//! { "encryptionEnabled": true, "salt": "<hex>", "passwordHash": "<hex>", "kdfIterations": 100000 }
//! ```

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};
use crate::persist::write_atomic_blocking;

/// Minimum master password length in characters
pub const MIN_PASSWORD_LEN: usize = 8;

/// Default PBKDF2 iteration count
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Salt length in bytes (256 bits)
pub const SALT_LEN: usize = 32;

/// Derived key length in bytes (256 bits)
pub const KEY_LEN: usize = 32;

/// Key manager shared by every component that needs cryptographic access
pub type SharedKeyManager = Arc<RwLock<KeyManager>>;

/// Read-lock the shared key manager. A poisoned lock still holds consistent
/// state because every mutation assigns fields only after fallible work.
pub fn read_keys(keys: &SharedKeyManager) -> RwLockReadGuard<'_, KeyManager> {
    keys.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-lock the shared key manager
pub fn write_keys(keys: &SharedKeyManager) -> RwLockWriteGuard<'_, KeyManager> {
    keys.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory master key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    fn verification_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Read-only snapshot of the encryption state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionStatus {
    pub enabled: bool,
    pub has_password: bool,
    pub key_loaded: bool,
}

/// On-disk form of the key configuration
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyConfigFile {
    #[serde(default)]
    encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kdf_iterations: Option<u32>,
}

/// Derivation inputs copied out of a [`KeyManager`]
#[derive(Debug, Clone)]
pub struct KdfParams {
    salt: Option<[u8; SALT_LEN]>,
    verification_hash: Option<[u8; 32]>,
    stored_iterations: u32,
    iterations: u32,
}

impl KdfParams {
    pub fn has_password(&self) -> bool {
        self.salt.is_some() && self.verification_hash.is_some()
    }

    /// Key for a first password, reusing an uncommitted salt if one exists
    pub fn derive_initial(&self, password: &str) -> Result<KeyMaterial> {
        if self.has_password() {
            return Err(VaultError::PasswordAlreadySet);
        }
        check_strength(password)?;
        let salt = self.salt.unwrap_or_else(random_salt);
        Ok(KeyMaterial::derive(password, salt, self.iterations))
    }

    /// Key for a replacement password under a fresh salt
    pub fn derive_fresh(&self, password: &str) -> Result<KeyMaterial> {
        check_strength(password)?;
        Ok(KeyMaterial::derive(password, random_salt(), self.iterations))
    }

    /// The key for `password` if it matches the committed hash
    pub fn verify(&self, password: &str) -> Option<MasterKey> {
        let (Some(salt), Some(expected)) = (self.salt, self.verification_hash) else {
            return None;
        };
        let candidate = derive_key(password, &salt, self.stored_iterations);
        let matches: bool = candidate.verification_hash().ct_eq(&expected).into();
        matches.then_some(candidate)
    }
}

/// A derived key together with the salt and iteration count behind it
pub struct KeyMaterial {
    salt: [u8; SALT_LEN],
    iterations: u32,
    key: MasterKey,
}

impl KeyMaterial {
    fn derive(password: &str, salt: [u8; SALT_LEN], iterations: u32) -> Self {
        let key = derive_key(password, &salt, iterations);
        Self { salt, iterations, key }
    }

    pub fn verification_hash_hex(&self) -> String {
        hex::encode(self.key.verification_hash())
    }

    pub(crate) fn key(&self) -> &MasterKey {
        &self.key
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("iterations", &self.iterations)
            .field("key", &self.key)
            .finish()
    }
}

/// Owns the master password state: salt, verification hash and derived key.
pub struct KeyManager {
    config_path: PathBuf,
    /// Iterations used for new derivations
    iterations: u32,
    /// Iterations the persisted hash was produced with
    stored_iterations: u32,
    enabled: bool,
    salt: Option<[u8; SALT_LEN]>,
    verification_hash: Option<[u8; 32]>,
    master_key: Option<MasterKey>,
}

impl KeyManager {
    /// Load the key configuration from `config_path`, or start empty if the
    /// file does not exist yet.
    pub fn open(config_path: impl Into<PathBuf>, iterations: u32) -> Result<Self> {
        let config_path = config_path.into();
        let iterations = iterations.max(1);

        let file = match std::fs::read(&config_path) {
            Ok(bytes) => serde_json::from_slice::<KeyConfigFile>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => KeyConfigFile::default(),
            Err(e) => return Err(e.into()),
        };

        let salt = match file.salt.as_deref() {
            Some(hex_salt) => Some(decode_fixed::<SALT_LEN>(hex_salt, "salt")?),
            None => None,
        };
        let verification_hash = match file.password_hash.as_deref() {
            Some(hex_hash) => Some(decode_fixed::<32>(hex_hash, "passwordHash")?),
            None => None,
        };

        tracing::debug!(
            path = %config_path.display(),
            enabled = file.encryption_enabled,
            has_password = verification_hash.is_some(),
            "Loaded key configuration"
        );

        Ok(Self {
            config_path,
            iterations,
            stored_iterations: file.kdf_iterations.unwrap_or(iterations),
            enabled: file.encryption_enabled,
            salt,
            verification_hash,
            master_key: None,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Snapshot of the derivation inputs. Derive from it without holding the
    /// key manager lock, then hand the result back with [`KeyManager::adopt`],
    /// [`KeyManager::load_verified`] or [`KeyManager::install_rotation`].
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            salt: self.salt,
            verification_hash: self.verification_hash,
            stored_iterations: self.stored_iterations,
            iterations: self.iterations,
        }
    }

    /// Derive and hold the master key for `password`.
    ///
    /// Generates and persists a salt if none exists. The verification hash is
    /// not written until [`KeyManager::commit_password_hash`]. Refused once a
    /// password is committed; use [`KeyManager::change_master_password`].
    pub fn set_master_password(&mut self, password: &str) -> Result<()> {
        let material = self.kdf_params().derive_initial(password)?;
        self.adopt(material)
    }

    /// Hold a key derived by [`KdfParams::derive_initial`], persisting its salt
    pub fn adopt(&mut self, material: KeyMaterial) -> Result<()> {
        if self.has_master_password() {
            return Err(VaultError::PasswordAlreadySet);
        }
        if self.salt != Some(material.salt) || self.stored_iterations != material.iterations {
            self.persist_with(self.enabled, Some(&material.salt), None, material.iterations)?;
            if self.salt.is_none() {
                tracing::info!("Generated new master password salt");
            }
            self.salt = Some(material.salt);
            self.stored_iterations = material.iterations;
        }
        self.master_key = Some(material.key);
        Ok(())
    }

    /// Persist the verification hash of the currently derived key
    pub fn commit_password_hash(&mut self) -> Result<()> {
        let key = self.master_key.as_ref().ok_or(VaultError::NoKeyLoaded)?;
        let hash = key.verification_hash();
        self.persist_with(self.enabled, self.salt.as_ref(), Some(&hash), self.stored_iterations)?;
        self.verification_hash = Some(hash);
        tracing::info!("Master password hash committed");
        Ok(())
    }

    /// Check `password` against the stored verification hash. On success the
    /// derived key is loaded; on failure the loaded key is left untouched.
    pub fn verify_master_password(&mut self, password: &str) -> bool {
        let params = self.kdf_params();
        match params.verify(password) {
            Some(key) => self.load_verified(&params, key),
            None => {
                tracing::debug!("Master password verification failed");
                false
            }
        }
    }

    /// Load a key returned by [`KdfParams::verify`] unless the password changed
    /// since `params` was taken.
    pub fn load_verified(&mut self, params: &KdfParams, key: MasterKey) -> bool {
        if self.salt != params.salt || self.verification_hash != params.verification_hash {
            tracing::warn!("Master password changed during verification; key not loaded");
            return false;
        }
        self.master_key = Some(key);
        true
    }

    /// Replace salt, verification hash and key in one persisted update.
    ///
    /// Records encrypted under the old key are not touched here; see
    /// `Vault::change_master_password` for the re-encrypting variant.
    pub fn change_master_password(&mut self, old_password: &str, new_password: &str) -> Result<()> {
        let params = self.kdf_params();
        if params.verify(old_password).is_none() {
            return Err(VaultError::Authentication);
        }
        let material = params.derive_fresh(new_password)?;
        self.install_rotation(&params, material)
    }

    /// Make `material` the committed password. Fails with
    /// [`VaultError::Authentication`] if the password changed since `params`
    /// was taken.
    pub fn install_rotation(&mut self, params: &KdfParams, material: KeyMaterial) -> Result<()> {
        if self.salt != params.salt || self.verification_hash != params.verification_hash {
            return Err(VaultError::Authentication);
        }
        let hash = material.key.verification_hash();
        self.persist_with(self.enabled, Some(&material.salt), Some(&hash), material.iterations)?;

        self.salt = Some(material.salt);
        self.verification_hash = Some(hash);
        self.stored_iterations = material.iterations;
        self.master_key = Some(material.key);
        tracing::info!("Master password changed");
        Ok(())
    }

    /// Discard salt, verification hash and key, and disable encryption
    pub fn remove_master_password(&mut self) -> Result<()> {
        self.persist_with(false, None, None, self.iterations)?;
        self.salt = None;
        self.verification_hash = None;
        self.master_key = None;
        self.enabled = false;
        tracing::warn!("Master password removed; previously encrypted records are no longer readable");
        Ok(())
    }

    /// Toggle at-rest encryption. Enabling requires a committed password.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled && !self.has_master_password() {
            return Err(VaultError::PasswordRequired);
        }
        self.persist_with(enabled, self.salt.as_ref(), self.verification_hash.as_ref(), self.stored_iterations)?;
        self.enabled = enabled;
        tracing::info!(enabled, "Encryption toggled");
        Ok(())
    }

    /// Drop the in-memory key. Encrypted records stay unreadable until unlock.
    pub fn lock(&mut self) {
        if self.master_key.take().is_some() {
            tracing::info!("Master key locked");
        }
    }

    /// Alias of [`KeyManager::verify_master_password`]
    pub fn unlock(&mut self, password: &str) -> bool {
        self.verify_master_password(password)
    }

    pub fn has_master_password(&self) -> bool {
        self.salt.is_some() && self.verification_hash.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_key_loaded(&self) -> bool {
        self.master_key.is_some()
    }

    pub fn status(&self) -> EncryptionStatus {
        EncryptionStatus {
            enabled: self.enabled,
            has_password: self.has_master_password(),
            key_loaded: self.is_key_loaded(),
        }
    }

    /// Hex of the committed verification hash
    pub fn verification_hash_hex(&self) -> Option<String> {
        self.verification_hash.map(hex::encode)
    }

    pub(crate) fn master_key(&self) -> Option<&MasterKey> {
        self.master_key.as_ref()
    }

    fn persist_with(
        &self,
        enabled: bool,
        salt: Option<&[u8; SALT_LEN]>,
        hash: Option<&[u8; 32]>,
        iterations: u32,
    ) -> Result<()> {
        let file = KeyConfigFile {
            encryption_enabled: enabled,
            salt: salt.map(hex::encode),
            password_hash: hash.map(hex::encode),
            kdf_iterations: salt.map(|_| iterations),
        };
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic_blocking(&self.config_path, &bytes)
    }
}

fn check_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VaultError::WeakPassword { min: MIN_PASSWORD_LEN });
    }
    Ok(())
}

fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> MasterKey {
    let mut bytes = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut bytes);
    let key = MasterKey { bytes };
    bytes.zeroize();
    key
}

fn decode_fixed<const N: usize>(value: &str, field: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value).map_err(|e| {
        VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid hex in {}: {}", field, e),
        ))
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} must be {} bytes, got {}", field, N, b.len()),
        ))
    })
}
