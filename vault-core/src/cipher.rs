//! Authenticated payload encryption
//!
//! Each record payload is sealed independently with a fresh random 96-bit
//! nonce under the master key held by the [`KeyManager`](crate::keys::KeyManager).
//! The AEAD output is split into ciphertext and the trailing 16-byte tag so the
//! stored envelope carries them as separate hex fields.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, VaultError};
use crate::keys::{read_keys, MasterKey, SharedKeyManager};

/// Associated data bound into every sealed payload
pub const PAYLOAD_AAD: &[u8] = b"miniapp-vault/tenant-storage-payload/v1";

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Supported AEAD constructions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            AeadAlgorithm::Aes256Gcm => "aes-256-gcm",
            AeadAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AeadAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(AeadAlgorithm::Aes256Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Ok(AeadAlgorithm::ChaCha20Poly1305),
            other => Err(format!("unknown cipher '{}'", other)),
        }
    }
}

/// Stored form of a record payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Envelope {
    /// Written while encryption was disabled or no key was loaded
    Plain { value: serde_json::Value },
    Sealed {
        algorithm: AeadAlgorithm,
        /// Hex encoded
        nonce: String,
        /// Hex encoded
        ciphertext: String,
        /// Hex encoded
        #[serde(rename = "authTag")]
        auth_tag: String,
    },
}

impl Envelope {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Envelope::Sealed { .. })
    }
}

/// Encrypts and decrypts record payloads with the shared master key
#[derive(Clone)]
pub struct CipherCodec {
    keys: SharedKeyManager,
    algorithm: AeadAlgorithm,
}

impl CipherCodec {
    pub fn new(keys: SharedKeyManager, algorithm: AeadAlgorithm) -> Self {
        Self { keys, algorithm }
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    pub fn keys(&self) -> &SharedKeyManager {
        &self.keys
    }

    /// Wrap `value` for storage. Passes through unencrypted when encryption is
    /// disabled or no key is loaded.
    pub fn encrypt(&self, value: &serde_json::Value) -> Result<Envelope> {
        let keys = read_keys(&self.keys);
        if !keys.is_enabled() {
            return Ok(Envelope::Plain { value: value.clone() });
        }
        let Some(key) = keys.master_key() else {
            tracing::warn!("Encryption enabled but no master key loaded; storing unencrypted");
            return Ok(Envelope::Plain { value: value.clone() });
        };
        self.seal_with(key, value)
    }

    /// Seal `value` under the loaded key regardless of the enabled flag.
    /// Used when re-encrypting records that were already sealed.
    pub fn seal(&self, value: &serde_json::Value) -> Result<Envelope> {
        let keys = read_keys(&self.keys);
        let key = keys.master_key().ok_or(VaultError::KeyUnavailable)?;
        self.seal_with(key, value)
    }

    /// Seal `value` under an explicit key instead of the loaded one
    pub(crate) fn seal_with(&self, key: &MasterKey, value: &serde_json::Value) -> Result<Envelope> {
        let plaintext = serde_json::to_vec(value)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut sealed = aead_seal(self.algorithm, key, &nonce, &plaintext)?;
        let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(Envelope::Sealed {
            algorithm: self.algorithm,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(sealed),
            auth_tag: hex::encode(auth_tag),
        })
    }

    /// Recover the value from `envelope`. Wrong key, tampering and malformed
    /// fields all fail with [`VaultError::Decryption`].
    pub fn decrypt(&self, envelope: &Envelope) -> Result<serde_json::Value> {
        let (algorithm, nonce, ciphertext, auth_tag) = match envelope {
            Envelope::Plain { value } => return Ok(value.clone()),
            Envelope::Sealed { algorithm, nonce, ciphertext, auth_tag } => {
                (*algorithm, nonce, ciphertext, auth_tag)
            }
        };

        let keys = read_keys(&self.keys);
        let key = keys.master_key().ok_or(VaultError::KeyUnavailable)?;
        open_sealed(key, algorithm, nonce, ciphertext, auth_tag)
    }

    /// Decrypt `envelope` under an explicit key instead of the loaded one
    pub(crate) fn decrypt_with(&self, key: &MasterKey, envelope: &Envelope) -> Result<serde_json::Value> {
        match envelope {
            Envelope::Plain { value } => Ok(value.clone()),
            Envelope::Sealed { algorithm, nonce, ciphertext, auth_tag } => {
                open_sealed(key, *algorithm, nonce, ciphertext, auth_tag)
            }
        }
    }
}

fn open_sealed(
    key: &MasterKey,
    algorithm: AeadAlgorithm,
    nonce: &str,
    ciphertext: &str,
    auth_tag: &str,
) -> Result<serde_json::Value> {
    let nonce = hex::decode(nonce).map_err(|_| VaultError::Decryption)?;
    let mut combined = hex::decode(ciphertext).map_err(|_| VaultError::Decryption)?;
    let auth_tag = hex::decode(auth_tag).map_err(|_| VaultError::Decryption)?;
    if nonce.len() != NONCE_LEN || auth_tag.len() != TAG_LEN {
        return Err(VaultError::Decryption);
    }
    combined.extend_from_slice(&auth_tag);

    let plaintext = aead_open(algorithm, key, &nonce, &combined)?;
    serde_json::from_slice(&plaintext).map_err(|_| VaultError::Decryption)
}

fn aead_seal(algorithm: AeadAlgorithm, key: &MasterKey, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload { msg: plaintext, aad: PAYLOAD_AAD };
    let out = match algorithm {
        AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| VaultError::KeyUnavailable)?
            .encrypt(Nonce::from_slice(nonce), payload),
        AeadAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| VaultError::KeyUnavailable)?
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
    };
    // Encryption only fails on oversized input
    out.map_err(|_| VaultError::Serialization(serde::ser::Error::custom("payload too large to encrypt")))
}

fn aead_open(algorithm: AeadAlgorithm, key: &MasterKey, nonce: &[u8], combined: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload { msg: combined, aad: PAYLOAD_AAD };
    let out = match algorithm {
        AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| VaultError::Decryption)?
            .decrypt(Nonce::from_slice(nonce), payload),
        AeadAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| VaultError::Decryption)?
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
    };
    out.map_err(|_| VaultError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{write_keys, KeyManager};
    use serde_json::json;
    use std::sync::{Arc, RwLock};
    use tempfile::TempDir;

    fn codec(dir: &TempDir, algorithm: AeadAlgorithm, password: &str) -> CipherCodec {
        let mut keys = KeyManager::open(dir.path().join("encryption-config.json"), 1_000).unwrap();
        keys.set_master_password(password).unwrap();
        keys.commit_password_hash().unwrap();
        keys.set_enabled(true).unwrap();
        CipherCodec::new(Arc::new(RwLock::new(keys)), algorithm)
    }

    /// Flip one bit of the byte at `position` (0 = first, 1 = middle, 2 = last)
    fn tamper_hex(field: &mut String, position: usize) {
        let mut bytes = hex::decode(&*field).unwrap();
        let index = match position {
            0 => 0,
            1 => bytes.len() / 2,
            _ => bytes.len() - 1,
        };
        bytes[index] ^= 0x01;
        *field = hex::encode(bytes);
    }

    #[test]
    fn test_round_trip_both_algorithms() {
        let values = [
            json!({}),
            json!({"a": [1, 2, {"b": null}], "c": "x"}),
            json!("embedded\u{0000}nul"),
            json!(42),
        ];
        for algorithm in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::ChaCha20Poly1305] {
            let dir = TempDir::new().unwrap();
            let codec = codec(&dir, algorithm, "abcdefgh");
            for value in &values {
                let envelope = codec.encrypt(value).unwrap();
                assert!(envelope.is_encrypted());
                assert_eq!(&codec.decrypt(&envelope).unwrap(), value);
            }
        }
    }

    #[test]
    fn test_passthrough_when_disabled() {
        let dir = TempDir::new().unwrap();
        let keys = KeyManager::open(dir.path().join("encryption-config.json"), 1_000).unwrap();
        let codec = CipherCodec::new(Arc::new(RwLock::new(keys)), AeadAlgorithm::default());

        let envelope = codec.encrypt(&json!({"x": 1})).unwrap();
        assert_eq!(envelope, Envelope::Plain { value: json!({"x": 1}) });
        assert_eq!(codec.decrypt(&envelope).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_passthrough_when_locked() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        write_keys(codec.keys()).lock();

        assert!(!codec.encrypt(&json!(1)).unwrap().is_encrypted());
    }

    #[test]
    fn test_seal_ignores_enabled_flag() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        write_keys(codec.keys()).set_enabled(false).unwrap();

        assert!(!codec.encrypt(&json!(1)).unwrap().is_encrypted());
        let sealed = codec.seal(&json!(1)).unwrap();
        assert!(sealed.is_encrypted());
        assert_eq!(codec.decrypt(&sealed).unwrap(), json!(1));
    }

    #[test]
    fn test_decrypt_without_key_is_key_unavailable() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        let envelope = codec.encrypt(&json!("secret")).unwrap();
        write_keys(codec.keys()).lock();

        assert!(matches!(codec.decrypt(&envelope), Err(VaultError::KeyUnavailable)));
    }

    #[test]
    fn test_tampering_fails_closed() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        let original = codec.encrypt(&json!({"note": "hello, tampering"})).unwrap();

        for field in ["nonce", "ciphertext", "authTag"] {
            for position in 0..3 {
                let mut envelope = original.clone();
                if let Envelope::Sealed { nonce, ciphertext, auth_tag, .. } = &mut envelope {
                    match field {
                        "nonce" => tamper_hex(nonce, position),
                        "ciphertext" => tamper_hex(ciphertext, position),
                        _ => tamper_hex(auth_tag, position),
                    }
                }
                assert_ne!(envelope, original);
                assert!(
                    matches!(codec.decrypt(&envelope), Err(VaultError::Decryption)),
                    "{} tampered at position {} must not decrypt",
                    field,
                    position
                );
            }
        }
    }

    #[test]
    fn test_tampering_fails_closed_chacha() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::ChaCha20Poly1305, "abcdefgh");
        let original = codec.encrypt(&json!([1, 2, 3, "four"])).unwrap();

        for position in 0..3 {
            let mut envelope = original.clone();
            if let Envelope::Sealed { ciphertext, .. } = &mut envelope {
                tamper_hex(ciphertext, position);
            }
            assert!(matches!(codec.decrypt(&envelope), Err(VaultError::Decryption)));
        }
    }

    #[test]
    fn test_explicit_key_helpers() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        let key = read_keys(codec.keys()).master_key().unwrap().clone();
        write_keys(codec.keys()).lock();

        let sealed = codec.seal_with(&key, &json!({"k": 1})).unwrap();
        assert!(sealed.is_encrypted());
        assert_eq!(codec.decrypt_with(&key, &sealed).unwrap(), json!({"k": 1}));
        assert!(matches!(codec.decrypt(&sealed), Err(VaultError::KeyUnavailable)));
    }

    #[test]
    fn test_malformed_lengths_rejected() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        let Envelope::Sealed { algorithm, nonce, ciphertext, auth_tag } =
            codec.encrypt(&json!(1)).unwrap()
        else {
            panic!("expected sealed envelope");
        };

        let short_nonce = Envelope::Sealed {
            algorithm,
            nonce: nonce[..16].to_string(),
            ciphertext: ciphertext.clone(),
            auth_tag: auth_tag.clone(),
        };
        let short_tag = Envelope::Sealed {
            algorithm,
            nonce: nonce.clone(),
            ciphertext: ciphertext.clone(),
            auth_tag: auth_tag[..30].to_string(),
        };
        let not_hex = Envelope::Sealed { algorithm, nonce, ciphertext: "zz".into(), auth_tag };

        for envelope in [short_nonce, short_tag, not_hex] {
            assert!(matches!(codec.decrypt(&envelope), Err(VaultError::Decryption)));
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = codec(&dir_a, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        let b = codec(&dir_b, AeadAlgorithm::Aes256Gcm, "abcdefgh");

        // Same password, different salt, different key
        let envelope = a.encrypt(&json!("secret")).unwrap();
        assert!(matches!(b.decrypt(&envelope), Err(VaultError::Decryption)));
    }

    #[test]
    fn test_envelope_algorithm_wins_over_configured() {
        let dir = TempDir::new().unwrap();
        let chacha = codec(&dir, AeadAlgorithm::ChaCha20Poly1305, "abcdefgh");
        let envelope = chacha.encrypt(&json!([1, 2, 3])).unwrap();

        let aes = CipherCodec::new(chacha.keys().clone(), AeadAlgorithm::Aes256Gcm);
        assert_eq!(aes.decrypt(&envelope).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_envelope_wire_format() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, AeadAlgorithm::Aes256Gcm, "abcdefgh");
        let wire = serde_json::to_value(codec.encrypt(&json!(1)).unwrap()).unwrap();

        assert_eq!(wire["mode"], "sealed");
        assert_eq!(wire["algorithm"], "aes-256-gcm");
        assert_eq!(wire["nonce"].as_str().unwrap().len(), NONCE_LEN * 2);
        assert_eq!(wire["authTag"].as_str().unwrap().len(), TAG_LEN * 2);
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("AES-256-GCM".parse::<AeadAlgorithm>().unwrap(), AeadAlgorithm::Aes256Gcm);
        assert_eq!(
            "chacha20-poly1305".parse::<AeadAlgorithm>().unwrap(),
            AeadAlgorithm::ChaCha20Poly1305
        );
        assert!("rot13".parse::<AeadAlgorithm>().is_err());
    }
}
