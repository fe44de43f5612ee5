//! Encrypted, tenant-namespaced record storage.
//!
//! Persistence pipeline: [`keys::KeyManager`] holds the master key,
//! [`cipher::CipherCodec`] seals payloads with it, and [`store::RecordStore`]
//! writes one file per (tenant, key).

pub mod cipher;
pub mod error;
pub mod keys;
mod persist;
pub mod registry;
pub mod store;
pub mod tags;
pub mod types;

pub use cipher::{AeadAlgorithm, CipherCodec, Envelope};
pub use error::{Result, VaultError};
pub use keys::{EncryptionStatus, KdfParams, KeyManager, KeyMaterial, MasterKey, SharedKeyManager};
pub use registry::{Manifest, Tenant, TenantRegistry};
pub use store::{RecordStore, RotationStage};
pub use tags::{ImportOutcome, Tag, TagCatalog, TagDraft, TagUpdate};
pub use types::{ClearOutcome, DeleteOutcome, KeyStat, Receipt, Record, StorageStats, TenantId};
