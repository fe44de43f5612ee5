//! Error taxonomy shared by the key manager, cipher codec and record store.

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("master password must be at least {min} characters long")]
    WeakPassword { min: usize },
    #[error("no master key is loaded")]
    NoKeyLoaded,
    #[error("current master password is incorrect")]
    Authentication,
    #[error("master key not available for decryption")]
    KeyUnavailable,
    /// Wrong key and corrupted data are deliberately reported the same way.
    #[error("failed to decrypt data - invalid password or corrupted data")]
    Decryption,
    #[error("record store is not initialized")]
    NotInitialized,
    /// A record stored under one tenant was resolved for another. This is a
    /// namespace-resolution defect, never a recoverable condition.
    #[error("access denied: record belongs to tenant '{stored}', requested by '{requested}'")]
    CrossTenantAccess { requested: String, stored: String },
    #[error("tenant identity has not been established for this context")]
    TenantNotReady,
    #[error("cannot enable encryption without a master password")]
    PasswordRequired,
    #[error("a master password is already set; change it with the current password")]
    PasswordAlreadySet,
    #[error("invalid tenant id: {0}")]
    InvalidTenantId(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("tenant '{0}' not found")]
    TenantNotFound(String),
    #[error("tag {0} not found")]
    TagNotFound(u64),
    #[error("tag named '{0}' already exists")]
    TagConflict(String),
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl VaultError {
    /// Stable machine-readable code, used when errors cross the tenant boundary
    /// or are rendered by the host API.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::WeakPassword { .. } => "weak_password",
            VaultError::NoKeyLoaded => "no_key_loaded",
            VaultError::Authentication => "authentication",
            VaultError::KeyUnavailable => "key_unavailable",
            VaultError::Decryption => "decryption",
            VaultError::NotInitialized => "not_initialized",
            VaultError::CrossTenantAccess { .. } => "cross_tenant_access",
            VaultError::TenantNotReady => "tenant_not_ready",
            VaultError::PasswordRequired => "password_required",
            VaultError::PasswordAlreadySet => "password_already_set",
            VaultError::InvalidTenantId(_) => "invalid_tenant_id",
            VaultError::InvalidKey(_) => "invalid_key",
            VaultError::TenantNotFound(_) => "tenant_not_found",
            VaultError::TagNotFound(_) => "tag_not_found",
            VaultError::TagConflict(_) => "tag_conflict",
            VaultError::InvalidTag(_) => "invalid_tag",
            VaultError::InvalidManifest(_) => "invalid_manifest",
            VaultError::Io(_) => "io",
            VaultError::Serialization(_) => "serialization",
            VaultError::Task(_) => "task",
        }
    }
}
