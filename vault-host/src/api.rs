//! Admin HTTP API for the vault host
//!
//! Endpoints:
//! - GET /health - Health check (no auth)
//! - GET /encryption/status - Encryption state
//! - POST /encryption/password - Set master password (derive + commit hash)
//! - DELETE /encryption/password - Remove master password
//! - POST /encryption/verify - Verify (and unlock with) a password
//! - POST /encryption/enabled - Toggle encryption
//! - POST /encryption/change - Rotate master password, re-encrypting records
//! - POST /encryption/lock - Drop the in-memory key
//! - GET|POST /tags, PUT|DELETE /tags/:id, POST /tags/import - Tag catalog
//! - GET /tenants, POST /tenants/install - Tenant registry
//! - GET /tenants/:id/storage - Per-tenant storage usage

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use vault_core::{
    DeleteOutcome, EncryptionStatus, ImportOutcome, Manifest, StorageStats, Tag, TagDraft, TagUpdate,
    TenantId, VaultError,
};

use crate::config::Config;
use crate::vault::Vault;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub vault: Vault,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(vault: Vault, config: Config) -> Self {
        Self {
            vault,
            config: Arc::new(config),
        }
    }
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        let msg = err.to_string();
        match err {
            VaultError::WeakPassword { .. }
            | VaultError::PasswordRequired
            | VaultError::InvalidTenantId(_)
            | VaultError::InvalidKey(_)
            | VaultError::InvalidTag(_)
            | VaultError::InvalidManifest(_) => ApiError::BadRequest(msg),
            VaultError::Authentication => ApiError::Forbidden(msg),
            VaultError::TenantNotFound(_) | VaultError::TagNotFound(_) => ApiError::NotFound(msg),
            VaultError::TagConflict(_)
            | VaultError::PasswordAlreadySet
            | VaultError::NoKeyLoaded
            | VaultError::KeyUnavailable => ApiError::Conflict(msg),
            other => {
                tracing::error!(code = other.code(), "Vault operation failed: {}", other);
                ApiError::InternalError(msg)
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub cipher: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangePasswordResponse {
    pub reencrypted: usize,
}

#[derive(Debug, Deserialize)]
pub struct ImportTagsRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub tags: Vec<TagDraft>,
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub path: String,
}

/// Create the API router with all endpoints
/// Everything except /health requires an admin token
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/encryption/status", get(status_handler))
        .route(
            "/encryption/password",
            post(set_password_handler).delete(remove_password_handler),
        )
        .route("/encryption/verify", post(verify_handler))
        .route("/encryption/enabled", post(set_enabled_handler))
        .route("/encryption/change", post(change_password_handler))
        .route("/encryption/lock", post(lock_handler))
        .route("/tags", get(list_tags_handler).post(create_tag_handler))
        .route("/tags/import", post(import_tags_handler))
        .route("/tags/:id", put(update_tag_handler).delete(delete_tag_handler))
        .route("/tenants", get(list_tenants_handler))
        .route("/tenants/install", post(install_tenant_handler))
        .route("/tenants/:id/storage", get(tenant_storage_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        cipher: state.config.cipher.to_string(),
    })
}

async fn status_handler(State(state): State<AppState>) -> Json<EncryptionStatus> {
    Json(state.vault.status())
}

async fn set_password_handler(
    State(state): State<AppState>,
    Json(req): Json<PasswordRequest>,
) -> Result<Json<EncryptionStatus>, ApiError> {
    state.vault.set_master_password(req.password).await?;
    tracing::info!("Master password set via admin API");
    Ok(Json(state.vault.status()))
}

async fn remove_password_handler(State(state): State<AppState>) -> Result<Json<EncryptionStatus>, ApiError> {
    state.vault.remove_master_password().await?;
    Ok(Json(state.vault.status()))
}

async fn verify_handler(
    State(state): State<AppState>,
    Json(req): Json<PasswordRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let valid = state.vault.verify_master_password(req.password).await?;
    Ok(Json(VerifyResponse { valid }))
}

async fn set_enabled_handler(
    State(state): State<AppState>,
    Json(req): Json<EnabledRequest>,
) -> Result<Json<EncryptionStatus>, ApiError> {
    state.vault.set_enabled(req.enabled).await?;
    Ok(Json(state.vault.status()))
}

async fn change_password_handler(
    State(state): State<AppState>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<ChangePasswordResponse>, ApiError> {
    let reencrypted = state
        .vault
        .change_master_password(req.old_password, req.new_password)
        .await?;
    Ok(Json(ChangePasswordResponse { reencrypted }))
}

async fn lock_handler(State(state): State<AppState>) -> Json<EncryptionStatus> {
    state.vault.lock();
    Json(state.vault.status())
}

async fn list_tags_handler(State(state): State<AppState>) -> Json<Vec<Tag>> {
    Json(state.vault.tags().list().await)
}

async fn create_tag_handler(
    State(state): State<AppState>,
    Json(draft): Json<TagDraft>,
) -> Result<(StatusCode, Json<Tag>), ApiError> {
    let tag = state.vault.tags().create(draft, None).await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

async fn update_tag_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(update): Json<TagUpdate>,
) -> Result<Json<Tag>, ApiError> {
    Ok(Json(state.vault.tags().update(id, update).await?))
}

async fn delete_tag_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<DeleteOutcome>, ApiError> {
    Ok(Json(state.vault.tags().delete(id).await?))
}

async fn import_tags_handler(
    State(state): State<AppState>,
    Json(req): Json<ImportTagsRequest>,
) -> Result<Json<Vec<ImportOutcome>>, ApiError> {
    Ok(Json(state.vault.tags().import(req.tenant_id, req.tags).await?))
}

async fn list_tenants_handler(State(state): State<AppState>) -> Json<Vec<Manifest>> {
    Json(state.vault.registry().list().await)
}

async fn install_tenant_handler(
    State(state): State<AppState>,
    Json(req): Json<InstallRequest>,
) -> Result<(StatusCode, Json<Manifest>), ApiError> {
    let manifest = state.vault.registry().install(&req.path).await?;
    Ok((StatusCode::CREATED, Json(manifest)))
}

async fn tenant_storage_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StorageStats>, ApiError> {
    let tenant = TenantId::new(id)?;
    if state.vault.registry().get(&tenant).await.is_none() {
        return Err(ApiError::NotFound(format!("tenant '{}' not found", tenant)));
    }
    Ok(Json(state.vault.store().stats(&tenant).await?))
}

/// Authentication middleware
///
/// Checks Bearer token in Authorization header.
/// Token is hashed with SHA256 and compared against allowed hashes.
async fn auth_middleware(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Invalid Authorization format".to_string()))?;

    let token_hash = hash_token(token);
    if !state.config.admin_token_hashes.contains(&token_hash) {
        tracing::warn!(token_hash = %token_hash, "Unauthorized access attempt");
        return Err(ApiError::Unauthorized("Invalid token".to_string()));
    }

    Ok(next.run(req).await)
}

/// Hex SHA256 of an admin token, as listed in ADMIN_TOKEN_HASHES
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
