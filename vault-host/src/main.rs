//! Vault Host - local multi-tenant encrypted data vault
//!
//! Owns the master key and every tenant's records, and serves the admin API.
//!
//! Architecture:
//! 1. The master key is derived from the user's password (PBKDF2-HMAC-SHA256)
//!    and lives only in this process's memory
//! 2. Each tenant's records live under their own directory, sealed with
//!    AES-256-GCM or ChaCha20-Poly1305 when encryption is enabled
//! 3. Tenants reach storage only through a bridge bound to their identity
//! 4. The admin API manages the password lifecycle, tags and tenants

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_host::{api, config::Config, Vault};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vault_host=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting miniapp vault host");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        server_addr = %config.server_addr,
        data_dir = %config.data_dir.display(),
        cipher = %config.cipher,
        "Configuration loaded"
    );

    let vault = Vault::open(config.vault_options())
        .await
        .context("Failed to open vault")?;

    let status = vault.status();
    tracing::info!(
        enabled = status.enabled,
        has_password = status.has_password,
        "Vault ready; encrypted records stay locked until the master password is verified"
    );

    // Create API server
    let app_state = api::AppState::new(vault, config.clone());
    let router = api::create_router(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .context("Failed to bind server")?;

    tracing::info!(addr = %config.server_addr, "Admin API server started");

    axum::serve(listener, router)
        .await
        .context("Server error")?;

    Ok(())
}
