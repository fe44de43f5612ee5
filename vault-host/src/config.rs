//! Configuration management for the vault host
//!
//! Loads configuration from environment variables with validation.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use vault_core::keys::DEFAULT_KDF_ITERATIONS;
use vault_core::AeadAlgorithm;

use crate::vault::VaultOptions;

/// Lowest PBKDF2 iteration count the host accepts
pub const MIN_KDF_ITERATIONS: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub server_addr: SocketAddr,

    /// Root of all persisted vault state
    pub data_dir: PathBuf,

    /// Content root for built-in tenants
    pub miniapps_dir: PathBuf,

    /// AEAD used for new records
    pub cipher: AeadAlgorithm,

    pub kdf_iterations: u32,

    /// Allowed admin token hashes (SHA256)
    pub admin_token_hashes: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse::<u16>()
            .context("Invalid SERVER_PORT")?;

        let server_addr = format!("{}:{}", host, port)
            .parse()
            .context("Invalid server address")?;

        let data_dir = match std::env::var("VAULT_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .context("No platform data directory; set VAULT_DATA_DIR")?
                .join("miniapp-vault"),
        };
        let miniapps_dir = std::env::var("MINIAPPS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("miniapps"));

        let cipher = std::env::var("VAULT_CIPHER")
            .unwrap_or_else(|_| AeadAlgorithm::default().to_string())
            .parse::<AeadAlgorithm>()
            .map_err(anyhow::Error::msg)
            .context("Invalid VAULT_CIPHER")?;

        let kdf_iterations = match std::env::var("VAULT_KDF_ITERATIONS") {
            Ok(value) => value.parse::<u32>().context("Invalid VAULT_KDF_ITERATIONS")?,
            Err(_) => DEFAULT_KDF_ITERATIONS,
        };

        let admin_token_hashes = parse_token_hashes(&std::env::var("ADMIN_TOKEN_HASHES").unwrap_or_default());

        Ok(Config {
            server_addr,
            data_dir,
            miniapps_dir,
            cipher,
            kdf_iterations,
            admin_token_hashes,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            anyhow::bail!(
                "VAULT_KDF_ITERATIONS must be at least {}, got {}",
                MIN_KDF_ITERATIONS,
                self.kdf_iterations
            );
        }

        if self.admin_token_hashes.is_empty() {
            tracing::warn!("No admin token hashes configured - admin endpoints will reject all requests");
        }

        Ok(())
    }

    pub fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            data_dir: self.data_dir.clone(),
            content_root: self.miniapps_dir.clone(),
            algorithm: self.cipher,
            kdf_iterations: self.kdf_iterations,
        }
    }
}

/// Comma-separated lowercase hex hashes, blanks dropped
fn parse_token_hashes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
