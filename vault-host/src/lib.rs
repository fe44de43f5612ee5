// Export modules for testing
pub mod api;
pub mod config;
pub mod vault;

pub use vault::{Vault, VaultOptions};
