//! Tenant isolation bridge
//!
//! ## Architecture
//!
//! ```text
//! Tenant context
//!     │ SyncStorage (CachedStorage)
//!     ▼
//! TenantBridge ── mpsc<Command> + oneshot reply
//!     │
//!     ▼
//! BridgeHost context server (tenant identity bound here)
//!     │
//!     ▼
//! RecordStore / TagCatalog
//! ```
//!
//! A tenant context only ever holds a [`TenantBridge`]. The identity its
//! commands run under is fixed by the host when the context is established.

pub mod bridge;
pub mod host;
mod protocol;
pub mod shim;

pub use bridge::{BridgeError, TenantBridge};
pub use host::{BridgeHost, ContextBinding};
pub use protocol::AppInfo;
pub use shim::{CachedStorage, SyncStorage};
