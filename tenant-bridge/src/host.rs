//! Host side of the tenant bridge
//!
//! Each opened context gets its own server task that owns the receiving end of
//! the command channel and the context's tenant identity. Commands are served
//! one at a time, in arrival order.

use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vault_core::{RecordStore, TagCatalog, TenantId, VaultError};

use crate::bridge::TenantBridge;
use crate::protocol::{AppInfo, Command};

/// Commands buffered per context before senders wait
const CHANNEL_CAPACITY: usize = 64;

/// Routes tenant commands to the record store and tag catalog
#[derive(Clone)]
pub struct BridgeHost {
    store: Arc<RecordStore>,
    tags: Arc<TagCatalog>,
    app_info: AppInfo,
}

/// Host-held handle that binds a context to its tenant. Consumed on use, so a
/// context's identity is set at most once.
pub struct ContextBinding {
    identity: Arc<OnceLock<TenantId>>,
}

impl ContextBinding {
    pub fn establish(self, tenant: TenantId) {
        debug!("bridge: context established for tenant={}", tenant);
        if self.identity.set(tenant).is_err() {
            warn!("bridge: context identity was already established");
        }
    }
}

impl BridgeHost {
    pub fn new(store: Arc<RecordStore>, tags: Arc<TagCatalog>) -> Self {
        Self {
            store,
            tags,
            app_info: AppInfo {
                platform: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Open a context whose identity is not yet known. Commands sent before
    /// [`ContextBinding::establish`] fail with `TenantNotReady`.
    pub fn open_context(&self) -> (ContextBinding, TenantBridge) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let identity = Arc::new(OnceLock::new());

        let server = ContextServer {
            store: self.store.clone(),
            tags: self.tags.clone(),
            app_info: self.app_info.clone(),
            identity: identity.clone(),
        };
        tokio::spawn(server.run(rx));

        (ContextBinding { identity }, TenantBridge::new(tx))
    }

    /// Open a context already bound to `tenant`
    pub fn attach(&self, tenant: TenantId) -> TenantBridge {
        let (binding, bridge) = self.open_context();
        binding.establish(tenant);
        bridge
    }
}

struct ContextServer {
    store: Arc<RecordStore>,
    tags: Arc<TagCatalog>,
    app_info: AppInfo,
    identity: Arc<OnceLock<TenantId>>,
}

impl ContextServer {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            let Some(tenant) = self.identity.get() else {
                debug!("bridge::{} rejected: tenant not ready", command.name());
                command.reject(VaultError::TenantNotReady);
                continue;
            };
            self.handle(tenant, command).await;
        }
        if let Some(tenant) = self.identity.get() {
            debug!("bridge: context closed for tenant={}", tenant);
        }
    }

    // Send failures only mean the tenant dropped its reply receiver
    async fn handle(&self, tenant: &TenantId, command: Command) {
        match command {
            Command::SetItem { key, value, reply } => {
                debug!("bridge::set_item tenant={} key={}", tenant, key);
                let _ = reply.send(self.store.write(tenant, &key, &value).await);
            }
            Command::GetItem { key, reply } => {
                debug!("bridge::get_item tenant={} key={}", tenant, key);
                let result = self.store.read(tenant, &key).await.map(|r| r.map(|r| r.value));
                let _ = reply.send(result);
            }
            Command::GetAllKeys { reply } => {
                debug!("bridge::get_all_keys tenant={}", tenant);
                let _ = reply.send(self.store.list_keys(tenant).await);
            }
            Command::GetAllData { reply } => {
                debug!("bridge::get_all_data tenant={}", tenant);
                let _ = reply.send(self.store.read_all(tenant).await);
            }
            Command::RemoveItem { key, reply } => {
                debug!("bridge::remove_item tenant={} key={}", tenant, key);
                let _ = reply.send(self.store.delete(tenant, &key).await);
            }
            Command::Clear { reply } => {
                debug!("bridge::clear tenant={}", tenant);
                let _ = reply.send(self.store.clear(tenant).await);
            }
            Command::HasItem { key, reply } => {
                debug!("bridge::has_item tenant={} key={}", tenant, key);
                let _ = reply.send(Ok(self.store.exists(tenant, &key).await));
            }
            Command::GetStorageInfo { reply } => {
                debug!("bridge::get_storage_info tenant={}", tenant);
                let _ = reply.send(self.store.stats(tenant).await);
            }
            Command::TagsGetAll { reply } => {
                debug!("bridge::tags_get_all tenant={}", tenant);
                let _ = reply.send(Ok(self.tags.list().await));
            }
            Command::TagsCreate { draft, reply } => {
                debug!("bridge::tags_create tenant={} name={}", tenant, draft.name);
                let _ = reply.send(self.tags.create(draft, Some(tenant.clone())).await);
            }
            Command::TenantId { reply } => {
                let _ = reply.send(Ok(tenant.clone()));
            }
            Command::AppInfo { reply } => {
                let _ = reply.send(Ok(self.app_info.clone()));
            }
        }
    }
}
