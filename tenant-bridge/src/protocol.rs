//! Commands a tenant context can send to the host.
//!
//! No command carries a tenant id: the host resolves identity from the
//! context the command arrived on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::oneshot;
use vault_core::{
    ClearOutcome, DeleteOutcome, Receipt, Record, StorageStats, Tag, TagDraft, TenantId, VaultError,
};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, VaultError>>;

/// Host environment reported to tenants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub platform: String,
    pub version: String,
}

pub(crate) enum Command {
    SetItem { key: String, value: serde_json::Value, reply: Reply<Receipt> },
    GetItem { key: String, reply: Reply<Option<serde_json::Value>> },
    GetAllKeys { reply: Reply<Vec<String>> },
    GetAllData { reply: Reply<BTreeMap<String, Record>> },
    RemoveItem { key: String, reply: Reply<DeleteOutcome> },
    Clear { reply: Reply<ClearOutcome> },
    HasItem { key: String, reply: Reply<bool> },
    GetStorageInfo { reply: Reply<StorageStats> },
    TagsGetAll { reply: Reply<Vec<Tag>> },
    TagsCreate { draft: TagDraft, reply: Reply<Tag> },
    TenantId { reply: Reply<TenantId> },
    AppInfo { reply: Reply<AppInfo> },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::SetItem { .. } => "set_item",
            Command::GetItem { .. } => "get_item",
            Command::GetAllKeys { .. } => "get_all_keys",
            Command::GetAllData { .. } => "get_all_data",
            Command::RemoveItem { .. } => "remove_item",
            Command::Clear { .. } => "clear",
            Command::HasItem { .. } => "has_item",
            Command::GetStorageInfo { .. } => "get_storage_info",
            Command::TagsGetAll { .. } => "tags_get_all",
            Command::TagsCreate { .. } => "tags_create",
            Command::TenantId { .. } => "tenant_id",
            Command::AppInfo { .. } => "app_info",
        }
    }

    /// Answer the command with `err` without running it
    pub(crate) fn reject(self, err: VaultError) {
        // A dropped receiver means the caller stopped waiting
        match self {
            Command::SetItem { reply, .. } => drop(reply.send(Err(err))),
            Command::GetItem { reply, .. } => drop(reply.send(Err(err))),
            Command::GetAllKeys { reply } => drop(reply.send(Err(err))),
            Command::GetAllData { reply } => drop(reply.send(Err(err))),
            Command::RemoveItem { reply, .. } => drop(reply.send(Err(err))),
            Command::Clear { reply } => drop(reply.send(Err(err))),
            Command::HasItem { reply, .. } => drop(reply.send(Err(err))),
            Command::GetStorageInfo { reply } => drop(reply.send(Err(err))),
            Command::TagsGetAll { reply } => drop(reply.send(Err(err))),
            Command::TagsCreate { reply, .. } => drop(reply.send(Err(err))),
            Command::TenantId { reply } => drop(reply.send(Err(err))),
            Command::AppInfo { reply } => drop(reply.send(Err(err))),
        }
    }
}
