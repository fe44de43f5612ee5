//! Bridge isolation and identity tests

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, RwLock};
use tempfile::TempDir;
use tenant_bridge::{BridgeError, BridgeHost};
use vault_core::{
    AeadAlgorithm, CipherCodec, KeyManager, RecordStore, TagCatalog, TagDraft, TenantId, VaultError,
};

async fn host(dir: &TempDir) -> BridgeHost {
    let keys = KeyManager::open(dir.path().join("encryption-config.json"), 1_000).unwrap();
    let codec = CipherCodec::new(Arc::new(RwLock::new(keys)), AeadAlgorithm::default());
    let store = RecordStore::new(dir.path().join("records"), codec);
    store.initialize().await.unwrap();
    let tags = TagCatalog::open(dir.path().join("tags.json")).await.unwrap();
    BridgeHost::new(Arc::new(store), Arc::new(tags))
}

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

#[tokio::test]
async fn test_commands_before_establish_are_rejected() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let (binding, bridge) = host.open_context();

    let err = bridge.get_item("k").await.unwrap_err();
    assert!(matches!(err, BridgeError::Vault(VaultError::TenantNotReady)));
    assert!(bridge.tenant_id().await.is_err());

    binding.establish(tenant("notes"));
    assert_eq!(bridge.tenant_id().await.unwrap(), tenant("notes"));
    assert!(bridge.get_item("k").await.unwrap().is_none());
}

#[tokio::test]
async fn test_contexts_cannot_see_each_other() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let notes = host.attach(tenant("notes"));
    let todo = host.attach(tenant("todo"));

    notes.set_item("shared-name", json!("from notes")).await.unwrap();
    todo.set_item("shared-name", json!("from todo")).await.unwrap();

    assert_eq!(notes.get_item("shared-name").await.unwrap(), Some(json!("from notes")));
    assert_eq!(todo.get_item("shared-name").await.unwrap(), Some(json!("from todo")));

    todo.clear().await.unwrap();
    assert!(notes.has_item("shared-name").await.unwrap());
    assert!(!todo.has_item("shared-name").await.unwrap());
}

#[tokio::test]
async fn test_path_like_keys_stay_in_namespace() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let notes = host.attach(tenant("notes"));
    let todo = host.attach(tenant("todo"));

    todo.set_item("secret", json!(1)).await.unwrap();
    assert!(notes.get_item("../todo/secret").await.unwrap().is_none());
    notes.set_item("../todo/secret", json!(2)).await.unwrap();

    assert_eq!(todo.get_item("secret").await.unwrap(), Some(json!(1)));
    assert_eq!(notes.get_all_keys().await.unwrap(), vec!["../todo/secret"]);
}

#[tokio::test]
async fn test_storage_info_and_delete() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let bridge = host.attach(tenant("notes"));

    bridge.set_item("a", json!({"x": 1})).await.unwrap();
    bridge.set_item("b", json!([1, 2, 3])).await.unwrap();

    let info = bridge.get_storage_info().await.unwrap();
    assert_eq!(info.tenant_id, tenant("notes"));
    assert_eq!(info.total_keys, 2);

    assert!(bridge.remove_item("a").await.unwrap().deleted);
    assert!(!bridge.remove_item("a").await.unwrap().deleted);
    assert_eq!(bridge.clear().await.unwrap().deleted_count, 1);
}

#[tokio::test]
async fn test_invalid_key_is_reported() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let bridge = host.attach(tenant("notes"));

    let err = bridge.set_item("", json!(1)).await.unwrap_err();
    assert!(matches!(err, BridgeError::Vault(VaultError::InvalidKey(_))));
}

#[tokio::test]
async fn test_typed_json_helpers() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        font_size: u32,
    }

    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let bridge = host.attach(tenant("notes"));

    let settings = Settings { theme: "dark".into(), font_size: 14 };
    bridge.set_json("settings", &settings).await.unwrap();
    assert_eq!(bridge.get_json::<Settings>("settings").await.unwrap(), Some(settings));
    assert!(bridge.get_json::<Settings>("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_tags_are_shared_and_attributed() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let notes = host.attach(tenant("notes"));
    let todo = host.attach(tenant("todo"));

    let tag = notes
        .tags_create(TagDraft { name: "Ideas".into(), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(tag.created_by, Some(tenant("notes")));

    let seen: Vec<_> = todo.tags_get_all().await.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(seen, vec!["Ideas"]);

    let err = todo
        .tags_create(TagDraft { name: "Ideas".into(), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Vault(VaultError::TagConflict(_))));
}

#[tokio::test]
async fn test_app_info() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let info = host.attach(tenant("notes")).app_info().await.unwrap();
    assert_eq!(info.platform, std::env::consts::OS);
    assert!(!info.version.is_empty());
}

#[tokio::test]
async fn test_get_all_data_returns_records_with_metadata() {
    let dir = TempDir::new().unwrap();
    let host = host(&dir).await;
    let bridge = host.attach(tenant("notes"));

    let receipt = bridge.set_item("draft", json!({"title": "hi"})).await.unwrap();
    let all = bridge.get_all_data().await.unwrap();

    assert_eq!(all.len(), 1);
    let record = &all["draft"];
    assert_eq!(record.value, json!({"title": "hi"}));
    assert_eq!(record.timestamp, receipt.timestamp);
    assert_eq!(record.tenant_id, tenant("notes"));
}
