//! Host-owned tag catalog shared by all tenants.
//!
//! Stored as a single `tags.json` document. Mutations are applied to a copy,
//! persisted, and only then swapped in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::persist::write_atomic;
use crate::types::{DeleteOutcome, TenantId};

pub const DEFAULT_TAG_COLOR: &str = "#3B82F6";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: u64,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tenant that created the tag, `None` for host-created tags
    #[serde(default)]
    pub created_by: Option<TenantId>,
}

/// Fields supplied when creating or importing a tag
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagDraft {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Result of importing one draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImportOutcome {
    Created { id: u64, name: String },
    Skipped { name: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagFile {
    next_id: u64,
    tags: Vec<Tag>,
}

impl TagFile {
    fn name_taken(&self, name: &str, except: Option<u64>) -> bool {
        self.tags.iter().any(|t| t.name == name && Some(t.id) != except)
    }

    fn insert(&mut self, draft: TagDraft, created_by: Option<TenantId>) -> Result<Tag> {
        let name = normalize_name(&draft.name)?;
        if self.name_taken(&name, None) {
            return Err(VaultError::TagConflict(name));
        }
        self.next_id += 1;
        let now = Utc::now();
        let tag = Tag {
            id: self.next_id,
            name,
            color: draft.color.unwrap_or_else(|| DEFAULT_TAG_COLOR.to_string()),
            description: draft.description,
            created_at: now,
            updated_at: now,
            created_by,
        };
        self.tags.push(tag.clone());
        Ok(tag)
    }
}

pub struct TagCatalog {
    path: PathBuf,
    state: Mutex<TagFile>,
}

impl TagCatalog {
    /// Open the catalog at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TagFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, state: Mutex::new(state) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, file: &TagFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(file)?).await
    }

    /// All tags sorted by name
    pub async fn list(&self) -> Vec<Tag> {
        let mut tags = self.state.lock().await.tags.clone();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        tags
    }

    pub async fn get(&self, id: u64) -> Result<Tag> {
        self.state
            .lock()
            .await
            .tags
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or(VaultError::TagNotFound(id))
    }

    pub async fn create(&self, draft: TagDraft, created_by: Option<TenantId>) -> Result<Tag> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let tag = next.insert(draft, created_by)?;
        self.save(&next).await?;
        *state = next;
        debug!("Created tag {} '{}'", tag.id, tag.name);
        Ok(tag)
    }

    pub async fn update(&self, id: u64, update: TagUpdate) -> Result<Tag> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();

        let name = match update.name.as_deref() {
            Some(name) => Some(normalize_name(name)?),
            None => None,
        };
        if let Some(name) = &name {
            if next.name_taken(name, Some(id)) {
                return Err(VaultError::TagConflict(name.clone()));
            }
        }

        let tag = next
            .tags
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(VaultError::TagNotFound(id))?;
        if let Some(name) = name {
            tag.name = name;
        }
        if let Some(color) = update.color {
            tag.color = color;
        }
        if update.description.is_some() {
            tag.description = update.description;
        }
        tag.updated_at = Utc::now();
        let tag = tag.clone();

        self.save(&next).await?;
        *state = next;
        Ok(tag)
    }

    pub async fn delete(&self, id: u64) -> Result<DeleteOutcome> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let before = next.tags.len();
        next.tags.retain(|t| t.id != id);
        if next.tags.len() == before {
            return Ok(DeleteOutcome { deleted: false });
        }
        self.save(&next).await?;
        *state = next;
        Ok(DeleteOutcome { deleted: true })
    }

    /// Create every draft whose name is not yet in the catalog. Invalid or
    /// duplicate drafts are reported as skipped. One write for the batch.
    pub async fn import(&self, created_by: Option<TenantId>, drafts: Vec<TagDraft>) -> Result<Vec<ImportOutcome>> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();

        let mut outcomes = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let name = draft.name.clone();
            match next.insert(draft, created_by.clone()) {
                Ok(tag) => outcomes.push(ImportOutcome::Created { id: tag.id, name: tag.name }),
                Err(e) => outcomes.push(ImportOutcome::Skipped { name, reason: e.to_string() }),
            }
        }

        let created = outcomes
            .iter()
            .filter(|o| matches!(o, ImportOutcome::Created { .. }))
            .count();
        if created > 0 {
            self.save(&next).await?;
            *state = next;
        }
        info!("Imported {} of {} tag(s)", created, outcomes.len());
        Ok(outcomes)
    }
}

fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VaultError::InvalidTag("name must not be empty".to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn draft(name: &str) -> TagDraft {
        TagDraft { name: name.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_create_and_list_sorted() {
        let dir = TempDir::new().unwrap();
        let catalog = TagCatalog::open(dir.path().join("tags.json")).await.unwrap();

        catalog.create(draft("Work"), None).await.unwrap();
        let personal = catalog
            .create(draft("Personal"), Some(TenantId::new("notes").unwrap()))
            .await
            .unwrap();
        assert_eq!(personal.color, DEFAULT_TAG_COLOR);
        assert_eq!(personal.created_by.as_ref().map(|t| t.as_str()), Some("notes"));

        let names: Vec<_> = catalog.list().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Personal", "Work"]);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let dir = TempDir::new().unwrap();
        let catalog = TagCatalog::open(dir.path().join("tags.json")).await.unwrap();
        catalog.create(draft("Work"), None).await.unwrap();

        assert!(matches!(
            catalog.create(draft(" Work "), None).await,
            Err(VaultError::TagConflict(_))
        ));
        // Case-sensitive
        assert!(catalog.create(draft("work"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let dir = TempDir::new().unwrap();
        let catalog = TagCatalog::open(dir.path().join("tags.json")).await.unwrap();
        let a = catalog.create(draft("A"), None).await.unwrap();
        catalog.create(draft("B"), None).await.unwrap();

        let updated = catalog
            .update(a.id, TagUpdate { color: Some("#10b981".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(updated.color, "#10b981");
        assert_eq!(updated.name, "A");

        assert!(matches!(
            catalog.update(a.id, TagUpdate { name: Some("B".into()), ..Default::default() }).await,
            Err(VaultError::TagConflict(_))
        ));
        assert!(matches!(
            catalog.update(999, TagUpdate::default()).await,
            Err(VaultError::TagNotFound(999))
        ));

        assert!(catalog.delete(a.id).await.unwrap().deleted);
        assert!(!catalog.delete(a.id).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_import_reports_each_draft() {
        let dir = TempDir::new().unwrap();
        let catalog = TagCatalog::open(dir.path().join("tags.json")).await.unwrap();
        catalog.create(draft("Urgent"), None).await.unwrap();

        let outcomes = catalog
            .import(
                Some(TenantId::new("todo").unwrap()),
                vec![draft("Urgent"), draft("Shopping"), draft("  ")],
            )
            .await
            .unwrap();

        assert!(matches!(outcomes[0], ImportOutcome::Skipped { .. }));
        assert!(matches!(outcomes[1], ImportOutcome::Created { .. }));
        assert!(matches!(outcomes[2], ImportOutcome::Skipped { .. }));
        assert_eq!(catalog.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_catalog_persists_ids_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.json");
        let first = {
            let catalog = TagCatalog::open(&path).await.unwrap();
            let tag = catalog.create(draft("A"), None).await.unwrap();
            catalog.delete(tag.id).await.unwrap();
            tag.id
        };

        let catalog = TagCatalog::open(&path).await.unwrap();
        let second = catalog.create(draft("B"), None).await.unwrap();
        assert!(second.id > first, "ids are never reused");
    }
}
