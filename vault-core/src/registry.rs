//! Tenant registry: built-in and installed miniapps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Result, VaultError};
use crate::types::TenantId;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENTRY_FILE: &str = "index.html";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub icon: Option<String>,
    /// Directory holding the tenant's content
    pub path: PathBuf,
    #[serde(default)]
    pub built_in: bool,
}

/// `manifest.json` as found in an install directory
#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    icon: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A tenant resolved for launch
#[derive(Debug, Clone, PartialEq)]
pub enum Tenant {
    /// Content entry point exists
    Installed { manifest: Manifest, entry: PathBuf },
    /// No entry point; the host renders [`Tenant::template_html`] instead
    Missing { manifest: Manifest },
}

impl Tenant {
    pub fn manifest(&self) -> &Manifest {
        match self {
            Tenant::Installed { manifest, .. } | Tenant::Missing { manifest } => manifest,
        }
    }

    pub fn id(&self) -> &TenantId {
        &self.manifest().id
    }

    /// Placeholder page for a tenant without content
    pub fn template_html(&self) -> String {
        let manifest = self.manifest();
        format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{name}</title></head>\n\
             <body>\n<h1>{name}</h1>\n<p>{description}</p>\n</body>\n</html>\n",
            name = escape_html(&manifest.name),
            description = escape_html(&manifest.description),
        )
    }
}

pub struct TenantRegistry {
    content_root: PathBuf,
    tenants: RwLock<BTreeMap<TenantId, Manifest>>,
}

impl TenantRegistry {
    /// Registry pre-populated with the built-in tenants, whose content lives
    /// under `content_root/<id>`.
    pub fn new(content_root: impl Into<PathBuf>) -> Result<Self> {
        let content_root = content_root.into();
        let builtins = [
            ("notes", "Notes", "Simple note-taking app", "📝"),
            ("calculator", "Calculator", "Basic calculator", "🧮"),
            ("todo", "Todo List", "Task management app", "✅"),
        ];

        let mut tenants = BTreeMap::new();
        for (id, name, description, icon) in builtins {
            let id = TenantId::new(id)?;
            tenants.insert(
                id.clone(),
                Manifest {
                    path: content_root.join(id.as_str()),
                    id,
                    name: name.to_string(),
                    description: description.to_string(),
                    version: default_version(),
                    icon: Some(icon.to_string()),
                    built_in: true,
                },
            );
        }

        Ok(Self {
            content_root,
            tenants: RwLock::new(tenants),
        })
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub async fn list(&self) -> Vec<Manifest> {
        self.tenants.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &TenantId) -> Option<Manifest> {
        self.tenants.read().await.get(id).cloned()
    }

    /// Register the tenant described by `<dir>/manifest.json`. A manifest
    /// without an id gets a generated one. Re-installing an id replaces it.
    pub async fn install(&self, dir: impl AsRef<Path>) -> Result<Manifest> {
        let dir = dir.as_ref();
        let bytes = tokio::fs::read(dir.join(MANIFEST_FILE)).await.map_err(|e| {
            VaultError::InvalidManifest(format!("cannot read {}: {}", dir.join(MANIFEST_FILE).display(), e))
        })?;
        let file: ManifestFile =
            serde_json::from_slice(&bytes).map_err(|e| VaultError::InvalidManifest(e.to_string()))?;

        let id = match file.id {
            Some(id) => TenantId::new(id)?,
            None => TenantId::new(uuid::Uuid::new_v4().to_string())?,
        };
        let manifest = Manifest {
            id: id.clone(),
            name: file.name,
            description: file.description,
            version: file.version,
            icon: file.icon,
            path: dir.to_path_buf(),
            built_in: false,
        };

        let previous = self.tenants.write().await.insert(id.clone(), manifest.clone());
        if previous.is_some() {
            warn!("Reinstalled tenant {} from {}", id, dir.display());
        } else {
            info!("Installed tenant {} from {}", id, dir.display());
        }
        Ok(manifest)
    }

    /// Resolve `id` for launch, checking once whether its entry point exists
    pub async fn launch(&self, id: &TenantId) -> Result<Tenant> {
        let manifest = self
            .get(id)
            .await
            .ok_or_else(|| VaultError::TenantNotFound(id.to_string()))?;

        let entry = manifest.path.join(ENTRY_FILE);
        match tokio::fs::metadata(&entry).await {
            Ok(meta) if meta.is_file() => Ok(Tenant::Installed { manifest, entry }),
            _ => {
                warn!("Tenant {} has no {}; using template", id, ENTRY_FILE);
                Ok(Tenant::Missing { manifest })
            }
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
