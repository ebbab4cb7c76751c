// Program registration surface.
//
// The host's program-management UI reads this: one global entry for the
// deployment tool plus one entry per installed site. Display versions are
// normalized to three numeric components before they land here.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{write_atomic, StoreError, StoreResult};
use crate::utils::validation::{normalize_display_version, site_slug};

pub const TOOL_PROGRAM_KEY: &str = "shopserve-installer";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramEntry {
    pub display_name: String,
    pub display_version: String,
    pub publisher: String,
    pub install_location: String,
    pub modify_command: String,
    pub uninstall_command: String,
}

impl ProgramEntry {
    /// Per-instance entry for an installed site.
    pub fn for_site(site_name: &str, version: &str, install_path: &str) -> Self {
        Self {
            display_name: format!("ShopServe ({})", site_name),
            display_version: normalize_display_version(version),
            publisher: "ShopServe".to_string(),
            install_location: install_path.to_string(),
            modify_command: format!("shopserve-installer --maintain {}", site_name),
            uninstall_command: format!("shopserve-installer --uninstall --site {}", site_name),
        }
    }
}

pub fn site_program_key(site_name: &str) -> String {
    format!("shopserve-site-{}", site_slug(site_name))
}

#[derive(Debug, Clone)]
pub struct ProgramRegistry {
    path: PathBuf,
}

impl ProgramRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn load(&self) -> StoreResult<BTreeMap<String, ProgramEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            source: e,
        })
    }

    pub async fn register(&self, key: &str, entry: ProgramEntry) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let mut entries = self.load().await?;
        entries.insert(key.to_string(), entry);
        self.save(&entries).await?;

        debug!(
            "[PHASE: store] [STEP: programs] Registered program entry (key={})",
            key
        );
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.load().await?;
        let removed = entries.remove(key).is_some();
        if removed {
            self.save(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.load().await?.contains_key(key))
    }

    async fn save(&self, entries: &BTreeMap<String, ProgramEntry>) -> StoreResult<()> {
        let body = serde_json::to_vec_pretty(entries).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &body).await
    }
}
