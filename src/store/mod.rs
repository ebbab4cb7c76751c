// Configuration store accessor
//
// Persistent, hierarchical, per-instance key-value store, keyed by site
// name. One JSON document per instance under `<root>/instances/`, plus the
// `programs.json` registration surface (see `programs.rs`).
//
// Two storage views exist: the primary root and the legacy root used by
// pre-2.x releases. Reads consult both so older instances are never missed;
// writes always land in the primary view. Removing an instance deletes only
// that instance's documents, never the shared `instances/` parent, so
// sibling instances are preserved.

pub mod programs;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::utils::validation::site_slug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store document at {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which storage view to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreView {
    Primary,
    Legacy,
}

/// One installed site, as persisted.
///
/// `schema_version` is the migration high-water mark: it equals the highest
/// migration version successfully applied and never regresses. A record
/// without it is a legacy (pre-versioning) instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub site_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<DateTime<Utc>>,
    /// Encrypted connection descriptor (opaque `ENCv1:` blob).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    // Legacy plaintext connection fields, removed by the hardening migration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_password: Option<String>,
    /// Anything older releases wrote that this release does not model.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl InstanceRecord {
    pub fn new(site_name: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
    legacy_root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>, legacy_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            legacy_root: legacy_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instances_dir(&self, view: StoreView) -> PathBuf {
        match view {
            StoreView::Primary => self.root.join("instances"),
            StoreView::Legacy => self.legacy_root.join("instances"),
        }
    }

    fn record_path(&self, view: StoreView, site_name: &str) -> PathBuf {
        self.instances_dir(view)
            .join(format!("{}.json", site_slug(site_name)))
    }

    /// Load one instance record from a specific view.
    pub async fn load_instance_from(
        &self,
        view: StoreView,
        site_name: &str,
    ) -> StoreResult<Option<InstanceRecord>> {
        let path = self.record_path(view, site_name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        let record: InstanceRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                path,
                source: e,
            })?;
        Ok(Some(record))
    }

    /// Load one instance record, preferring the primary view.
    pub async fn load_instance(&self, site_name: &str) -> StoreResult<Option<InstanceRecord>> {
        if let Some(rec) = self.load_instance_from(StoreView::Primary, site_name).await? {
            return Ok(Some(rec));
        }
        self.load_instance_from(StoreView::Legacy, site_name).await
    }

    /// Persist an instance record into the primary view (atomic write).
    pub async fn save_instance(&self, record: &InstanceRecord) -> StoreResult<()> {
        let dir = self.instances_dir(StoreView::Primary);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io {
                path: dir.clone(),
                source: e,
            })?;

        let path = self.record_path(StoreView::Primary, &record.site_name);
        let body = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            source: e,
        })?;
        write_atomic(&path, &body).await?;

        debug!(
            "[PHASE: store] [STEP: save_instance] Saved instance record (site={}, schema_version={:?})",
            record.site_name, record.schema_version
        );
        Ok(())
    }

    /// Remove an instance's documents from both views.
    ///
    /// Only the per-site files are deleted; the shared `instances/` parent is
    /// left in place for sibling instances.
    pub async fn remove_instance(&self, site_name: &str) -> StoreResult<bool> {
        let mut removed = false;
        for view in [StoreView::Primary, StoreView::Legacy] {
            let path = self.record_path(view, site_name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io { path, source: e }),
            }
        }
        Ok(removed)
    }

    /// Enumerate site names registered in one view.
    pub async fn list_sites(&self, view: StoreView) -> StoreResult<Vec<String>> {
        let dir = self.instances_dir(view);
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io { path: dir, source: e }),
        };

        let mut sites = Vec::new();
        while let Some(ent) = rd.next_entry().await.map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })? {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                sites.push(stem.to_string());
            }
        }
        sites.sort();
        Ok(sites)
    }

    /// True when any instance record exists in either view.
    pub async fn any_instance_exists(&self) -> StoreResult<bool> {
        for view in [StoreView::Primary, StoreView::Legacy] {
            if !self.list_sites(view).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Current schema version for a site. Absent record, or a record without
    /// the version marker, reads as 0.
    pub async fn get_schema_version(&self, site_name: &str) -> StoreResult<u32> {
        Ok(self
            .load_instance(site_name)
            .await?
            .and_then(|r| r.schema_version)
            .unwrap_or(0))
    }

    /// Persist a new schema version for a site.
    ///
    /// The record is re-saved into the primary view, which also promotes
    /// legacy-view records on their first migration.
    pub async fn set_schema_version(&self, site_name: &str, version: u32) -> StoreResult<()> {
        let mut record = self
            .load_instance(site_name)
            .await?
            .unwrap_or_else(|| InstanceRecord::new(site_name));
        record.schema_version = Some(version);
        record.migrated_at = Some(Utc::now());
        self.save_instance(&record).await
    }

    pub fn program_registry(&self) -> programs::ProgramRegistry {
        programs::ProgramRegistry::new(self.root.join("programs.json"))
    }
}

/// Write a store document atomically (temp file + rename).
pub(crate) async fn write_atomic(path: &Path, body: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| StoreError::Io {
            path: tmp.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::new(dir.join("store"), dir.join("store-legacy"))
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        let mut rec = InstanceRecord::new("DemoShop");
        rec.install_path = Some("/srv/shops/demoshop".to_string());
        rec.port = Some(8080);
        rec.schema_version = Some(2);
        store.save_instance(&rec).await.expect("save");

        let back = store
            .load_instance("DemoShop")
            .await
            .expect("load")
            .expect("record present");
        assert_eq!(back.site_name, "DemoShop");
        assert_eq!(back.port, Some(8080));
        assert_eq!(back.schema_version, Some(2));
    }

    #[tokio::test]
    async fn legacy_view_is_consulted_on_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        // Plant a record only in the legacy view.
        let legacy_store = ConfigStore::new(tmp.path().join("store-legacy"), tmp.path().join("nowhere"));
        let mut rec = InstanceRecord::new("OldShop");
        rec.install_path = Some("/srv/shops/oldshop".to_string());
        legacy_store.save_instance(&rec).await.expect("save legacy");

        let found = store.load_instance("OldShop").await.expect("load");
        assert!(found.is_some());
        assert_eq!(
            store.get_schema_version("OldShop").await.expect("version"),
            0,
            "legacy record without marker reads as version 0"
        );
    }

    #[tokio::test]
    async fn set_schema_version_promotes_legacy_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        let legacy_store = ConfigStore::new(tmp.path().join("store-legacy"), tmp.path().join("nowhere"));
        legacy_store
            .save_instance(&InstanceRecord::new("OldShop"))
            .await
            .expect("save legacy");

        store.set_schema_version("OldShop", 1).await.expect("set");

        let primary = store
            .load_instance_from(StoreView::Primary, "OldShop")
            .await
            .expect("load");
        assert_eq!(primary.expect("promoted").schema_version, Some(1));
    }

    #[tokio::test]
    async fn remove_instance_preserves_siblings() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        store
            .save_instance(&InstanceRecord::new("ShopA"))
            .await
            .expect("save a");
        store
            .save_instance(&InstanceRecord::new("ShopB"))
            .await
            .expect("save b");

        assert!(store.remove_instance("ShopA").await.expect("remove"));

        let sites = store.list_sites(StoreView::Primary).await.expect("list");
        assert_eq!(sites, vec!["shopb".to_string()]);
        assert!(store.any_instance_exists().await.expect("any"));
    }

    #[tokio::test]
    async fn unknown_fields_survive_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());

        let mut rec = InstanceRecord::new("DemoShop");
        rec.extra.insert(
            "dataConnectionString".to_string(),
            serde_json::json!("server=old;database=olddb"),
        );
        store.save_instance(&rec).await.expect("save");

        let back = store
            .load_instance("DemoShop")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(
            back.extra.get("dataConnectionString"),
            Some(&serde_json::json!("server=old;database=olddb"))
        );
    }

    #[tokio::test]
    async fn missing_record_reads_as_version_zero() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_in(tmp.path());
        assert_eq!(store.get_schema_version("NoSuch").await.expect("read"), 0);
    }
}
