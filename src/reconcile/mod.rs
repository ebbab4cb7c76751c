// Installation-state reconciliation.
//
// Enumerates every instance by scanning both store views, de-duplicates by
// install path, resolves each instance's database connection through a
// priority chain (encrypted descriptor, then legacy plaintext record
// fields, then the legacy settings file), and optionally probes the live
// database for health statistics under a fixed timeout. Failure analyzing
// one instance never aborts enumeration of the others.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

use crate::database::{ConnectionDescriptor, DatabaseAdmin};
use crate::models::ExistingInstallation;
use crate::process::CommandRunner;
use crate::security::SecretCodec;
use crate::store::{ConfigStore, InstanceRecord, StoreView};
use crate::utils::path_resolver::DeployerPaths;

/// Whole-probe budget; detection must not hang on an unreachable instance.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve an instance's database connection through the fallback chain:
/// encrypted descriptor in the record (preferred), legacy plaintext record
/// fields, then the legacy settings file under the install path. Stops at
/// the first source yielding a parseable server+database pair.
pub async fn resolve_connection(
    record: &InstanceRecord,
    secrets: &SecretCodec,
    install_path: Option<&str>,
) -> Option<ConnectionDescriptor> {
    if let Some(blob) = &record.connection {
        match secrets.decrypt(blob).await {
            Ok(plain) => {
                if let Some(descriptor) = ConnectionDescriptor::parse(&plain) {
                    return Some(descriptor);
                }
                debug!(
                    "[PHASE: reconcile] [STEP: resolve] Encrypted descriptor present but not parseable (site={})",
                    record.site_name
                );
            }
            Err(e) => {
                warn!(
                    "[PHASE: reconcile] [STEP: resolve] Could not decrypt descriptor (site={}, err={})",
                    record.site_name, e
                );
            }
        }
    }

    if let (Some(server), Some(database)) = (&record.db_server, &record.db_name) {
        return Some(ConnectionDescriptor {
            server: server.clone(),
            database: database.clone(),
            user: record.db_user.clone(),
            password: record.db_password.clone(),
        });
    }
    if let Some(raw) = record
        .extra
        .get("dataConnectionString")
        .and_then(|v| v.as_str())
    {
        if let Some(descriptor) = ConnectionDescriptor::parse(raw) {
            return Some(descriptor);
        }
    }

    // Oldest fallback: the deployment-time settings file.
    if let Some(install_path) = install_path {
        if let Some(descriptor) = read_settings_descriptor(Path::new(install_path)).await {
            return Some(descriptor);
        }
    }

    None
}

/// Parse `DataConnectionString:` out of `App_Data/settings.txt`.
async fn read_settings_descriptor(install_path: &Path) -> Option<ConnectionDescriptor> {
    let settings_path = install_path.join("App_Data").join("settings.txt");
    let content = tokio::fs::read_to_string(&settings_path).await.ok()?;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("DataConnectionString") {
            return ConnectionDescriptor::parse(value.trim());
        }
    }
    None
}

pub struct Reconciler {
    store: ConfigStore,
    secrets: Arc<SecretCodec>,
    runner: Arc<dyn CommandRunner>,
}

impl Reconciler {
    pub fn new(paths: &DeployerPaths, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store: ConfigStore::new(&paths.store_root, &paths.legacy_store_root),
            secrets: Arc::new(SecretCodec::new(paths.master_key_file())),
            runner,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Enumerate and analyze every instance from both store views.
    ///
    /// Partial results instead of propagated failures: an instance whose
    /// analysis fails is returned unhealthy with the error recorded.
    pub async fn detect_all(&self) -> Vec<ExistingInstallation> {
        let mut site_keys: Vec<String> = Vec::new();
        for view in [StoreView::Primary, StoreView::Legacy] {
            match self.store.list_sites(view).await {
                Ok(sites) => {
                    for site in sites {
                        if !site_keys.iter().any(|s| s.eq_ignore_ascii_case(&site)) {
                            site_keys.push(site);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "[PHASE: reconcile] [STEP: enumerate] Could not list {:?} view: {}",
                        view, e
                    );
                }
            }
        }

        info!(
            "[PHASE: reconcile] [STEP: enumerate] {} candidate instance(s) across views",
            site_keys.len()
        );

        let mut seen_paths: HashSet<String> = HashSet::new();
        let mut out: Vec<ExistingInstallation> = Vec::new();

        for site in site_keys {
            let view = match self.analyze_site(&site).await {
                Ok(view) => view,
                Err(e) => {
                    warn!(
                        "[PHASE: reconcile] [STEP: analyze] Analysis failed (site={}, err={:#})",
                        site, e
                    );
                    let mut broken = ExistingInstallation::unknown(&site);
                    broken.issues.push(format!("analysis failed: {:#}", e));
                    broken
                }
            };

            // De-duplicate by install path: the same instance registered in
            // both views must appear once.
            if let Some(path) = &view.install_path {
                if !seen_paths.insert(path.clone()) {
                    debug!(
                        "[PHASE: reconcile] [STEP: enumerate] Duplicate install path {:?} (site={}); skipping",
                        path, view.site_name
                    );
                    continue;
                }
            }
            out.push(view);
        }

        out
    }

    /// Analyze a single known instance. `Ok(None)` when no record exists.
    pub async fn detect_one(&self, site_name: &str) -> Result<Option<ExistingInstallation>> {
        if self.store.load_instance(site_name).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.analyze_site(site_name).await?))
    }

    async fn analyze_site(&self, site_name: &str) -> Result<ExistingInstallation> {
        let record = self
            .store
            .load_instance(site_name)
            .await
            .with_context(|| format!("Could not read store entry for '{}'", site_name))?
            .with_context(|| format!("Store entry for '{}' vanished during analysis", site_name))?;

        let mut view = ExistingInstallation::unknown(&record.site_name);
        view.install_path = record.install_path.clone();
        view.version = record.product_version.clone();
        view.company_name = record.company_name.clone();
        view.web_url = record.web_url.clone();
        view.port = record.port;

        if let Some(path) = &view.install_path {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                view.issues
                    .push(format!("install path {} is missing on disk", path));
            }
        } else {
            view.issues.push("no install path recorded".to_string());
        }

        let descriptor =
            resolve_connection(&record, &self.secrets, record.install_path.as_deref()).await;

        match descriptor {
            None => {
                view.issues
                    .push("no database connection descriptor could be resolved".to_string());
            }
            Some(descriptor) => {
                view.db_server = Some(descriptor.server.clone());
                view.db_name = Some(descriptor.database.clone());

                let admin = DatabaseAdmin::new(self.runner.as_ref());
                match timeout(PROBE_TIMEOUT, admin.probe_health(&descriptor)).await {
                    Ok(health) => {
                        view.has_database = health.has_database;
                        view.product_count = health.product_count;
                        view.order_count = health.order_count;
                        view.user_count = health.user_count;

                        if !health.has_database {
                            view.issues.push(format!(
                                "database '{}' on '{}' is absent or unreachable",
                                descriptor.database, descriptor.server
                            ));
                        } else {
                            if health.product_count < 0
                                || health.order_count < 0
                                || health.user_count < 0
                            {
                                view.issues
                                    .push("one or more statistics queries failed".to_string());
                            }

                            // Merge policy: store fields win; probe-derived
                            // values only fill gaps.
                            if view.company_name.is_none() {
                                view.company_name =
                                    admin.probe_company_name(&descriptor).await;
                            }
                        }
                    }
                    Err(_elapsed) => {
                        // Timeout wins the race; the probe's eventual result
                        // is discarded and only this instance degrades.
                        view.has_database = false;
                        view.issues.push(format!(
                            "health probe timed out after {}s",
                            PROBE_TIMEOUT.as_secs()
                        ));
                    }
                }
            }
        }

        view.healthy = view.issues.is_empty();
        Ok(view)
    }
}
