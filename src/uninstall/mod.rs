// Uninstall orchestration.
//
// Inverse pipeline, eight ordered stages, every one of them non-fatal by
// design: teardown always makes maximum forward progress and collects
// warnings instead of aborting. A verification pass afterwards re-checks
// each category and reports anything still present as a warning item.
//
// A second entry point removes the deployment tool itself and is blocked
// while any instance still exists.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use crate::database::{ConnectionDescriptor, DatabaseAdmin};
use crate::installation::{files, service, webserver};
use crate::models::{PipelineReport, ProgressEmitter, ProgressPayload, StepResult, UninstallRequest};
use crate::pipeline::{run_pipeline, Criticality, PipelineOptions, StageHandler, StageSpec};
use crate::process::CommandRunner;
use crate::reconcile::resolve_connection;
use crate::security::SecretCodec;
use crate::store::programs::{site_program_key, TOOL_PROGRAM_KEY};
use crate::store::{ConfigStore, InstanceRecord};
use crate::utils::locks::site_lock;
use crate::utils::path_resolver::DeployerPaths;

fn uninstall_stages() -> Vec<StageSpec> {
    let warning = Criticality::Warning;
    vec![
        StageSpec {
            name: "service",
            label: "Stopping background service",
            percent_start: 5,
            percent_done: 12,
            criticality: warning,
        },
        StageSpec {
            name: "webpool",
            label: "Stopping web application",
            percent_start: 12,
            percent_done: 24,
            criticality: warning,
        },
        StageSpec {
            name: "website",
            label: "Removing web server site",
            percent_start: 24,
            percent_done: 35,
            criticality: warning,
        },
        StageSpec {
            name: "database",
            label: "Dropping database",
            percent_start: 35,
            percent_done: 48,
            criticality: warning,
        },
        StageSpec {
            name: "app_files",
            label: "Deleting application files",
            percent_start: 48,
            percent_done: 62,
            criticality: warning,
        },
        StageSpec {
            name: "service_files",
            label: "Deleting service files",
            percent_start: 62,
            percent_done: 72,
            criticality: warning,
        },
        StageSpec {
            name: "tool_files",
            label: "Deleting deployment tool files",
            percent_start: 72,
            percent_done: 82,
            criticality: warning,
        },
        StageSpec {
            name: "registry",
            label: "Removing store entries",
            percent_start: 82,
            percent_done: 92,
            criticality: warning,
        },
    ]
}

pub struct UninstallOrchestrator {
    paths: DeployerPaths,
    store: ConfigStore,
    secrets: Arc<SecretCodec>,
    runner: Arc<dyn CommandRunner>,
}

impl UninstallOrchestrator {
    pub fn new(paths: DeployerPaths, runner: Arc<dyn CommandRunner>) -> Self {
        let store = ConfigStore::new(&paths.store_root, &paths.legacy_store_root);
        let secrets = Arc::new(SecretCodec::new(paths.master_key_file()));
        Self {
            paths,
            store,
            secrets,
            runner,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Run the uninstall pipeline for one site.
    pub async fn uninstall(
        &self,
        request: UninstallRequest,
        progress: &ProgressEmitter,
    ) -> PipelineReport {
        let lock = site_lock(&request.site_name);
        let _guard = lock.lock().await;

        info!(
            "[PHASE: uninstall] [STEP: start] Uninstalling site '{}' (remove_database={}, keep_user_data={})",
            request.site_name, request.remove_database, request.keep_user_data
        );

        let record = match self.store.load_instance(&request.site_name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return PipelineReport {
                    success: false,
                    message: format!("No installed instance named '{}'", request.site_name),
                    error: Some("instance not found in the persistent store".to_string()),
                    warnings: Vec::new(),
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                };
            }
            Err(e) => {
                return PipelineReport {
                    success: false,
                    message: format!("Could not read instance '{}'", request.site_name),
                    error: Some(format!("{:#}", e)),
                    warnings: Vec::new(),
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                };
            }
        };

        let descriptor = self.resolve_descriptor(&request, &record).await;
        let install_path = record.install_path.clone().map(PathBuf::from);

        let opts = PipelineOptions::new(request.dry_run);
        let mut ctx = UninstallContext {
            request,
            record,
            descriptor,
            install_path,
            paths: self.paths.clone(),
            store: self.store.clone(),
            runner: self.runner.clone(),
        };

        let mut report = run_pipeline(&mut ctx, &uninstall_stages(), &opts, progress).await;

        // Verification pass: re-check every category; leftovers are
        // warnings, never failures.
        if !opts.dry_run && report.success {
            let leftovers = ctx.verify_residuals().await;
            report.warnings.extend(leftovers);
            if !report.warnings.is_empty() {
                report.message = format!("Completed with {} warning(s)", report.warnings.len());
            }
        }

        progress(ProgressPayload {
            correlation_id: report.correlation_id.clone(),
            step: "verify".to_string(),
            severity: "info".to_string(),
            phase: "uninstall".to_string(),
            percent: 100,
            message: report.message.clone(),
            elapsed_ms: None,
        });

        report
    }

    /// Remove the deployment tool itself.
    ///
    /// Blocked while any instance exists: shared tooling must outlive its
    /// dependents. Returns failure without mutating anything in that case.
    pub async fn uninstall_program(&self) -> PipelineReport {
        let correlation_id = uuid::Uuid::new_v4().to_string();

        match self.store.any_instance_exists().await {
            Ok(true) => {
                return PipelineReport {
                    success: false,
                    message: "Cannot remove the deployment tool while instances exist".to_string(),
                    error: Some(
                        "uninstall all site instances first, then remove the tool".to_string(),
                    ),
                    warnings: Vec::new(),
                    correlation_id,
                };
            }
            Ok(false) => {}
            Err(e) => {
                return PipelineReport {
                    success: false,
                    message: "Could not enumerate instances".to_string(),
                    error: Some(format!("{:#}", e)),
                    warnings: Vec::new(),
                    correlation_id,
                };
            }
        }

        let mut warnings = Vec::new();

        let registry = self.store.program_registry();
        if let Err(e) = registry.remove(TOOL_PROGRAM_KEY).await {
            warnings.push(format!("tool program entry removal failed: {}", e));
        }

        // The running binary cannot delete itself; its folder goes to the
        // deferred-deletion journal instead of failing the run.
        let journal = files::PendingDeletes::new(self.paths.pending_deletes_file());
        match crate::utils::path_resolver::resolve_deployment_folder() {
            Ok(folder) => {
                if let Err(e) = journal.defer(&folder).await {
                    warnings.push(format!("could not journal tool folder for deletion: {}", e));
                }
            }
            Err(e) => warnings.push(format!("could not resolve tool folder: {}", e)),
        }

        PipelineReport {
            success: true,
            message: "Deployment tool unregistered; files scheduled for removal".to_string(),
            error: None,
            warnings,
            correlation_id,
        }
    }

    async fn resolve_descriptor(
        &self,
        request: &UninstallRequest,
        record: &InstanceRecord,
    ) -> Option<ConnectionDescriptor> {
        // Caller-supplied server+database wins; otherwise walk the record's
        // fallback chain.
        if let (Some(server), Some(database)) = (&request.db_server, &request.db_name) {
            return Some(ConnectionDescriptor {
                server: server.clone(),
                database: database.clone(),
                user: request.db_user.clone(),
                password: request.db_password.clone(),
            });
        }
        resolve_connection(record, &self.secrets, record.install_path.as_deref()).await
    }
}

struct UninstallContext {
    request: UninstallRequest,
    record: InstanceRecord,
    descriptor: Option<ConnectionDescriptor>,
    install_path: Option<PathBuf>,
    paths: DeployerPaths,
    store: ConfigStore,
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl StageHandler for UninstallContext {
    fn phase(&self) -> &'static str {
        "uninstall"
    }

    fn stage_enabled(&self, stage: &StageSpec) -> bool {
        match stage.name {
            "database" => self.request.remove_database && self.descriptor.is_some(),
            "app_files" | "service_files" | "tool_files" => self.install_path.is_some(),
            _ => true,
        }
    }

    async fn run_stage(&mut self, stage: &StageSpec) -> Result<StepResult> {
        match stage.name {
            "service" => self.stage_service().await,
            "webpool" => self.stage_webpool().await,
            "website" => self.stage_website().await,
            "database" => self.stage_database().await,
            "app_files" => self.stage_app_files().await,
            "service_files" => self.stage_service_files().await,
            "tool_files" => self.stage_tool_files().await,
            "registry" => self.stage_registry().await,
            other => anyhow::bail!("Unknown uninstall stage '{}'", other),
        }
    }
}

impl UninstallContext {
    fn journal(&self) -> files::PendingDeletes {
        files::PendingDeletes::new(self.paths.pending_deletes_file())
    }

    fn tasks_unit(&self) -> String {
        self.record
            .service_name
            .clone()
            .unwrap_or_else(|| service::tasks_unit_name(&self.request.site_name))
    }

    async fn stage_service(&mut self) -> Result<StepResult> {
        let unit = self.tasks_unit();
        service::stop_and_remove_unit(self.runner.as_ref(), &self.paths.unit_dir, &unit).await;
        Ok(StepResult::ok(format!(
            "Background service '{}' stopped and removed",
            unit
        )))
    }

    async fn stage_webpool(&mut self) -> Result<StepResult> {
        let unit = service::web_unit_name(&self.request.site_name);
        service::stop_unit(self.runner.as_ref(), &unit).await;
        Ok(StepResult::ok(format!("Web application '{}' stopped", unit)))
    }

    async fn stage_website(&mut self) -> Result<StepResult> {
        let site = &self.request.site_name;
        let removed = webserver::remove_site(
            self.runner.as_ref(),
            &self.paths.webserver_conf_dir,
            site,
        )
        .await?;

        let unit = service::web_unit_name(site);
        service::stop_and_remove_unit(self.runner.as_ref(), &self.paths.unit_dir, &unit).await;

        Ok(StepResult::ok(if removed {
            format!("Web server site for '{}' removed", site)
        } else {
            format!("No web server site for '{}' was present", site)
        }))
    }

    async fn stage_database(&mut self) -> Result<StepResult> {
        let descriptor = self
            .descriptor
            .as_ref()
            .context("No resolvable connection descriptor")?;
        let admin = DatabaseAdmin::new(self.runner.as_ref());
        let dropped = admin.drop_database(descriptor).await?;
        Ok(StepResult::ok(if dropped {
            format!("Database '{}' dropped", descriptor.database)
        } else {
            format!("Database '{}' was already absent", descriptor.database)
        }))
    }

    async fn stage_app_files(&mut self) -> Result<StepResult> {
        let root = self.install_path.as_ref().context("No install path")?;

        // bin/ and Deploy/ belong to later stages; the user keep-list only
        // applies when data preservation was requested.
        let mut keep = vec!["bin".to_string(), "Deploy".to_string()];
        if self.request.keep_user_data {
            keep.extend(self.request.keep_paths.iter().cloned());
        }

        let stats = files::delete_tree_preserving(root, &keep, &self.journal()).await?;
        Ok(StepResult::ok(format!(
            "Application files removed ({} deleted, {} kept, {} deferred)",
            stats.removed, stats.kept, stats.deferred
        )))
    }

    async fn stage_service_files(&mut self) -> Result<StepResult> {
        let root = self.install_path.as_ref().context("No install path")?;
        let stats =
            files::delete_tree_preserving(&root.join("bin"), &[], &self.journal()).await?;
        Ok(StepResult::ok(format!(
            "Service files removed ({} deleted, {} deferred)",
            stats.removed, stats.deferred
        )))
    }

    async fn stage_tool_files(&mut self) -> Result<StepResult> {
        let root = self.install_path.as_ref().context("No install path")?;
        let stats =
            files::delete_tree_preserving(&root.join("Deploy"), &[], &self.journal()).await?;

        // If nothing but kept data remains, fold up the install path itself.
        let _ = tokio::fs::remove_dir(root).await;

        Ok(StepResult::ok(format!(
            "Deployment tool files removed ({} deleted, {} deferred)",
            stats.removed, stats.deferred
        )))
    }

    async fn stage_registry(&mut self) -> Result<StepResult> {
        let registry = self.store.program_registry();
        registry
            .remove(&site_program_key(&self.request.site_name))
            .await
            .context("Failed to remove program entry")?;

        // Only this site's documents go; the shared parent key stays for
        // sibling instances.
        self.store
            .remove_instance(&self.request.site_name)
            .await
            .context("Failed to remove instance record")?;

        Ok(StepResult::ok(format!(
            "Store entries for '{}' removed",
            self.request.site_name
        )))
    }

    /// Re-check every teardown category. Still-present items come back as
    /// human-readable warning strings.
    async fn verify_residuals(&self) -> Vec<String> {
        let mut leftovers = Vec::new();
        let site = &self.request.site_name;

        if webserver::site_exists(&self.paths.webserver_conf_dir, site).await {
            leftovers.push(format!("web server site config for '{}' still present", site));
        }

        for unit in [service::web_unit_name(site), self.tasks_unit()] {
            let path = service::unit_file_path(&self.paths.unit_dir, &unit);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                leftovers.push(format!("service unit file '{}' still present", unit));
            }
        }

        if let Some(root) = &self.install_path {
            if tokio::fs::try_exists(root).await.unwrap_or(false) {
                // Reported unconditionally, even when keep-user-data was
                // requested; the caller decides whether that is expected.
                leftovers.push(format!(
                    "application files still exist under {}",
                    root.display()
                ));
            }
        }

        if self.request.remove_database {
            if let Some(descriptor) = &self.descriptor {
                let admin = DatabaseAdmin::new(self.runner.as_ref());
                if let Ok(true) = admin.database_exists(descriptor).await {
                    leftovers.push(format!("database '{}' still exists", descriptor.database));
                }
            }
        }

        match self.store.load_instance(site).await {
            Ok(Some(_)) => leftovers.push(format!("instance record for '{}' still present", site)),
            Ok(None) => {}
            Err(e) => leftovers.push(format!("could not verify store entries: {}", e)),
        }

        if let Ok(pending) = self.journal().list().await {
            for path in pending {
                leftovers.push(format!("deletion deferred until a later run: {}", path));
            }
        }

        leftovers
    }
}
