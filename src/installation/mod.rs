// Install orchestration.
//
// Seven ordered stages driven by the generic pipeline runner. Database,
// file-deployment and web-server failures abort the run; administrative
// account, background service, registration and migration failures degrade
// to warnings and the run still reports success. Re-running against an
// existing install path succeeds: files are overwritten, the site and units
// are recreated, and an existing database is left untouched when
// "use existing" is selected.

pub mod files;
pub mod service;
pub mod webserver;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::sync::Arc;
use tokio::time::Duration;

use crate::database::{ConnectionDescriptor, DatabaseAdmin};
use crate::migrations::{MigrationContext, MigrationEngine};
use crate::models::{InstallRequest, PipelineReport, ProgressEmitter, StepResult};
use crate::pipeline::{run_pipeline, Criticality, PipelineOptions, StageHandler, StageSpec};
use crate::process::{CommandRunner, CommandSpec};
use crate::security::SecretCodec;
use crate::store::programs::{site_program_key, ProgramEntry, TOOL_PROGRAM_KEY};
use crate::store::{ConfigStore, InstanceRecord};
use crate::utils::locks::site_lock;
use crate::utils::path_resolver::DeployerPaths;
use crate::utils::validation::{validate_database_name, validate_site_name};

const TOOL_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

fn install_stages() -> Vec<StageSpec> {
    vec![
        StageSpec {
            name: "prerequisites",
            label: "Checking prerequisites",
            percent_start: 2,
            percent_done: 10,
            criticality: Criticality::Fatal,
        },
        StageSpec {
            name: "database",
            label: "Provisioning database",
            percent_start: 10,
            percent_done: 30,
            criticality: Criticality::Fatal,
        },
        StageSpec {
            name: "files",
            label: "Deploying application files",
            percent_start: 30,
            percent_done: 55,
            criticality: Criticality::Fatal,
        },
        StageSpec {
            name: "webserver",
            label: "Configuring web server",
            percent_start: 55,
            percent_done: 70,
            criticality: Criticality::Fatal,
        },
        StageSpec {
            name: "configuration",
            label: "Applying configuration",
            percent_start: 70,
            percent_done: 80,
            criticality: Criticality::Warning,
        },
        StageSpec {
            name: "service",
            label: "Installing background service",
            percent_start: 80,
            percent_done: 90,
            criticality: Criticality::Warning,
        },
        StageSpec {
            name: "finalize",
            label: "Finalizing installation",
            percent_start: 90,
            percent_done: 100,
            criticality: Criticality::Warning,
        },
    ]
}

pub struct InstallOrchestrator {
    paths: DeployerPaths,
    store: ConfigStore,
    secrets: Arc<SecretCodec>,
    runner: Arc<dyn CommandRunner>,
    engine: Arc<MigrationEngine>,
}

impl InstallOrchestrator {
    pub fn new(paths: DeployerPaths, runner: Arc<dyn CommandRunner>) -> Self {
        let store = ConfigStore::new(&paths.store_root, &paths.legacy_store_root);
        let secrets = Arc::new(SecretCodec::new(paths.master_key_file()));
        Self {
            paths,
            store,
            secrets,
            runner,
            engine: Arc::new(MigrationEngine::with_catalog()),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Run the install pipeline for one site.
    pub async fn install(
        &self,
        request: InstallRequest,
        progress: &ProgressEmitter,
    ) -> PipelineReport {
        let lock = site_lock(&request.site_name);
        let _guard = lock.lock().await;

        info!(
            "[PHASE: install] [STEP: start] Installing site '{}' to {:?} (dry_run={})",
            request.site_name, request.install_path, request.dry_run
        );

        // Clear out anything a previous teardown could not remove.
        if !request.dry_run {
            let journal = files::PendingDeletes::new(self.paths.pending_deletes_file());
            if let Ok(swept) = journal.sweep().await {
                if swept > 0 {
                    info!(
                        "[PHASE: install] [STEP: start] Swept {} deferred deletion(s)",
                        swept
                    );
                }
            }
        }

        let opts = PipelineOptions::new(request.dry_run);
        let mut ctx = InstallContext {
            descriptor: ConnectionDescriptor {
                server: request.db_server.clone(),
                database: request.db_name.clone(),
                user: request.db_user.clone(),
                password: request.db_password.clone(),
            },
            request,
            paths: self.paths.clone(),
            store: self.store.clone(),
            secrets: self.secrets.clone(),
            runner: self.runner.clone(),
            engine: self.engine.clone(),
            chosen_port: None,
            web_url: None,
        };

        run_pipeline(&mut ctx, &install_stages(), &opts, progress).await
    }

    /// Maintenance entry point: re-run the pipeline against an already
    /// installed instance, keeping its database.
    pub async fn reconfigure(
        &self,
        site_name: &str,
        bundle_path: std::path::PathBuf,
        progress: &ProgressEmitter,
    ) -> Result<PipelineReport> {
        let record = self
            .store
            .load_instance(site_name)
            .await?
            .with_context(|| format!("No installed instance named '{}' was found", site_name))?;

        let descriptor = crate::reconcile::resolve_connection(
            &record,
            &self.secrets,
            record.install_path.as_deref(),
        )
        .await
        .with_context(|| {
            format!(
                "Instance '{}' has no resolvable database connection",
                site_name
            )
        })?;

        let install_path = record
            .install_path
            .clone()
            .with_context(|| format!("Instance '{}' has no recorded install path", site_name))?;

        let request = InstallRequest {
            site_name: record.site_name.clone(),
            company_name: record.company_name.clone(),
            admin_email: None,
            admin_password: None,
            install_path: install_path.into(),
            bundle_path,
            db_server: descriptor.server.clone(),
            db_name: descriptor.database.clone(),
            create_database: false,
            db_user: descriptor.user.clone(),
            db_password: descriptor.password.clone(),
            runtime_role: "shopserve_app".to_string(),
            enable_https: false,
            requested_port: record.port.unwrap_or(8080),
            product_version: record
                .product_version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            dry_run: false,
        };

        Ok(self.install(request, progress).await)
    }
}

struct InstallContext {
    request: InstallRequest,
    paths: DeployerPaths,
    store: ConfigStore,
    secrets: Arc<SecretCodec>,
    runner: Arc<dyn CommandRunner>,
    engine: Arc<MigrationEngine>,
    descriptor: ConnectionDescriptor,
    chosen_port: Option<u16>,
    web_url: Option<String>,
}

#[async_trait]
impl StageHandler for InstallContext {
    fn phase(&self) -> &'static str {
        "install"
    }

    async fn run_stage(&mut self, stage: &StageSpec) -> Result<StepResult> {
        match stage.name {
            "prerequisites" => self.stage_prerequisites().await,
            "database" => self.stage_database().await,
            "files" => self.stage_files().await,
            "webserver" => self.stage_webserver().await,
            "configuration" => self.stage_configuration().await,
            "service" => self.stage_service().await,
            "finalize" => self.stage_finalize().await,
            other => anyhow::bail!("Unknown install stage '{}'", other),
        }
    }
}

impl InstallContext {
    async fn check_tool(&self, program: &str, operation: &str) -> Result<()> {
        let out = self
            .runner
            .run(
                CommandSpec::new(program, operation)
                    .arg("--version")
                    .timeout(TOOL_CHECK_TIMEOUT),
            )
            .await
            .with_context(|| format!("Required tool '{}' is not available", program))?;
        if !out.success() {
            anyhow::bail!(out.failure_summary(operation));
        }
        Ok(())
    }

    async fn stage_prerequisites(&mut self) -> Result<StepResult> {
        validate_site_name(&self.request.site_name)?;
        validate_database_name(&self.request.db_name)?;

        files::verify_required_entries(&self.request.bundle_path, "Source bundle").await?;

        self.check_tool("psql", "tool_check_psql").await?;
        self.check_tool("nginx", "tool_check_nginx").await?;
        self.check_tool("systemctl", "tool_check_systemctl").await?;
        if self.request.enable_https {
            self.check_tool("openssl", "tool_check_openssl").await?;
        }

        tokio::fs::create_dir_all(&self.request.install_path)
            .await
            .with_context(|| {
                format!(
                    "Install path is not writable: {:?}",
                    self.request.install_path
                )
            })?;

        Ok(StepResult::ok(format!(
            "Prerequisites satisfied for site '{}'",
            self.request.site_name
        )))
    }

    async fn stage_database(&mut self) -> Result<StepResult> {
        let admin = DatabaseAdmin::new(self.runner.as_ref());

        let schema_path = self.request.bundle_path.join("schema.sql");
        let schema_sql = tokio::fs::read_to_string(&schema_path)
            .await
            .with_context(|| format!("Bundled schema script missing: {:?}", schema_path))?;

        let action = if self.request.create_database {
            admin.create_database(&self.descriptor).await?;
            admin.apply_schema(&self.descriptor, &schema_sql).await?;
            "created"
        } else {
            if !admin.database_exists(&self.descriptor).await? {
                anyhow::bail!(
                    "Database '{}' does not exist on '{}' (use create-new to provision it)",
                    self.descriptor.database,
                    self.descriptor.server
                );
            }
            admin.apply_schema(&self.descriptor, &schema_sql).await?;
            "reused"
        };

        admin
            .grant_runtime_access(&self.descriptor, &self.request.runtime_role)
            .await?;

        Ok(StepResult::ok(format!(
            "Database '{}' {} and runtime access granted",
            self.descriptor.database, action
        )))
    }

    async fn stage_files(&mut self) -> Result<StepResult> {
        let stats = files::deploy_tree(&self.request.bundle_path, &self.request.install_path)
            .await
            .context("File deployment failed")?;

        files::verify_required_entries(&self.request.install_path, "Deployed tree").await?;

        Ok(StepResult::ok(format!(
            "Deployed {} files ({} bytes)",
            stats.files, stats.bytes
        )))
    }

    async fn stage_webserver(&mut self) -> Result<StepResult> {
        let site = &self.request.site_name;
        let web_unit = service::web_unit_name(site);

        // Free the instance's own port before probing, so a re-run does not
        // get bumped off its recorded binding by its previous self.
        service::stop_unit(self.runner.as_ref(), &web_unit).await;

        let chosen_port = webserver::configure_site(
            self.runner.as_ref(),
            &self.paths.webserver_conf_dir,
            &self.request.install_path,
            site,
            self.request.requested_port,
            self.request.enable_https,
        )
        .await?;

        let unit_text = service::build_systemd_unit_text(
            &web_unit,
            "ShopServe web application",
            &self.request.install_path.join("bin/shopserve-web"),
            &self.request.install_path,
            None,
        );
        service::install_and_start_unit(
            self.runner.as_ref(),
            &self.paths.unit_dir,
            &web_unit,
            &unit_text,
        )
        .await?;

        let scheme = if self.request.enable_https {
            "https"
        } else {
            "http"
        };
        let web_url = url::Url::parse(&format!("{}://localhost:{}/", scheme, chosen_port))
            .context("Failed to build instance web URL")?;

        self.chosen_port = Some(chosen_port);
        self.web_url = Some(web_url.to_string());

        Ok(StepResult::ok(format!(
            "Site bound to port {} ({})",
            chosen_port, scheme
        )))
    }

    async fn stage_configuration(&mut self) -> Result<StepResult> {
        let app_data = self.request.install_path.join("App_Data");
        tokio::fs::create_dir_all(&app_data)
            .await
            .with_context(|| format!("Failed to create App_Data: {:?}", app_data))?;

        let settings = format!(
            "SiteName: {}\nCompanyName: {}\nWebUrl: {}\nListenSocket: {}\nDataConnectionString: {}\n",
            self.request.site_name,
            self.request.company_name.as_deref().unwrap_or(""),
            self.web_url.as_deref().unwrap_or(""),
            webserver::backend_socket_path(&self.request.site_name),
            self.descriptor.to_descriptor_string(),
        );
        let settings_path = app_data.join("settings.txt");
        tokio::fs::write(&settings_path, settings)
            .await
            .with_context(|| format!("Failed to write {:?}", settings_path))?;

        // Administrative account: only for a fresh database, and only when
        // credentials were supplied.
        let admin_created = if self.request.create_database {
            match (&self.request.admin_email, &self.request.admin_password) {
                (Some(email), Some(password)) => {
                    let admin = DatabaseAdmin::new(self.runner.as_ref());
                    admin
                        .create_admin_account(&self.descriptor, email, password)
                        .await?;
                    true
                }
                _ => false,
            }
        } else {
            false
        };

        Ok(StepResult::ok(if admin_created {
            "Configuration written; administrative account created".to_string()
        } else {
            "Configuration written; administrative account skipped".to_string()
        }))
    }

    async fn stage_service(&mut self) -> Result<StepResult> {
        let tasks_unit = service::tasks_unit_name(&self.request.site_name);
        let unit_text = service::build_systemd_unit_text(
            &tasks_unit,
            "ShopServe background tasks",
            &self.request.install_path.join("bin/shopserve-tasks"),
            &self.request.install_path,
            None,
        );
        service::install_and_start_unit(
            self.runner.as_ref(),
            &self.paths.unit_dir,
            &tasks_unit,
            &unit_text,
        )
        .await?;

        Ok(StepResult::ok(format!(
            "Background service '{}' running",
            tasks_unit
        )))
    }

    async fn stage_finalize(&mut self) -> Result<StepResult> {
        let mut problems: Vec<String> = Vec::new();

        // Discovery registration (program-management surface).
        let registry = self.store.program_registry();
        let install_path_str = self.request.install_path.to_string_lossy().to_string();
        if let Err(e) = registry
            .register(
                TOOL_PROGRAM_KEY,
                ProgramEntry {
                    display_name: "ShopServe Deployer".to_string(),
                    display_version: crate::utils::validation::normalize_display_version(env!(
                        "CARGO_PKG_VERSION"
                    )),
                    publisher: "ShopServe".to_string(),
                    install_location: crate::utils::path_resolver::resolve_deployment_folder()
                        .map(|p| p.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    modify_command: String::new(),
                    uninstall_command: "shopserve-installer --uninstall-program".to_string(),
                },
            )
            .await
        {
            problems.push(format!("tool registration failed: {}", e));
        }
        if let Err(e) = registry
            .register(
                &site_program_key(&self.request.site_name),
                ProgramEntry::for_site(
                    &self.request.site_name,
                    &self.request.product_version,
                    &install_path_str,
                ),
            )
            .await
        {
            problems.push(format!("instance registration failed: {}", e));
        }

        // Instance record: reuse what an earlier run wrote, then overwrite
        // the fields this run owns.
        match self.write_instance_record().await {
            Ok(()) => {}
            Err(e) => problems.push(format!("instance record write failed: {}", e)),
        }

        // Bring the record's schema to the latest version.
        let migration_ctx = MigrationContext {
            store: &self.store,
            secrets: &self.secrets,
        };
        let outcome = self
            .engine
            .migrate(&migration_ctx, &self.request.site_name)
            .await;
        if !outcome.success {
            problems.push(format!("migration failed: {}", outcome.message));
        }

        if problems.is_empty() {
            Ok(StepResult::ok(format!(
                "Instance '{}' registered; {}",
                self.request.site_name, outcome.message
            )))
        } else {
            Ok(StepResult::fail(
                "Finalization completed with problems".to_string(),
                problems.join("; "),
            ))
        }
    }

    async fn write_instance_record(&self) -> Result<()> {
        let mut record = self
            .store
            .load_instance(&self.request.site_name)
            .await?
            .unwrap_or_else(|| InstanceRecord::new(&self.request.site_name));

        record.company_name = self
            .request
            .company_name
            .clone()
            .or(record.company_name.take());
        record.install_path = Some(self.request.install_path.to_string_lossy().to_string());
        record.product_version = Some(self.request.product_version.clone());
        record.port = self.chosen_port.or(record.port);
        record.web_url = self.web_url.clone().or(record.web_url.take());
        if record.installed_at.is_none() {
            record.installed_at = Some(Utc::now());
        }

        let blob = self
            .secrets
            .encrypt(&self.descriptor.to_descriptor_string())
            .await
            .context("Failed to encrypt connection descriptor")?;
        record.connection = Some(blob);

        // Integrity repair for well-known fields older records may lack.
        if record.web_path.is_none() {
            record.web_path = Some(
                self.request
                    .install_path
                    .join("wwwroot")
                    .to_string_lossy()
                    .to_string(),
            );
        }
        if record.service_path.is_none() {
            record.service_path = Some(
                self.request
                    .install_path
                    .join("bin")
                    .to_string_lossy()
                    .to_string(),
            );
        }
        if record.service_name.is_none() {
            record.service_name = Some(service::tasks_unit_name(&self.request.site_name));
        }

        self.store.save_instance(&record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::results::null_progress;
    use crate::process::fake::ScriptedRunner;
    use crate::process::CommandOutput;
    use std::path::Path;

    async fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, content).await.unwrap();
    }

    async fn make_bundle(root: &Path) {
        write_file(&root.join("bin/shopserve-web"), "web binary").await;
        write_file(&root.join("bin/shopserve-tasks"), "tasks binary").await;
        write_file(&root.join("wwwroot/index.html"), "<html/>").await;
        tokio::fs::create_dir_all(root.join("App_Data")).await.unwrap();
        write_file(&root.join("schema.sql"), "CREATE TABLE IF NOT EXISTS product ();").await;
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        port
    }

    fn request(tmp: &Path, port: u16) -> InstallRequest {
        InstallRequest {
            site_name: "DemoShop".to_string(),
            company_name: Some("Demo GmbH".to_string()),
            admin_email: Some("admin@demoshop.test".to_string()),
            admin_password: Some("correct horse".to_string()),
            install_path: tmp.join("sites/demoshop"),
            bundle_path: tmp.join("bundle"),
            db_server: "localhost".to_string(),
            db_name: "demoshopdb".to_string(),
            create_database: true,
            db_user: Some("shop".to_string()),
            db_password: Some("pw".to_string()),
            runtime_role: "shopserve_app".to_string(),
            enable_https: false,
            requested_port: port,
            product_version: "4.2.0".to_string(),
            dry_run: false,
        }
    }

    fn runner_with_running_units() -> ScriptedRunner {
        let runner = ScriptedRunner::new();
        // Web unit and tasks unit verification both report active.
        runner.respond("svc_is_active", CommandOutput::ok_with_stdout("active\n"));
        runner.respond("svc_is_active", CommandOutput::ok_with_stdout("active\n"));
        runner
    }

    #[tokio::test]
    async fn install_happy_path_writes_record_and_migrates() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;
        let port = free_port();

        let runner = Arc::new(runner_with_running_units());
        let orchestrator = InstallOrchestrator::new(
            DeployerPaths::under(tmp.path()),
            runner.clone(),
        );

        let seen: Arc<std::sync::Mutex<Vec<i32>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: crate::models::ProgressEmitter =
            Arc::new(move |p| sink.lock().unwrap().push(p.percent));

        let report = orchestrator
            .install(request(tmp.path(), port), &progress)
            .await;

        assert!(report.success, "report: {:?}", report);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
        assert_eq!(
            seen.lock().unwrap().last().copied(),
            Some(100),
            "final reported percentage must be 100"
        );

        let record = orchestrator
            .store()
            .load_instance("DemoShop")
            .await
            .unwrap()
            .expect("record written");
        assert_eq!(record.port, Some(port));
        assert_eq!(
            record.schema_version,
            Some(MigrationEngine::with_catalog().latest_version()),
            "finalize must run the migration engine"
        );
        assert!(record.connection.is_some(), "descriptor stored encrypted");
        assert!(record.db_password.is_none(), "no plaintext secrets");

        // Admin account was created for the fresh database.
        assert_eq!(runner.calls_for("db_admin_account").len(), 1);
        // Database was created, schema applied, access granted.
        assert_eq!(runner.calls_for("db_create").len(), 1);
        assert_eq!(runner.calls_for("db_apply_schema").len(), 1);
        assert_eq!(runner.calls_for("db_grant").len(), 1);

        // Files deployed.
        assert!(tmp
            .path()
            .join("sites/demoshop/wwwroot/index.html")
            .exists());
        // Program entries registered.
        let registry = orchestrator.store().program_registry();
        assert!(registry
            .contains(&site_program_key("DemoShop"))
            .await
            .unwrap());
        assert!(registry.contains(TOOL_PROGRAM_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn occupied_port_is_bumped_and_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;

        let holder = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        let runner = Arc::new(runner_with_running_units());
        let orchestrator =
            InstallOrchestrator::new(DeployerPaths::under(tmp.path()), runner);

        let report = orchestrator
            .install(request(tmp.path(), held), &null_progress())
            .await;
        assert!(report.success, "report: {:?}", report);

        let record = orchestrator
            .store()
            .load_instance("DemoShop")
            .await
            .unwrap()
            .expect("record");
        let bound = record.port.expect("port recorded");
        assert!(bound > held, "expected port above {}, got {}", held, bound);
        assert!(record
            .web_url
            .expect("web url recorded")
            .contains(&bound.to_string()));
    }

    #[tokio::test]
    async fn database_failure_is_fatal_and_stops_deployment() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;
        let port = free_port();

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "db_create",
            CommandOutput::failed_with_stderr(1, "ERROR: permission denied"),
        );

        let orchestrator =
            InstallOrchestrator::new(DeployerPaths::under(tmp.path()), runner.clone());
        let report = orchestrator
            .install(request(tmp.path(), port), &null_progress())
            .await;

        assert!(!report.success);
        assert!(report
            .error
            .as_deref()
            .unwrap_or("")
            .contains("permission denied"));
        assert!(
            !tmp.path().join("sites/demoshop/wwwroot").exists(),
            "file deployment must not run after a fatal database failure"
        );
        assert!(
            orchestrator
                .store()
                .load_instance("DemoShop")
                .await
                .unwrap()
                .is_none(),
            "no record for an aborted install"
        );
    }

    #[tokio::test]
    async fn background_service_failure_is_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;
        let port = free_port();

        let runner = Arc::new(ScriptedRunner::new());
        // Web unit active, tasks unit not.
        runner.respond("svc_is_active", CommandOutput::ok_with_stdout("active\n"));
        runner.respond("svc_is_active", CommandOutput::ok_with_stdout("inactive\n"));

        let orchestrator =
            InstallOrchestrator::new(DeployerPaths::under(tmp.path()), runner);
        let report = orchestrator
            .install(request(tmp.path(), port), &null_progress())
            .await;

        assert!(report.success, "service failure must not fail the run");
        assert_eq!(report.warnings.len(), 1, "warnings: {:?}", report.warnings);
        assert!(report.warnings[0].contains("background service"));

        // Finalization still ran.
        let record = orchestrator
            .store()
            .load_instance("DemoShop")
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn existing_database_mode_requires_database() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;
        let port = free_port();

        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("db_exists", CommandOutput::ok_with_stdout("\n"));

        let mut req = request(tmp.path(), port);
        req.create_database = false;

        let orchestrator =
            InstallOrchestrator::new(DeployerPaths::under(tmp.path()), runner.clone());
        let report = orchestrator.install(req, &null_progress()).await;

        assert!(!report.success);
        assert!(report.error.as_deref().unwrap_or("").contains("does not exist"));
        assert!(runner.calls_for("db_create").is_empty(), "create-new must not run");
    }

    #[tokio::test]
    async fn dry_run_mutates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;
        let port = free_port();

        let runner = Arc::new(ScriptedRunner::new());
        let mut req = request(tmp.path(), port);
        req.dry_run = true;

        let orchestrator =
            InstallOrchestrator::new(DeployerPaths::under(tmp.path()), runner.clone());
        let report = orchestrator.install(req, &null_progress()).await;

        assert!(report.success);
        assert!(runner.calls().is_empty(), "no external tool may run");
        assert!(!tmp.path().join("sites/demoshop").exists());
        assert!(orchestrator
            .store()
            .load_instance("DemoShop")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rerun_reuses_database_and_keeps_installed_at() {
        let tmp = tempfile::tempdir().unwrap();
        make_bundle(&tmp.path().join("bundle")).await;
        let port = free_port();

        let runner = Arc::new(runner_with_running_units());
        let orchestrator =
            InstallOrchestrator::new(DeployerPaths::under(tmp.path()), runner.clone());
        let report = orchestrator
            .install(request(tmp.path(), port), &null_progress())
            .await;
        assert!(report.success);
        let first = orchestrator
            .store()
            .load_instance("DemoShop")
            .await
            .unwrap()
            .expect("record");

        // Second run against the same path with use-existing semantics.
        let runner2_responses = || {
            runner.respond("db_exists", CommandOutput::ok_with_stdout("1\n"));
            runner.respond("svc_is_active", CommandOutput::ok_with_stdout("active\n"));
            runner.respond("svc_is_active", CommandOutput::ok_with_stdout("active\n"));
        };
        runner2_responses();

        let mut req = request(tmp.path(), port);
        req.create_database = false;
        let report = orchestrator.install(req, &null_progress()).await;
        assert!(report.success, "re-run must succeed: {:?}", report);

        let second = orchestrator
            .store()
            .load_instance("DemoShop")
            .await
            .unwrap()
            .expect("record");
        assert_eq!(second.installed_at, first.installed_at);
        assert_eq!(
            runner.calls_for("db_create").len(),
            1,
            "existing database left untouched on re-run"
        );
    }
}
