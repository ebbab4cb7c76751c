// Migration engine for per-instance configuration schema.
//
// Migrations are code-defined, ordered by integer version and idempotent.
// The engine brings one site's record to the latest known version:
// versions strictly greater than the current one run in ascending order,
// the new schema version is persisted after EACH successful apply (a crash
// mid-run leaves the marker consistent with the last fully-applied step),
// and the run stops at the first failure without attempting later versions.

pub mod catalog;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};

use crate::models::MigrationOutcome;
use crate::security::SecretCodec;
use crate::store::ConfigStore;

/// Shared collaborators handed to each migration's apply operation.
pub struct MigrationContext<'a> {
    pub store: &'a ConfigStore,
    pub secrets: &'a SecretCodec,
}

/// One versioned migration. Apply operations must be idempotent and safe to
/// re-run against a partially-migrated or legacy instance: detect whether
/// the target state already exists before mutating, and never destroy data
/// the migration did not itself introduce.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    fn version(&self) -> u32;
    fn description(&self) -> &'static str;
    async fn apply(&self, ctx: &MigrationContext<'_>, site_name: &str) -> Result<()>;
    /// Author-written down path; not derived automatically. Default no-op.
    async fn revert(&self, _ctx: &MigrationContext<'_>, _site_name: &str) -> Result<()> {
        Ok(())
    }
}

pub struct MigrationEngine {
    steps: Vec<Box<dyn MigrationStep>>,
}

impl MigrationEngine {
    /// Engine over an explicit step list. Steps are sorted by version;
    /// versions must be unique.
    pub fn new(mut steps: Vec<Box<dyn MigrationStep>>) -> Self {
        steps.sort_by_key(|s| s.version());
        debug_assert!(
            steps.windows(2).all(|w| w[0].version() < w[1].version()),
            "migration versions must be strictly increasing"
        );
        Self { steps }
    }

    /// Engine over the built-in catalog.
    pub fn with_catalog() -> Self {
        Self::new(catalog::all())
    }

    /// Highest version the engine knows about (0 when the list is empty).
    pub fn latest_version(&self) -> u32 {
        self.steps.last().map(|s| s.version()).unwrap_or(0)
    }

    /// Bring `site_name` to the latest schema version.
    pub async fn migrate(&self, ctx: &MigrationContext<'_>, site_name: &str) -> MigrationOutcome {
        let current = match ctx.store.get_schema_version(site_name).await {
            Ok(v) => v,
            Err(e) => {
                // Version discovery failed; report nothing-to-do rather than
                // guessing a version and mutating from the wrong baseline.
                warn!(
                    "[PHASE: migration] [STEP: discover] Could not determine schema version (site={}, err={})",
                    site_name, e
                );
                return MigrationOutcome {
                    success: true,
                    applied: Vec::new(),
                    failed: None,
                    message: format!(
                        "Could not determine schema version for '{}'; no migrations applied",
                        site_name
                    ),
                };
            }
        };

        let pending: Vec<&Box<dyn MigrationStep>> = self
            .steps
            .iter()
            .filter(|s| s.version() > current)
            .collect();

        if pending.is_empty() {
            info!(
                "[PHASE: migration] [STEP: run] Schema up to date (site={}, version={})",
                site_name, current
            );
            return MigrationOutcome {
                success: true,
                applied: Vec::new(),
                failed: None,
                message: format!(
                    "Schema for '{}' is up to date at version {} (0 migrations applied)",
                    site_name, current
                ),
            };
        }

        info!(
            "[PHASE: migration] [STEP: run] {} pending migration(s) for site={} (current={})",
            pending.len(),
            site_name,
            current
        );

        let mut applied: Vec<u32> = Vec::new();
        for step in pending {
            let version = step.version();
            info!(
                "[PHASE: migration] [STEP: apply] Applying v{} - {} (site={})",
                version,
                step.description(),
                site_name
            );

            // An apply error and an apply failure are the same thing; either
            // stops the run without attempting higher versions.
            let persist_result = match step.apply(ctx, site_name).await {
                Ok(()) => ctx
                    .store
                    .set_schema_version(site_name, version)
                    .await
                    .map_err(anyhow::Error::new),
                Err(e) => Err(e),
            };

            match persist_result {
                Ok(()) => applied.push(version),
                Err(e) => {
                    warn!(
                        "[PHASE: migration] [STEP: apply] Migration v{} failed (site={}, err={:#})",
                        version, site_name, e
                    );
                    return MigrationOutcome {
                        success: false,
                        message: format!(
                            "Migration v{} ({}) failed after {} applied: {:#}",
                            version,
                            step.description(),
                            applied.len(),
                            e
                        ),
                        applied,
                        failed: Some(version),
                    };
                }
            }
        }

        let top = applied.last().copied().unwrap_or(current);
        MigrationOutcome {
            success: true,
            message: format!(
                "Applied {} migration(s) for '{}'; schema version is now {}",
                applied.len(),
                site_name,
                top
            ),
            applied,
            failed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InstanceRecord;
    use std::sync::{Arc, Mutex};

    struct ScriptedStep {
        version: u32,
        fail: bool,
        log: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl MigrationStep for ScriptedStep {
        fn version(&self) -> u32 {
            self.version
        }
        fn description(&self) -> &'static str {
            "scripted test step"
        }
        async fn apply(&self, _ctx: &MigrationContext<'_>, _site: &str) -> Result<()> {
            self.log.lock().unwrap().push(self.version);
            if self.fail {
                anyhow::bail!("scripted failure at v{}", self.version);
            }
            Ok(())
        }
    }

    fn fixtures(dir: &std::path::Path) -> (ConfigStore, SecretCodec) {
        (
            ConfigStore::new(dir.join("store"), dir.join("store-legacy")),
            SecretCodec::new(dir.join("store").join("secrets").join("master_key.b64")),
        )
    }

    fn engine_of(specs: &[(u32, bool)], log: &Arc<Mutex<Vec<u32>>>) -> MigrationEngine {
        MigrationEngine::new(
            specs
                .iter()
                .map(|(v, fail)| {
                    Box::new(ScriptedStep {
                        version: *v,
                        fail: *fail,
                        log: log.clone(),
                    }) as Box<dyn MigrationStep>
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn applies_all_pending_in_order_and_persists_each() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());
        store
            .save_instance(&InstanceRecord::new("DemoShop"))
            .await
            .expect("seed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_of(&[(1, false), (2, false), (3, false)], &log);
        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };

        let outcome = engine.migrate(&ctx, "DemoShop").await;
        assert!(outcome.success);
        assert_eq!(outcome.applied, vec![1, 2, 3]);
        assert_eq!(outcome.failed, None);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(store.get_schema_version("DemoShop").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());
        store
            .save_instance(&InstanceRecord::new("DemoShop"))
            .await
            .expect("seed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_of(&[(1, false), (2, false)], &log);
        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };

        let first = engine.migrate(&ctx, "DemoShop").await;
        assert_eq!(first.applied_count(), 2);

        let second = engine.migrate(&ctx, "DemoShop").await;
        assert!(second.success);
        assert_eq!(second.applied_count(), 0);
        assert!(second.message.contains("up to date"));
        assert_eq!(*log.lock().unwrap(), vec![1, 2], "no re-application");
    }

    #[tokio::test]
    async fn failure_stops_run_and_leaves_version_at_last_success() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());
        store
            .save_instance(&InstanceRecord::new("DemoShop"))
            .await
            .expect("seed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_of(&[(1, false), (2, true), (3, false)], &log);
        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };

        let outcome = engine.migrate(&ctx, "DemoShop").await;
        assert!(!outcome.success);
        assert_eq!(outcome.applied, vec![1]);
        assert_eq!(outcome.failed, Some(2));
        assert_eq!(
            *log.lock().unwrap(),
            vec![1, 2],
            "v3 must not be attempted after v2 fails"
        );
        assert_eq!(
            store.get_schema_version("DemoShop").await.unwrap(),
            1,
            "version reflects last fully-applied step"
        );
    }

    #[tokio::test]
    async fn schema_version_never_regresses() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        let mut rec = InstanceRecord::new("DemoShop");
        rec.schema_version = Some(5);
        store.save_instance(&rec).await.expect("seed");

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_of(&[(1, false), (2, false)], &log);
        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };

        let outcome = engine.migrate(&ctx, "DemoShop").await;
        assert!(outcome.success);
        assert_eq!(outcome.applied_count(), 0);
        assert_eq!(store.get_schema_version("DemoShop").await.unwrap(), 5);
    }

    #[test]
    fn builtin_catalog_versions_strictly_increase() {
        let steps = catalog::all();
        let versions: Vec<u32> = steps.iter().map(|s| s.version()).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted, "catalog versions must be unique and ascending");
        assert!(MigrationEngine::with_catalog().latest_version() >= 4);
    }
}
