// Built-in migration catalog.
//
// Versions are append-only: new migrations get the next integer, existing
// entries never change meaning once shipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};

use super::{MigrationContext, MigrationStep};
use crate::database::ConnectionDescriptor;
use crate::utils::validation::site_slug;

pub fn all() -> Vec<Box<dyn MigrationStep>> {
    vec![
        Box::new(InitialSchemaStamp),
        Box::new(HardenConnectionSecrets),
        Box::new(BackfillBoundPort),
        Box::new(BackfillServiceName),
    ]
}

/// v1: versioning marker for pre-versioning instances.
///
/// Legacy records carry data but no schema-version marker; stamping happens
/// in the engine after this apply succeeds, so the apply itself must not
/// touch existing fields. For a brand-new record the install pipeline's
/// configuration-write step has already populated everything, and this is a
/// pure no-op.
struct InitialSchemaStamp;

#[async_trait]
impl MigrationStep for InitialSchemaStamp {
    fn version(&self) -> u32 {
        1
    }
    fn description(&self) -> &'static str {
        "stamp schema versioning marker"
    }

    async fn apply(&self, ctx: &MigrationContext<'_>, site_name: &str) -> Result<()> {
        match ctx.store.load_instance(site_name).await? {
            Some(record) => {
                debug!(
                    "[PHASE: migration] [STEP: v1] Record present (site={}, marker={:?})",
                    site_name, record.schema_version
                );
            }
            None => {
                // Nothing to stamp; record creation belongs to the install
                // pipeline, not to migrations.
                debug!(
                    "[PHASE: migration] [STEP: v1] No record for site={}, nothing to do",
                    site_name
                );
            }
        }
        Ok(())
    }
}

/// v2: encryption-at-rest for connection secrets.
///
/// Derives the encrypted connection descriptor from legacy plaintext fields
/// when no encrypted value exists yet, then removes the plaintext fields.
/// NOT reversible: the down path intentionally does nothing (we never write
/// plaintext secrets back).
struct HardenConnectionSecrets;

impl HardenConnectionSecrets {
    fn legacy_descriptor(record: &crate::store::InstanceRecord) -> Option<ConnectionDescriptor> {
        if let (Some(server), Some(database)) = (&record.db_server, &record.db_name) {
            return Some(ConnectionDescriptor {
                server: server.clone(),
                database: database.clone(),
                user: record.db_user.clone(),
                password: record.db_password.clone(),
            });
        }
        // Very old records kept a single combined string.
        record
            .extra
            .get("dataConnectionString")
            .and_then(|v| v.as_str())
            .and_then(ConnectionDescriptor::parse)
    }
}

#[async_trait]
impl MigrationStep for HardenConnectionSecrets {
    fn version(&self) -> u32 {
        2
    }
    fn description(&self) -> &'static str {
        "encrypt connection secrets and remove plaintext fields"
    }

    async fn apply(&self, ctx: &MigrationContext<'_>, site_name: &str) -> Result<()> {
        let Some(mut record) = ctx.store.load_instance(site_name).await? else {
            return Ok(());
        };

        let has_plaintext = record.db_server.is_some()
            || record.db_name.is_some()
            || record.db_user.is_some()
            || record.db_password.is_some()
            || record.extra.contains_key("dataConnectionString");

        if !has_plaintext {
            return Ok(());
        }

        if record.connection.is_none() {
            if let Some(descriptor) = Self::legacy_descriptor(&record) {
                let blob = ctx
                    .secrets
                    .encrypt(&descriptor.to_descriptor_string())
                    .await
                    .context("Failed to encrypt legacy connection descriptor")?;
                record.connection = Some(blob);
                info!(
                    "[PHASE: migration] [STEP: v2] Derived encrypted descriptor (site={}, descriptor={})",
                    site_name,
                    descriptor.masked()
                );
            }
        }

        record.db_server = None;
        record.db_name = None;
        record.db_user = None;
        record.db_password = None;
        record.extra.remove("dataConnectionString");

        ctx.store.save_instance(&record).await?;
        Ok(())
    }
}

/// v3: backfill the bound-port field from the stored web URL.
struct BackfillBoundPort;

#[async_trait]
impl MigrationStep for BackfillBoundPort {
    fn version(&self) -> u32 {
        3
    }
    fn description(&self) -> &'static str {
        "backfill bound port from web URL"
    }

    async fn apply(&self, ctx: &MigrationContext<'_>, site_name: &str) -> Result<()> {
        let Some(mut record) = ctx.store.load_instance(site_name).await? else {
            return Ok(());
        };
        if record.port.is_some() {
            return Ok(());
        }
        let Some(web_url) = &record.web_url else {
            return Ok(());
        };

        let parsed = url::Url::parse(web_url)
            .with_context(|| format!("Instance web URL is not parseable: {}", web_url))?;
        if let Some(port) = parsed.port_or_known_default() {
            record.port = Some(port);
            ctx.store.save_instance(&record).await?;
            debug!(
                "[PHASE: migration] [STEP: v3] Backfilled port {} (site={})",
                port, site_name
            );
        }
        Ok(())
    }
}

/// v4: backfill the background-service name for instances installed before
/// the worker service existed.
struct BackfillServiceName;

#[async_trait]
impl MigrationStep for BackfillServiceName {
    fn version(&self) -> u32 {
        4
    }
    fn description(&self) -> &'static str {
        "backfill background service name"
    }

    async fn apply(&self, ctx: &MigrationContext<'_>, site_name: &str) -> Result<()> {
        let Some(mut record) = ctx.store.load_instance(site_name).await? else {
            return Ok(());
        };
        if record.service_name.is_some() {
            return Ok(());
        }
        record.service_name = Some(format!("shopserve-tasks-{}", site_slug(&record.site_name)));
        ctx.store.save_instance(&record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::MigrationEngine;
    use crate::security::SecretCodec;
    use crate::store::{ConfigStore, InstanceRecord};

    fn fixtures(dir: &std::path::Path) -> (ConfigStore, SecretCodec) {
        (
            ConfigStore::new(dir.join("store"), dir.join("store-legacy")),
            SecretCodec::new(dir.join("store").join("secrets").join("master_key.b64")),
        )
    }

    #[tokio::test]
    async fn legacy_record_is_stamped_without_overwriting_fields() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        // A pre-versioning record: data but no marker.
        let mut rec = InstanceRecord::new("LegacyShop");
        rec.install_path = Some("/srv/shops/legacyshop".to_string());
        rec.company_name = Some("Legacy GmbH".to_string());
        store.save_instance(&rec).await.expect("seed");

        let engine = MigrationEngine::with_catalog();
        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };
        let outcome = engine.migrate(&ctx, "LegacyShop").await;
        assert!(outcome.success);
        assert_eq!(outcome.applied[0], 1);

        let after = store
            .load_instance("LegacyShop")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(after.company_name.as_deref(), Some("Legacy GmbH"));
        assert_eq!(after.install_path.as_deref(), Some("/srv/shops/legacyshop"));
        assert_eq!(
            after.schema_version,
            Some(engine.latest_version()),
            "full catalog applied"
        );
    }

    #[tokio::test]
    async fn harden_secrets_encrypts_and_strips_plaintext() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        let mut rec = InstanceRecord::new("DemoShop");
        rec.db_server = Some("db1".to_string());
        rec.db_name = Some("demoshopdb".to_string());
        rec.db_user = Some("shop".to_string());
        rec.db_password = Some("plain-secret".to_string());
        store.save_instance(&rec).await.expect("seed");

        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };
        HardenConnectionSecrets
            .apply(&ctx, "DemoShop")
            .await
            .expect("apply");

        let after = store
            .load_instance("DemoShop")
            .await
            .expect("load")
            .expect("present");
        assert!(after.db_password.is_none(), "plaintext removed");
        assert!(after.db_server.is_none());
        let blob = after.connection.expect("encrypted descriptor present");
        assert!(secrets.is_encrypted(&blob));

        let plain = secrets.decrypt(&blob).await.expect("decrypt");
        let descriptor = ConnectionDescriptor::parse(&plain).expect("parse");
        assert_eq!(descriptor.server, "db1");
        assert_eq!(descriptor.password.as_deref(), Some("plain-secret"));
    }

    #[tokio::test]
    async fn harden_secrets_keeps_existing_encrypted_value() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        let existing_blob = secrets
            .encrypt("server=real;database=realdb")
            .await
            .expect("encrypt");
        let mut rec = InstanceRecord::new("DemoShop");
        rec.connection = Some(existing_blob.clone());
        rec.db_server = Some("stale".to_string());
        rec.db_name = Some("staledb".to_string());
        store.save_instance(&rec).await.expect("seed");

        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };
        HardenConnectionSecrets
            .apply(&ctx, "DemoShop")
            .await
            .expect("apply");

        let after = store
            .load_instance("DemoShop")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(
            after.connection.as_deref(),
            Some(existing_blob.as_str()),
            "existing encrypted descriptor must not be re-derived"
        );
        assert!(after.db_server.is_none(), "stale plaintext still removed");
    }

    #[tokio::test]
    async fn harden_secrets_reads_combined_legacy_string() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        let mut rec = InstanceRecord::new("OldShop");
        rec.extra.insert(
            "dataConnectionString".to_string(),
            serde_json::json!("server=olddb-host;database=oldshopdb;user=old;password=pw"),
        );
        store.save_instance(&rec).await.expect("seed");

        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };
        HardenConnectionSecrets
            .apply(&ctx, "OldShop")
            .await
            .expect("apply");

        let after = store
            .load_instance("OldShop")
            .await
            .expect("load")
            .expect("present");
        assert!(!after.extra.contains_key("dataConnectionString"));
        assert!(after.connection.is_some());
    }

    #[tokio::test]
    async fn backfill_port_parses_web_url() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        let mut rec = InstanceRecord::new("DemoShop");
        rec.web_url = Some("http://localhost:8085/".to_string());
        store.save_instance(&rec).await.expect("seed");

        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };
        BackfillBoundPort.apply(&ctx, "DemoShop").await.expect("apply");

        let after = store
            .load_instance("DemoShop")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(after.port, Some(8085));

        // Idempotent: re-running with a port present changes nothing.
        BackfillBoundPort.apply(&ctx, "DemoShop").await.expect("re-apply");
    }

    #[tokio::test]
    async fn backfill_service_name_uses_site_slug() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, secrets) = fixtures(tmp.path());

        store
            .save_instance(&InstanceRecord::new("DemoShop"))
            .await
            .expect("seed");

        let ctx = MigrationContext {
            store: &store,
            secrets: &secrets,
        };
        BackfillServiceName
            .apply(&ctx, "DemoShop")
            .await
            .expect("apply");

        let after = store
            .load_instance("DemoShop")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(after.service_name.as_deref(), Some("shopserve-tasks-demoshop"));
    }
}
