// Database operations for instance lifecycles.
//
// All access shells out to the PostgreSQL client tools through the
// `CommandRunner` seam; nothing in here links a database driver. Identifiers
// are validated before interpolation, values are quoted as SQL literals,
// passwords travel via PGPASSWORD (never argv).

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::time::Duration;

use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::utils::logging::mask_connection_string;
use crate::utils::validation::{
    quote_sql_literal, validate_database_name, validate_role_name,
};

const SQL_TIMEOUT: Duration = Duration::from_secs(30);
const SCHEMA_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-query budget for the health probe; detection must not hang on an
/// unreachable instance.
pub const PROBE_QUERY_TIMEOUT: Duration = Duration::from_secs(4);

/// Parsed server+database pair with optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub server: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectionDescriptor {
    pub fn new(server: &str, database: &str) -> Self {
        Self {
            server: server.to_string(),
            database: database.to_string(),
            user: None,
            password: None,
        }
    }

    /// Parse a semicolon key/value descriptor. Returns `None` unless both a
    /// server and a database can be extracted.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut server = None;
        let mut database = None;
        let mut user = None;
        let mut password = None;

        for part in raw.split(';') {
            let Some((k, v)) = part.split_once('=') else {
                continue;
            };
            let key = k.trim().to_ascii_lowercase().replace([' ', '_'], "");
            let val = v.trim();
            if val.is_empty() {
                continue;
            }
            match key.as_str() {
                "server" | "host" | "datasource" => server = Some(val.to_string()),
                "database" | "initialcatalog" => database = Some(val.to_string()),
                "user" | "userid" | "uid" | "username" => user = Some(val.to_string()),
                "password" | "pwd" => password = Some(val.to_string()),
                _ => {}
            }
        }

        Some(Self {
            server: server?,
            database: database?,
            user,
            password,
        })
    }

    /// Serialize back to the canonical key/value form.
    pub fn to_descriptor_string(&self) -> String {
        let mut out = format!("server={};database={}", self.server, self.database);
        if let Some(user) = &self.user {
            out.push_str(&format!(";user={}", user));
        }
        if let Some(password) = &self.password {
            out.push_str(&format!(";password={}", password));
        }
        out
    }

    /// Log-safe rendition.
    pub fn masked(&self) -> String {
        mask_connection_string(&self.to_descriptor_string())
    }

    fn host_and_port(&self) -> (String, Option<String>) {
        match self.server.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                (host.to_string(), Some(port.to_string()))
            }
            _ => (self.server.clone(), None),
        }
    }
}

/// Live-health statistics for one instance's backing database.
///
/// Counts use -1 as the "query failed" sentinel so a partially broken schema
/// still yields a useful view.
#[derive(Debug, Clone)]
pub struct DatabaseHealth {
    pub has_database: bool,
    pub product_count: i64,
    pub order_count: i64,
    pub user_count: i64,
}

pub struct DatabaseAdmin<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> DatabaseAdmin<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    fn sql_spec(
        &self,
        descriptor: &ConnectionDescriptor,
        maintenance_db: Option<&str>,
        sql: &str,
        operation: &str,
        timeout: Duration,
    ) -> CommandSpec {
        let (host, port) = descriptor.host_and_port();
        let db = maintenance_db.unwrap_or(&descriptor.database);

        let mut spec = CommandSpec::new("psql", operation)
            .args(["-h", &host])
            .args(["-d", db])
            .args(["-v", "ON_ERROR_STOP=1"])
            .arg("-tA")
            .timeout(timeout)
            .stdin_body(sql);
        if let Some(port) = port {
            spec = spec.args(["-p", &port]);
        }
        if let Some(user) = &descriptor.user {
            spec = spec.args(["-U", user]);
        }
        if let Some(password) = &descriptor.password {
            spec = spec.env("PGPASSWORD", password);
        }
        spec
    }

    async fn run_sql(
        &self,
        descriptor: &ConnectionDescriptor,
        maintenance_db: Option<&str>,
        sql: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        self.runner
            .run(self.sql_spec(descriptor, maintenance_db, sql, operation, timeout))
            .await
            .with_context(|| format!("Database client invocation failed (operation={})", operation))
    }

    pub async fn database_exists(&self, descriptor: &ConnectionDescriptor) -> Result<bool> {
        validate_database_name(&descriptor.database)?;
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {};",
            quote_sql_literal(&descriptor.database)
        );
        let out = self
            .run_sql(descriptor, Some("postgres"), &sql, "db_exists", SQL_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!(out.failure_summary("db_exists"));
        }
        Ok(out.stdout.trim() == "1")
    }

    /// Create the instance database. Fails if it already exists; the caller
    /// chooses create-new XOR use-existing up front.
    pub async fn create_database(&self, descriptor: &ConnectionDescriptor) -> Result<()> {
        validate_database_name(&descriptor.database)?;
        info!(
            "[PHASE: database] [STEP: create] Creating database (descriptor={})",
            descriptor.masked()
        );

        let sql = format!(
            "CREATE DATABASE \"{}\" TEMPLATE template0 ENCODING 'UTF8';",
            descriptor.database
        );
        let out = self
            .run_sql(descriptor, Some("postgres"), &sql, "db_create", SQL_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!(out.failure_summary("db_create"));
        }
        Ok(())
    }

    /// Apply the bundled schema script to the instance database.
    ///
    /// The script is written to be re-runnable (CREATE TABLE IF NOT EXISTS
    /// style), which is what makes "apply schema to existing" safe.
    pub async fn apply_schema(
        &self,
        descriptor: &ConnectionDescriptor,
        schema_sql: &str,
    ) -> Result<()> {
        info!(
            "[PHASE: database] [STEP: schema] Applying schema script (descriptor={}, bytes={})",
            descriptor.masked(),
            schema_sql.len()
        );
        let out = self
            .run_sql(descriptor, None, schema_sql, "db_apply_schema", SCHEMA_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!(out.failure_summary("db_apply_schema"));
        }
        Ok(())
    }

    /// Grant the runtime identity access to the instance database.
    pub async fn grant_runtime_access(
        &self,
        descriptor: &ConnectionDescriptor,
        runtime_role: &str,
    ) -> Result<()> {
        validate_database_name(&descriptor.database)?;
        validate_role_name(runtime_role)?;

        let sql = format!(
            "GRANT CONNECT ON DATABASE \"{db}\" TO \"{role}\";\n\
             GRANT USAGE ON SCHEMA public TO \"{role}\";\n\
             GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA public TO \"{role}\";\n\
             ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO \"{role}\";",
            db = descriptor.database,
            role = runtime_role
        );
        let out = self
            .run_sql(descriptor, None, &sql, "db_grant", SQL_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!(out.failure_summary("db_grant"));
        }
        Ok(())
    }

    /// Create the administrative account unless one with this email exists.
    pub async fn create_admin_account(
        &self,
        descriptor: &ConnectionDescriptor,
        email: &str,
        password: &str,
    ) -> Result<()> {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| anyhow::anyhow!("Failed to hash administrator password: {}", e))?;

        let sql = format!(
            "INSERT INTO app_user (email, password_hash, is_admin, created_at)\n\
             SELECT {email}, {hash}, true, now()\n\
             WHERE NOT EXISTS (SELECT 1 FROM app_user WHERE email = {email});",
            email = quote_sql_literal(email),
            hash = quote_sql_literal(&hash)
        );
        let out = self
            .run_sql(descriptor, None, &sql, "db_admin_account", SQL_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!(out.failure_summary("db_admin_account"));
        }
        info!(
            "[PHASE: database] [STEP: admin_account] Administrative account ensured (database={})",
            descriptor.database
        );
        Ok(())
    }

    /// Drop the instance database: terminate active connections, block new
    /// ones, then drop. Returns Ok(false) when the database was already
    /// absent (not an error during teardown).
    pub async fn drop_database(&self, descriptor: &ConnectionDescriptor) -> Result<bool> {
        validate_database_name(&descriptor.database)?;

        if !self.database_exists(descriptor).await? {
            debug!(
                "[PHASE: database] [STEP: drop] Database already absent (database={})",
                descriptor.database
            );
            return Ok(false);
        }

        let db_literal = quote_sql_literal(&descriptor.database);

        // Stop new connections first so terminated sessions cannot reconnect
        // between the two statements.
        let block_sql = format!(
            "ALTER DATABASE \"{}\" WITH ALLOW_CONNECTIONS false;",
            descriptor.database
        );
        let out = self
            .run_sql(
                descriptor,
                Some("postgres"),
                &block_sql,
                "db_block_connections",
                SQL_TIMEOUT,
            )
            .await?;
        if !out.success() {
            warn!(
                "[PHASE: database] [STEP: drop] Could not block connections, continuing: {}",
                out.failure_summary("db_block_connections")
            );
        }

        let terminate_sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = {} AND pid <> pg_backend_pid();",
            db_literal
        );
        let out = self
            .run_sql(
                descriptor,
                Some("postgres"),
                &terminate_sql,
                "db_terminate",
                SQL_TIMEOUT,
            )
            .await?;
        if !out.success() {
            warn!(
                "[PHASE: database] [STEP: drop] Could not terminate sessions, continuing: {}",
                out.failure_summary("db_terminate")
            );
        }

        let drop_sql = format!("DROP DATABASE \"{}\";", descriptor.database);
        let out = self
            .run_sql(descriptor, Some("postgres"), &drop_sql, "db_drop", SQL_TIMEOUT)
            .await?;
        if !out.success() {
            anyhow::bail!(out.failure_summary("db_drop"));
        }

        info!(
            "[PHASE: database] [STEP: drop] Dropped database (database={})",
            descriptor.database
        );
        Ok(true)
    }

    /// Probe a live database for health statistics.
    ///
    /// Never returns `Err`: an unreachable server reads as
    /// `has_database=false`, a failed count reads as -1. The caller races
    /// this whole probe against its own timeout.
    pub async fn probe_health(&self, descriptor: &ConnectionDescriptor) -> DatabaseHealth {
        let exists = match self.probe_exists(descriptor).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(
                    "[PHASE: database] [STEP: probe] Existence probe failed (descriptor={}, err={})",
                    descriptor.masked(),
                    e
                );
                false
            }
        };

        if !exists {
            return DatabaseHealth {
                has_database: false,
                product_count: -1,
                order_count: -1,
                user_count: -1,
            };
        }

        DatabaseHealth {
            has_database: true,
            product_count: self.probe_count(descriptor, "product", "probe_count_products").await,
            order_count: self
                .probe_count(descriptor, "customer_order", "probe_count_orders")
                .await,
            user_count: self.probe_count(descriptor, "app_user", "probe_count_users").await,
        }
    }

    /// Read the shop's company name out of its settings table.
    ///
    /// Used by the reconciler only to fill a gap the store left; a failed
    /// query is simply `None`.
    pub async fn probe_company_name(&self, descriptor: &ConnectionDescriptor) -> Option<String> {
        let sql = "SELECT value FROM shop_setting WHERE name = 'CompanyName' LIMIT 1;";
        match self
            .run_sql(descriptor, None, sql, "probe_company", PROBE_QUERY_TIMEOUT)
            .await
        {
            Ok(out) if out.success() => {
                let value = out.stdout.trim();
                if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            _ => None,
        }
    }

    async fn probe_exists(&self, descriptor: &ConnectionDescriptor) -> Result<bool> {
        validate_database_name(&descriptor.database)?;
        let sql = format!(
            "SELECT 1 FROM pg_database WHERE datname = {};",
            quote_sql_literal(&descriptor.database)
        );
        let out = self
            .run_sql(
                descriptor,
                Some("postgres"),
                &sql,
                "probe_db_exists",
                PROBE_QUERY_TIMEOUT,
            )
            .await?;
        Ok(out.success() && out.stdout.trim() == "1")
    }

    async fn probe_count(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &str,
        operation: &str,
    ) -> i64 {
        let sql = format!("SELECT count(*) FROM {};", table);
        match self
            .run_sql(descriptor, None, &sql, operation, PROBE_QUERY_TIMEOUT)
            .await
        {
            Ok(out) if out.success() => out.stdout.trim().parse::<i64>().unwrap_or(-1),
            Ok(out) => {
                debug!(
                    "[PHASE: database] [STEP: probe] Count query failed ({}): {}",
                    table,
                    out.failure_summary(operation)
                );
                -1
            }
            Err(e) => {
                debug!(
                    "[PHASE: database] [STEP: probe] Count query error ({}): {}",
                    table, e
                );
                -1
            }
        }
    }
}
