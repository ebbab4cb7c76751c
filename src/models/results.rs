// Orchestration result models
//
// Every pipeline stage and every migration run reports the same
// (success, message, error) triple; the top-level calls add accumulated
// warnings and a correlation id.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Uniform per-stage result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
        }
    }

    pub fn fail(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// Result of a whole install/uninstall run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal findings; additive, never flip success to failure.
    #[serde(default)]
    pub warnings: Vec<String>,
    pub correlation_id: String,
}

/// Result of one migration engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub success: bool,
    /// Versions applied this run, ascending.
    #[serde(default)]
    pub applied: Vec<u32>,
    /// The version that failed, if any. Execution stops at the first
    /// failure, so there is at most one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u32>,
    pub message: String,
}

impl MigrationOutcome {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Read-only aggregate the reconciler produces per discovered instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingInstallation {
    pub site_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    pub has_database: bool,
    /// -1 means the count query failed.
    pub product_count: i64,
    pub order_count: i64,
    pub user_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub healthy: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ExistingInstallation {
    pub fn unknown(site_name: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            install_path: None,
            version: None,
            db_server: None,
            db_name: None,
            has_database: false,
            product_count: -1,
            order_count: -1,
            user_count: -1,
            company_name: None,
            web_url: None,
            port: None,
            healthy: false,
            issues: Vec::new(),
        }
    }
}

/// Progress event fired synchronously from the pipeline thread before and
/// after each stage. Observers must not block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub correlation_id: String,
    pub step: String,
    pub severity: String, // "info" | "warn" | "error"
    pub phase: String,
    pub percent: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u128>,
}

pub type ProgressEmitter = Arc<dyn Fn(ProgressPayload) + Send + Sync>;

/// Observer that drops all progress events.
pub fn null_progress() -> ProgressEmitter {
    Arc::new(|_payload| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_result_constructors() {
        let ok = StepResult::ok("done");
        assert!(ok.success && ok.error.is_none());

        let fail = StepResult::fail("copy failed", "disk full");
        assert!(!fail.success);
        assert_eq!(fail.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn migration_outcome_counts_applied() {
        let outcome = MigrationOutcome {
            success: true,
            applied: vec![1, 2, 3],
            failed: None,
            message: "Applied 3 migrations".to_string(),
        };
        assert_eq!(outcome.applied_count(), 3);
    }
}
