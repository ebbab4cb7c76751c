// Orchestration request models

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_port() -> u16 {
    8080
}

fn default_runtime_role() -> String {
    "shopserve_app".to_string()
}

/// Everything the install pipeline needs, dry-run flag included (no ambient
/// global state).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub site_name: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub admin_email: Option<String>,
    /// Plaintext only in memory; never logged, never persisted.
    #[serde(default)]
    pub admin_password: Option<String>,
    pub install_path: PathBuf,
    /// Source application tree shipped next to the deployer.
    pub bundle_path: PathBuf,
    pub db_server: String,
    pub db_name: String,
    /// true = create a new database; false = apply schema to the existing one.
    #[serde(default)]
    pub create_database: bool,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    /// Role granted runtime access to the instance database.
    #[serde(default = "default_runtime_role")]
    pub runtime_role: String,
    #[serde(default)]
    pub enable_https: bool,
    #[serde(default = "default_port")]
    pub requested_port: u16,
    pub product_version: String,
    #[serde(default)]
    pub dry_run: bool,
}

/// Uninstall pipeline input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallRequest {
    pub site_name: String,
    #[serde(default)]
    pub remove_database: bool,
    /// Preserve user data directories under the install path.
    #[serde(default)]
    pub keep_user_data: bool,
    /// Directories (relative to the install path) preserved when
    /// `keep_user_data` is set.
    #[serde(default = "UninstallRequest::default_keep_paths")]
    pub keep_paths: Vec<String>,
    #[serde(default)]
    pub db_server: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl UninstallRequest {
    pub fn default_keep_paths() -> Vec<String> {
        vec![
            "App_Data/uploads".to_string(),
            "App_Data/backups".to_string(),
        ]
    }

    pub fn for_site(site_name: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            remove_database: false,
            keep_user_data: false,
            keep_paths: Self::default_keep_paths(),
            db_server: None,
            db_name: None,
            db_user: None,
            db_password: None,
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_request_deserializes_with_defaults() {
        let req: InstallRequest = serde_json::from_str(
            r#"{
                "siteName": "DemoShop",
                "installPath": "/srv/shops/demoshop",
                "bundlePath": "/opt/shopserve-installer/bundle",
                "dbServer": "localhost",
                "dbName": "DemoShopDb",
                "productVersion": "4.2.0"
            }"#,
        )
        .expect("deserialize");

        assert_eq!(req.requested_port, 8080);
        assert_eq!(req.runtime_role, "shopserve_app");
        assert!(!req.create_database);
        assert!(!req.dry_run);
    }

    #[test]
    fn uninstall_request_default_keep_paths() {
        let req = UninstallRequest::for_site("DemoShop");
        assert!(req.keep_paths.iter().any(|p| p.contains("uploads")));
    }
}
