// Path resolution for the deployer's own folders.
//
// All locations can be overridden through environment variables so smoke
// tests and packaging runs never touch the real host directories.

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Resolved set of host paths the deployer works against.
#[derive(Debug, Clone)]
pub struct DeployerPaths {
    /// Root of the persistent instance store (`instances/`, `programs.json`,
    /// `pending_deletes.json`, `secrets/`).
    pub store_root: PathBuf,
    /// Store root used by pre-2.x releases of the deployer; consulted
    /// read-only during detection so older instances are not missed.
    pub legacy_store_root: PathBuf,
    /// Folder for the dual-format log files.
    pub log_folder: PathBuf,
    /// Directory the reverse-proxy site configs are written into.
    pub webserver_conf_dir: PathBuf,
    /// Directory the service unit files are written into.
    pub unit_dir: PathBuf,
}

impl DeployerPaths {
    /// Resolve from the environment, falling back to the standard host
    /// layout (or the user's local data directory when running unprivileged).
    pub fn resolve() -> Result<Self> {
        let store_root = env_path("SHOPSERVE_STORE_ROOT").unwrap_or_else(default_store_root);
        let legacy_store_root = env_path("SHOPSERVE_LEGACY_STORE_ROOT")
            .unwrap_or_else(|| PathBuf::from("/var/lib/shopserve"));
        let log_folder =
            env_path("SHOPSERVE_LOG_FOLDER").unwrap_or_else(|| store_root.join("logs"));
        let webserver_conf_dir = env_path("SHOPSERVE_WEB_CONF_DIR")
            .unwrap_or_else(|| PathBuf::from("/etc/nginx/conf.d"));
        let unit_dir = env_path("SHOPSERVE_UNIT_DIR")
            .unwrap_or_else(|| PathBuf::from("/etc/systemd/system"));

        Ok(Self {
            store_root,
            legacy_store_root,
            log_folder,
            webserver_conf_dir,
            unit_dir,
        })
    }

    /// All paths under one base directory. Used by tests and dry-runs.
    pub fn under(base: &Path) -> Self {
        Self {
            store_root: base.join("store"),
            legacy_store_root: base.join("store-legacy"),
            log_folder: base.join("logs"),
            webserver_conf_dir: base.join("web-conf"),
            unit_dir: base.join("units"),
        }
    }

    /// Path of the deferred-deletion journal.
    pub fn pending_deletes_file(&self) -> PathBuf {
        self.store_root.join("pending_deletes.json")
    }

    /// Path of the secret codec's master key file.
    pub fn master_key_file(&self) -> PathBuf {
        self.store_root.join("secrets").join("master_key.b64")
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn default_store_root() -> PathBuf {
    let system_root = PathBuf::from("/var/lib/shopserve-installer");
    if system_root.exists() {
        return system_root;
    }
    // Unprivileged runs (operator shells, CI) keep the store under the
    // user's data directory instead of failing on /var/lib permissions.
    match dirs::data_local_dir() {
        Some(base) => base.join("shopserve-installer"),
        None => system_root,
    }
}

/// Resolve the folder the deployer binary is running from.
pub fn resolve_deployment_folder() -> Result<PathBuf> {
    // Prefer the folder where the binary is running from (works in dev and deployed)
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            return Ok(dir.to_path_buf());
        }
    }

    // Fallback: current working directory
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    Ok(cwd)
}

/// Resolve the release bundle shipped next to the deployer binary.
///
/// The bundle is the application tree that file deployment copies into the
/// instance's install path.
pub fn resolve_bundle_folder() -> Result<PathBuf> {
    let deployment = resolve_deployment_folder()?;
    let bundle = deployment.join("bundle");
    if bundle.is_dir() {
        return Ok(bundle);
    }
    Err(anyhow::anyhow!(
        "Release bundle not found next to the deployer: {:?}",
        bundle
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_keeps_everything_below_base() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = DeployerPaths::under(tmp.path());
        assert!(paths.store_root.starts_with(tmp.path()));
        assert!(paths.legacy_store_root.starts_with(tmp.path()));
        assert!(paths.pending_deletes_file().starts_with(tmp.path()));
        assert!(paths.master_key_file().starts_with(&paths.store_root));
    }
}
