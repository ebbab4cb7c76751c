// Service management for instance units.
//
// Each instance owns two units: the web application unit (the process behind
// the reverse-proxy site) and the background tasks worker. Unit files are
// written into the configured unit directory; all `systemctl` calls go
// through the command runner.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::process::{CommandRunner, CommandSpec};
use crate::utils::validation::site_slug;

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Unit name of the web application for a site.
pub fn web_unit_name(site_name: &str) -> String {
    format!("shopserve-web-{}", site_slug(site_name))
}

/// Unit name of the background tasks worker for a site.
pub fn tasks_unit_name(site_name: &str) -> String {
    format!("shopserve-tasks-{}", site_slug(site_name))
}

/// Build a systemd unit file text for a service.
///
/// This is a pure function for testability.
/// Paths are quoted to handle spaces correctly (systemd supports quoted arguments).
pub fn build_systemd_unit_text(
    service_name: &str,
    description: &str,
    exec_path: &Path,
    working_dir: &Path,
    user: Option<&str>,
) -> String {
    let exec_str = exec_path.to_string_lossy();
    let work_str = working_dir.to_string_lossy();

    let exec_quoted = quote_systemd_path(&exec_str);
    let work_quoted = quote_systemd_path(&work_str);

    let user_line = match user {
        Some(u) => format!("User={}\n", u),
        None => String::new(),
    };

    format!(
        r#"[Unit]
Description={description} ({service_name})
After=network.target

[Service]
Type=simple
WorkingDirectory={work_quoted}
ExecStart={exec_quoted}
Restart=always
RestartSec=5
{user_line}
[Install]
WantedBy=multi-user.target
"#,
        description = description,
        service_name = service_name,
        work_quoted = work_quoted,
        exec_quoted = exec_quoted,
        user_line = user_line.trim_end(),
    )
}

/// Quote a path for systemd unit files if it contains spaces or special characters.
fn quote_systemd_path(path: &str) -> String {
    if path.contains(' ') || path.contains('\t') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

pub fn unit_file_path(unit_dir: &Path, unit_name: &str) -> PathBuf {
    unit_dir.join(format!("{}.service", unit_name))
}

async fn run_systemctl(
    runner: &dyn CommandRunner,
    args: &[&str],
    operation: &str,
) -> Result<()> {
    let mut all_args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    // --no-pager prevents blocking on interactive pager
    all_args.push("--no-pager".to_string());

    let out = runner
        .run(
            CommandSpec::new("systemctl", operation)
                .args(all_args)
                .timeout(SYSTEMCTL_TIMEOUT),
        )
        .await?;
    if !out.success() {
        anyhow::bail!(out.failure_summary(operation));
    }
    Ok(())
}

/// Check whether a unit is active.
pub async fn is_unit_running(runner: &dyn CommandRunner, unit_name: &str) -> Result<bool> {
    let out = runner
        .run(
            CommandSpec::new("systemctl", "svc_is_active")
                .args(["is-active", "--no-pager", unit_name])
                .timeout(Duration::from_secs(15)),
        )
        .await;

    match out {
        Ok(out) => Ok(out.stdout.trim().eq_ignore_ascii_case("active")),
        Err(e) => {
            debug!(
                "[PHASE: installation] [STEP: service] is-active errored, treating as not running (unit={}, err={})",
                unit_name, e
            );
            Ok(false)
        }
    }
}

/// Install (or replace) a unit, then enable and start it.
///
/// Any pre-existing unit of the same name is stopped and removed first so a
/// re-install always ends with the fresh definition running.
pub async fn install_and_start_unit(
    runner: &dyn CommandRunner,
    unit_dir: &Path,
    unit_name: &str,
    unit_text: &str,
) -> Result<()> {
    stop_and_remove_unit(runner, unit_dir, unit_name).await;

    tokio::fs::create_dir_all(unit_dir)
        .await
        .with_context(|| format!("Failed to create unit directory: {:?}", unit_dir))?;
    let path = unit_file_path(unit_dir, unit_name);
    tokio::fs::write(&path, unit_text)
        .await
        .with_context(|| format!("Failed to write unit file: {:?}", path))?;

    info!(
        "[PHASE: installation] [STEP: service] Wrote unit file: {:?}",
        path
    );

    run_systemctl(runner, &["daemon-reload"], "svc_daemon_reload").await?;
    run_systemctl(runner, &["enable", unit_name], "svc_enable").await?;
    run_systemctl(runner, &["restart", unit_name], "svc_restart").await?;

    let running = is_unit_running(runner, unit_name).await?;
    if !running {
        anyhow::bail!("Unit '{}' is not running after start", unit_name);
    }

    Ok(())
}

/// Stop a unit. Failures are logged, not escalated (teardown keeps going).
pub async fn stop_unit(runner: &dyn CommandRunner, unit_name: &str) {
    if let Err(e) = run_systemctl(runner, &["stop", unit_name], "svc_stop").await {
        debug!(
            "[PHASE: installation] [STEP: service] stop failed (unit={}, err={})",
            unit_name, e
        );
    }
}

/// Stop, disable and delete a unit. Best-effort: a unit that does not exist
/// is not an error.
pub async fn stop_and_remove_unit(runner: &dyn CommandRunner, unit_dir: &Path, unit_name: &str) {
    stop_unit(runner, unit_name).await;
    if let Err(e) = run_systemctl(runner, &["disable", unit_name], "svc_disable").await {
        debug!(
            "[PHASE: installation] [STEP: service] disable failed (unit={}, err={})",
            unit_name, e
        );
    }

    let path = unit_file_path(unit_dir, unit_name);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            if let Err(e) = run_systemctl(runner, &["daemon-reload"], "svc_daemon_reload").await {
                warn!(
                    "[PHASE: installation] [STEP: service] daemon-reload after unit removal failed: {}",
                    e
                );
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(
                "[PHASE: installation] [STEP: service] Could not remove unit file {:?}: {}",
                path, e
            );
        }
    }
}
