// Host web-server configuration.
//
// One reverse-proxy site per instance: a config file in the conf directory
// listening on the instance's bound port, proxying to the instance's web
// unit socket. Create/replace semantics; re-running a deployment rewrites
// the file and reloads the server. The reverse-proxy tool itself is driven
// through the command runner.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::process::{CommandRunner, CommandSpec};
use crate::utils::ports::first_free_port;
use crate::utils::validation::site_slug;

const WEB_TOOL_TIMEOUT: Duration = Duration::from_secs(20);
const TLS_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket the instance's web unit listens on, proxied by the site config.
pub fn backend_socket_path(site_name: &str) -> String {
    format!("/run/shopserve/{}.sock", site_slug(site_name))
}

pub fn conf_file_path(conf_dir: &Path, site_name: &str) -> PathBuf {
    conf_dir.join(format!("shopserve-{}.conf", site_slug(site_name)))
}

/// Build the reverse-proxy server block for a site.
///
/// Pure function for testability.
pub fn site_config_text(
    site_name: &str,
    port: u16,
    tls: Option<(&Path, &Path)>,
) -> String {
    let socket = backend_socket_path(site_name);
    let slug = site_slug(site_name);

    let listen_block = match tls {
        Some((cert, key)) => format!(
            "    listen {port} ssl;\n    ssl_certificate {cert};\n    ssl_certificate_key {key};",
            port = port,
            cert = cert.display(),
            key = key.display()
        ),
        None => format!("    listen {};", port),
    };

    format!(
        r#"# Managed by shopserve-installer; site '{slug}'. Do not edit by hand.
server {{
{listen_block}
    server_name {slug};

    access_log off;

    location / {{
        proxy_pass http://unix:{socket};
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
}}
"#,
        slug = slug,
        listen_block = listen_block,
        socket = socket
    )
}

/// Generate a local self-signed certificate for the instance.
pub async fn generate_self_signed_cert(
    runner: &dyn CommandRunner,
    tls_dir: &Path,
    site_name: &str,
) -> Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(tls_dir)
        .await
        .with_context(|| format!("Failed to create TLS directory: {:?}", tls_dir))?;

    let cert = tls_dir.join("site.crt");
    let key = tls_dir.join("site.key");

    let out = runner
        .run(
            CommandSpec::new("openssl", "tls_cert")
                .args([
                    "req",
                    "-x509",
                    "-newkey",
                    "rsa:2048",
                    "-nodes",
                    "-days",
                    "825",
                    "-subj",
                ])
                .arg(format!("/CN={}", site_slug(site_name)))
                .args(["-keyout"])
                .arg(key.to_string_lossy().to_string())
                .args(["-out"])
                .arg(cert.to_string_lossy().to_string())
                .timeout(TLS_TOOL_TIMEOUT),
        )
        .await?;
    if !out.success() {
        anyhow::bail!(out.failure_summary("tls_cert"));
    }

    info!(
        "[PHASE: installation] [STEP: webserver] Generated self-signed certificate (site={}, cert={:?})",
        site_name, cert
    );
    Ok((cert, key))
}

/// Validate the server config, then reload the running server.
pub async fn verify_and_reload(runner: &dyn CommandRunner) -> Result<()> {
    let out = runner
        .run(
            CommandSpec::new("nginx", "web_verify")
                .args(["-t"])
                .timeout(WEB_TOOL_TIMEOUT),
        )
        .await?;
    if !out.success() {
        anyhow::bail!(out.failure_summary("web_verify"));
    }

    let out = runner
        .run(
            CommandSpec::new("nginx", "web_reload")
                .args(["-s", "reload"])
                .timeout(WEB_TOOL_TIMEOUT),
        )
        .await?;
    if !out.success() {
        anyhow::bail!(out.failure_summary("web_reload"));
    }
    Ok(())
}

/// Create or replace the instance's site binding.
///
/// Picks the first free port at or above `requested_port` and returns the
/// chosen port; the caller records it in the instance record and reports it
/// back. Idempotent: an existing config file for the site is overwritten.
pub async fn configure_site(
    runner: &dyn CommandRunner,
    conf_dir: &Path,
    install_path: &Path,
    site_name: &str,
    requested_port: u16,
    enable_https: bool,
) -> Result<u16> {
    let chosen_port = first_free_port(requested_port)?;
    if chosen_port != requested_port {
        info!(
            "[PHASE: installation] [STEP: webserver] Requested port {} is occupied; using {} (site={})",
            requested_port, chosen_port, site_name
        );
    }

    let tls_paths = if enable_https {
        let tls_dir = install_path.join("tls");
        Some(generate_self_signed_cert(runner, &tls_dir, site_name).await?)
    } else {
        None
    };

    let text = site_config_text(
        site_name,
        chosen_port,
        tls_paths.as_ref().map(|(c, k)| (c.as_path(), k.as_path())),
    );

    tokio::fs::create_dir_all(conf_dir)
        .await
        .with_context(|| format!("Failed to create conf directory: {:?}", conf_dir))?;
    let conf_path = conf_file_path(conf_dir, site_name);
    tokio::fs::write(&conf_path, text)
        .await
        .with_context(|| format!("Failed to write site config: {:?}", conf_path))?;

    verify_and_reload(runner).await?;

    info!(
        "[PHASE: installation] [STEP: webserver] Site configured (site={}, port={}, https={})",
        site_name, chosen_port, enable_https
    );
    Ok(chosen_port)
}

/// Remove the instance's site binding. Best-effort reload afterwards.
pub async fn remove_site(runner: &dyn CommandRunner, conf_dir: &Path, site_name: &str) -> Result<bool> {
    let conf_path = conf_file_path(conf_dir, site_name);
    let removed = match tokio::fs::remove_file(&conf_path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to remove site config: {:?}", conf_path))
        }
    };

    if removed {
        if let Err(e) = verify_and_reload(runner).await {
            debug!(
                "[PHASE: installation] [STEP: webserver] Reload after site removal failed: {}",
                e
            );
        }
    }
    Ok(removed)
}

/// True when the site's config file exists (used by uninstall verification).
pub async fn site_exists(conf_dir: &Path, site_name: &str) -> bool {
    tokio::fs::try_exists(conf_file_path(conf_dir, site_name))
        .await
        .unwrap_or(false)
}
