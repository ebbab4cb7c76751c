// Thin CLI over the deployer library.
//
// Flag parsing stays deliberately simple (match on raw args, like the rest
// of the tooling around this product); all real behavior lives in the
// library so it stays testable without a terminal.

use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use shopserve_installer::models::results::ProgressEmitter;
use shopserve_installer::process::SystemCommandRunner;
use shopserve_installer::utils::path_resolver::{resolve_bundle_folder, DeployerPaths};
use shopserve_installer::{
    InstallOrchestrator, InstallRequest, PipelineReport, Reconciler, UninstallOrchestrator,
    UninstallRequest,
};

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn print_usage() {
    eprintln!("ShopServe instance deployer");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  shopserve-installer --install --site <name> --path <dir> --db-server <host> --db-name <db> [options]");
    eprintln!("  shopserve-installer --uninstall --site <name> [--remove-db] [--keep-user-data]");
    eprintln!("  shopserve-installer --maintain <name>");
    eprintln!("  shopserve-installer --detect");
    eprintln!("  shopserve-installer --uninstall-program");
    eprintln!();
    eprintln!("INSTALL OPTIONS:");
    eprintln!("  --company <name>         company metadata");
    eprintln!("  --admin-email <email>    administrative account (with --admin-password)");
    eprintln!("  --admin-password <pw>");
    eprintln!("  --bundle <dir>           application bundle (default: next to the binary)");
    eprintln!("  --new-db                 create the database instead of using an existing one");
    eprintln!("  --db-user <user> / --db-password <pw>");
    eprintln!("  --https                  provision a TLS binding with a local certificate");
    eprintln!("  --port <port>            requested port (first free port at or above it is used)");
    eprintln!("  --product-version <v>    version string recorded for the instance");
    eprintln!("  --dry-run                simulate the pipeline without mutating anything");
}

fn console_progress() -> (ProgressEmitter, ProgressBar) {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let bar_for_events = bar.clone();
    let emitter: ProgressEmitter = Arc::new(move |payload| {
        bar_for_events.set_position(payload.percent.clamp(0, 100) as u64);
        match payload.severity.as_str() {
            "warn" => bar_for_events.println(format!("warning: {}", payload.message)),
            "error" => bar_for_events.println(format!("error: {}", payload.message)),
            _ => {}
        }
        bar_for_events.set_message(payload.message.clone());
    });
    (emitter, bar)
}

fn report_outcome(what: &str, report: &PipelineReport) -> i32 {
    if report.success {
        println!("{} succeeded: {}", what, report.message);
    } else {
        println!(
            "{} FAILED: {} ({})",
            what,
            report.message,
            report.error.as_deref().unwrap_or("no detail")
        );
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    if report.success {
        0
    } else {
        1
    }
}

fn warn_missing_tools() {
    for tool in ["psql", "nginx", "systemctl"] {
        if which::which(tool).is_err() {
            eprintln!(
                "note: '{}' was not found on PATH; the install pipeline will fail its prerequisites check",
                tool
            );
        }
    }
}

async fn run_install(args: &[String], paths: DeployerPaths) -> i32 {
    let Some(site_name) = flag_value(args, "--site") else {
        eprintln!("--install requires --site <name>");
        return 2;
    };
    let Some(install_path) = flag_value(args, "--path") else {
        eprintln!("--install requires --path <dir>");
        return 2;
    };
    let Some(db_server) = flag_value(args, "--db-server") else {
        eprintln!("--install requires --db-server <host>");
        return 2;
    };
    let Some(db_name) = flag_value(args, "--db-name") else {
        eprintln!("--install requires --db-name <db>");
        return 2;
    };

    let bundle_path = match flag_value(args, "--bundle").map(PathBuf::from) {
        Some(p) => p,
        None => match resolve_bundle_folder() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{:#}", e);
                return 2;
            }
        },
    };

    let requested_port = flag_value(args, "--port")
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    let request = InstallRequest {
        site_name,
        company_name: flag_value(args, "--company"),
        admin_email: flag_value(args, "--admin-email"),
        admin_password: flag_value(args, "--admin-password"),
        install_path: PathBuf::from(install_path),
        bundle_path,
        db_server,
        db_name,
        create_database: has_flag(args, "--new-db"),
        db_user: flag_value(args, "--db-user"),
        db_password: flag_value(args, "--db-password"),
        runtime_role: flag_value(args, "--runtime-role")
            .unwrap_or_else(|| "shopserve_app".to_string()),
        enable_https: has_flag(args, "--https"),
        requested_port,
        product_version: flag_value(args, "--product-version")
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        dry_run: has_flag(args, "--dry-run"),
    };

    warn_missing_tools();

    let orchestrator = InstallOrchestrator::new(paths, Arc::new(SystemCommandRunner));
    let (progress, bar) = console_progress();
    let report = orchestrator.install(request, &progress).await;
    bar.finish_and_clear();
    report_outcome("Install", &report)
}

async fn run_uninstall(args: &[String], paths: DeployerPaths) -> i32 {
    let Some(site_name) = flag_value(args, "--site") else {
        eprintln!("--uninstall requires --site <name>");
        return 2;
    };

    let mut request = UninstallRequest::for_site(&site_name);
    request.remove_database = has_flag(args, "--remove-db");
    request.keep_user_data = has_flag(args, "--keep-user-data");
    request.db_server = flag_value(args, "--db-server");
    request.db_name = flag_value(args, "--db-name");
    request.db_user = flag_value(args, "--db-user");
    request.db_password = flag_value(args, "--db-password");
    request.dry_run = has_flag(args, "--dry-run");

    let orchestrator = UninstallOrchestrator::new(paths, Arc::new(SystemCommandRunner));
    let (progress, bar) = console_progress();
    let report = orchestrator.uninstall(request, &progress).await;
    bar.finish_and_clear();
    report_outcome("Uninstall", &report)
}

async fn run_maintain(site_name: &str, args: &[String], paths: DeployerPaths) -> i32 {
    let bundle_path = match flag_value(args, "--bundle").map(PathBuf::from) {
        Some(p) => p,
        None => match resolve_bundle_folder() {
            Ok(p) => p,
            Err(e) => {
                eprintln!("{:#}", e);
                return 2;
            }
        },
    };

    let orchestrator = InstallOrchestrator::new(paths, Arc::new(SystemCommandRunner));
    let (progress, bar) = console_progress();
    let result = orchestrator
        .reconfigure(site_name, bundle_path, &progress)
        .await;
    bar.finish_and_clear();

    match result {
        Ok(report) => report_outcome("Reconfigure", &report),
        Err(e) => {
            eprintln!("Reconfigure failed: {:#}", e);
            1
        }
    }
}

async fn run_detect(paths: DeployerPaths) -> i32 {
    let reconciler = Reconciler::new(&paths, Arc::new(SystemCommandRunner));
    let found = reconciler.detect_all().await;

    if found.is_empty() {
        println!("No installed instances were found.");
        return 0;
    }

    for view in &found {
        let health = if view.healthy { "healthy" } else { "UNHEALTHY" };
        println!(
            "{} [{}] v{} at {}",
            view.site_name,
            health,
            view.version.as_deref().unwrap_or("?"),
            view.install_path.as_deref().unwrap_or("?"),
        );
        if let (Some(server), Some(db)) = (&view.db_server, &view.db_name) {
            println!(
                "  database {}/{} (products={}, orders={}, users={})",
                server, db, view.product_count, view.order_count, view.user_count
            );
        }
        if let Some(url) = &view.web_url {
            println!("  url {}", url);
        }
        for issue in &view.issues {
            println!("  issue: {}", issue);
        }
    }
    0
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let paths = match DeployerPaths::resolve() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Could not resolve deployer paths: {:#}", e);
            std::process::exit(2);
        }
    };

    // stdout belongs to the progress bar during pipelines.
    if let Err(e) = shopserve_installer::init_logging(&paths.log_folder, false) {
        eprintln!("Could not initialize logging: {}", e);
        std::process::exit(2);
    }

    let code = if has_flag(&args, "--install") {
        run_install(&args, paths).await
    } else if has_flag(&args, "--uninstall-program") {
        let orchestrator = UninstallOrchestrator::new(paths, Arc::new(SystemCommandRunner));
        let report = orchestrator.uninstall_program().await;
        report_outcome("Tool uninstall", &report)
    } else if has_flag(&args, "--uninstall") {
        run_uninstall(&args, paths).await
    } else if let Some(site) = flag_value(&args, "--maintain") {
        run_maintain(&site, &args, paths).await
    } else if has_flag(&args, "--detect") {
        run_detect(paths).await
    } else {
        print_usage();
        2
    };

    std::process::exit(code);
}
