//! detonator CLI - run the sandbox daemon or check a configuration.
//!
//! Exit codes: 0 success, 2 configuration error, 3 runtime error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use detonator::config::load_config;
use detonator::controller::vboxmanage::VBoxManage;
use detonator::controller::VmController;
use detonator::orchestrator::Orchestrator;
use detonator::store::ResultStore;

const EXIT_CONFIG: i32 = 2;
const EXIT_RUNTIME: i32 = 3;

#[derive(Parser)]
#[command(name = "detonator", version, about = "Automated malware detonation sandbox")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "DETONATOR_CONFIG", default_value = "detonator.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API and the analysis orchestrator
    Serve {
        /// Append logs to this file in addition to stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Validate the configuration and verify the configured VMs exist
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { log_file } => {
            // The appender guard must outlive the server loop.
            let _guard = init_logging(log_file.as_deref());
            if let Err(code) = serve(&cli.config).await {
                process::exit(code);
            }
        }
        Command::CheckConfig => {
            init_stderr_logging();
            process::exit(check_config(&cli.config).await);
        }
    }
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn init_logging(
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().map(PathBuf::from).unwrap_or_else(|| "detonator.log".into());
            let appender = tracing_appender::rolling::never(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

async fn serve(config_path: &std::path::Path) -> Result<(), i32> {
    let config = load_config(config_path).map_err(|err| {
        error!(%err, "configuration rejected");
        EXIT_CONFIG
    })?;

    if let Err(err) = std::fs::create_dir_all(&config.server.upload_dir) {
        error!(dir = %config.server.upload_dir.display(), %err, "cannot create upload directory");
        return Err(EXIT_RUNTIME);
    }

    let controller = Arc::new(VBoxManage::new(config.vbox_manage_path.clone()));
    preflight(controller.as_ref(), &config).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(vms = config.vms.len(), %addr, "starting detonator");

    let orchestrator = Orchestrator::start(config, controller, ResultStore::new());
    detonator::server::serve(addr, orchestrator).await.map_err(|err| {
        error!(%err, "server terminated");
        EXIT_RUNTIME
    })
}

/// Warn early about configured VMs the platform does not know; analyses
/// against them would only fail later inside a pipeline.
async fn preflight(controller: &VBoxManage, config: &detonator::config::Config) {
    match controller.list_vms().await {
        Ok(registered) => {
            for vm in &config.vms {
                if !registered.iter().any(|name| *name == vm.name) {
                    warn!(vm = %vm.name, "configured VM is not registered with the platform");
                }
            }
        }
        Err(err) => warn!(%err, "could not list platform VMs; skipping preflight"),
    }
}

async fn check_config(config_path: &std::path::Path) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration rejected");
            return EXIT_CONFIG;
        }
    };
    println!(
        "configuration ok: {} VMs, queue {}, {} concurrent pipelines",
        config.vms.len(),
        config.analysis.queue_size,
        config.analysis.max_concurrent_tasks
    );

    let controller = VBoxManage::new(config.vbox_manage_path.clone());
    match controller.list_vms().await {
        Ok(registered) => {
            let mut missing = 0;
            for vm in &config.vms {
                if registered.iter().any(|name| *name == vm.name) {
                    println!("  vm '{}' ({}): registered", vm.name, vm.agent);
                } else {
                    println!("  vm '{}' ({}): NOT REGISTERED", vm.name, vm.agent);
                    missing += 1;
                }
            }
            if missing > 0 {
                return EXIT_RUNTIME;
            }
        }
        Err(err) => {
            error!(%err, "virtualization CLI unavailable");
            return EXIT_RUNTIME;
        }
    }
    0
}
