use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uproxy::config::{self, Config, PolicyList};
use uproxy::dataplane::{Engine, PolicyTable};
use uproxy::device::DeviceKind;
use uproxy::telemetry::init_logging;

#[derive(Parser)]
#[command(name = "uproxy")]
#[command(about = "A user-space IP packet router and tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Validate config.toml and print the effective policy table
    Check {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Check { config }) => cmd_check(&config),
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(Path::new("config.toml")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_check(config_path: &Path) -> Result<(), String> {
    let config = config::load(config_path)
        .map_err(|e| format!("Failed to load {}: {}", config_path.display(), e))?;

    let result = config::validate(&config);
    result.print_diagnostics();
    if result.has_errors() {
        return Err(format!(
            "{}: {} error(s)",
            config_path.display(),
            result.errors.len()
        ));
    }

    let mut kinds = vec![DeviceKind::Drop, DeviceKind::Tunnel, DeviceKind::Proxy];
    if config.tun.is_some() {
        kinds.push(DeviceKind::Local);
    }
    let table = PolicyTable::build(&config.policies, &kinds);
    let policies = table.to_config();
    let rendered = toml::to_string(&PolicyList {
        policies: &policies,
    })
    .map_err(|e| format!("Failed to render policies: {}", e))?;

    println!(
        "{} is valid ({} of {} policies usable)",
        config_path.display(),
        table.len(),
        config.policies.len()
    );
    print!("{}", rendered);
    Ok(())
}

fn cmd_run(config_path: &Path) -> Result<(), String> {
    let config = config::load(config_path)
        .map_err(|e| format!("Failed to load {}: {}", config_path.display(), e))?;

    // RUST_LOG takes priority over [log]
    init_logging(config.log.as_ref());

    let result = config::validate(&config);
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    if result.has_errors() {
        for e in &result.errors {
            error!("{}", e);
        }
        return Err(format!("invalid configuration in {}", config_path.display()));
    }

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<(), String> {
    let cancel = CancellationToken::new();
    let engine = Engine::from_config(&config, cancel.clone()).map_err(|e| e.to_string())?;

    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown requested");
        cancel.cancel();
    });

    info!("uproxy starting on {}", config.address);
    engine.run().await.map_err(|e| e.to_string())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
