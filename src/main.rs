use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use torns::controller::tor::{TorConfig, TorController};
use torns::{
    AttachFilter, BootstrapMonitor, BrokerConfig, BrokerError, LifecycleHooks, Result,
    StreamAttacher,
};

#[derive(Parser)]
#[command(
    name = "torns",
    version,
    about = "torns — resolve custom onion names through plugin processes"
)]
struct Cli {
    /// Config file, or a directory of *.json fragments merged in name order
    #[arg(short, long, default_value = "torns.json")]
    config: PathBuf,

    /// Control port address (overrides controlAddress)
    #[arg(long)]
    control: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("[torns] {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BrokerConfig::load(&cli.config)?;
    if let Some(control) = cli.control {
        config.control_address = control;
    }
    let config = Arc::new(config);

    let controller = Arc::new(connect(&config).await?);

    if !controller.leaves_streams_unattached().await? {
        return Err(BrokerError::Config(
            "the daemon must run with __LeaveStreamsUnattached 1".to_string(),
        ));
    }

    let version = controller.version().await?;
    let filter = AttachFilter::for_version(&version);
    tracing::info!(version = %version, filter = ?filter, "Controller ready");

    let hooks = Arc::new(LifecycleHooks::from_config(&config));
    let monitor = BootstrapMonitor::new(hooks.clone());

    // Subscribe before reading the phase so no progress report is missed
    let mut events = controller.events().await?;
    if let Some(status) = controller.bootstrap_phase().await? {
        monitor.observe(&status);
    }

    let attacher = Arc::new(StreamAttacher::new(controller.clone(), config.clone(), filter));
    let completions = attacher.spawn_completion_loop();

    tokio::select! {
        _ = attacher.serve(&mut events, &monitor, &hooks) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down");
        }
    }

    if let Some(handle) = completions {
        handle.abort();
    }
    attacher.shutdown().await;
    Ok(())
}

/// Connect and authenticate, retrying while the control port is unreachable
async fn connect(config: &BrokerConfig) -> Result<TorController> {
    let tor = TorConfig::from_broker(config);
    loop {
        match TorController::connect(tor.clone()).await {
            Ok(controller) => return Ok(controller),
            Err(BrokerError::Connection(reason)) => {
                tracing::warn!(
                    address = %tor.address,
                    reason = %reason,
                    "Control port unavailable; retrying"
                );
                tokio::time::sleep(config.connect_retry()).await;
            }
            Err(e) => return Err(e),
        }
    }
}
