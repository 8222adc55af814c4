//! `tinkerbus` – bridge a bricklet stack onto a JSON-lines bus.
//!
//! This binary:
//!
//! 1. Loads `~/.tinkerbus/config.toml` (or `--config PATH`), falling back to
//!    defaults, and applies `TINKERBUS_*` overrides.
//! 2. Connects a [`StackManager`] to the brick daemon, or to a built-in
//!    simulated stack with `--simulate`.
//! 3. Runs one device service per discovered device, reading intents from
//!    stdin and writing events to stdout, one JSON object per line.
//! 4. Shuts everything down on Ctrl-C.
//!
//! Logs go to stderr so stdout stays a clean event stream.

mod bridge;
mod config;
mod demo;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tinkerbus_hal::{IpConnection, SimStack, StackConnection};
use tinkerbus_middleware::{EventBus, ServiceManager};
use tinkerbus_stack::{StackListener, StackManager};
use tinkerbus_types::TinkerError;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bridge a bricklet stack onto a JSON-lines intent/event bus.
#[derive(Parser, Debug)]
#[command(name = "tinkerbus", version, about)]
struct Cli {
    /// Config file (defaults to ~/.tinkerbus/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the built-in simulated stack instead of a brick daemon
    #[arg(long)]
    simulate: bool,

    /// Only forward events whose sender starts with this prefix
    #[arg(long, default_value = "")]
    filter: String,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

fn init_tracing() {
    // RUST_LOG wins; TINKERBUS_LOG_FORMAT=json switches to one JSON object
    // per log line.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("TINKERBUS_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", "error".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), TinkerError> {
    let cfg = config::load(cli.config.as_deref())?;

    if cli.init_config {
        let path = cli.config.clone().unwrap_or_else(config::config_path);
        config::save_to(&cfg, &path)?;
        eprintln!("  Config written to {}", path.display().to_string().bold());
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let connection: Arc<dyn StackConnection> = if cli.simulate || cfg.simulate {
        let sim = SimStack::new();
        demo::populate(&sim);
        tokio::spawn(demo::drive(sim.clone(), cancel.child_token()));
        eprintln!("{}", "  Running against the simulated stack.".yellow());
        sim.connection()
    } else {
        Arc::new(IpConnection::new())
    };

    let bus = EventBus::new(cfg.bus_capacity);
    let services = Arc::new(ServiceManager::new(bus.clone()));
    let stack = StackManager::for_endpoint(
        cfg.host.clone(),
        cfg.port,
        connection,
        Arc::clone(&services) as Arc<dyn StackListener>,
    )?;

    let events = tokio::spawn(bridge::pump_events(
        bus.subscribe_events_from(cli.filter.clone()),
        tokio::io::stdout(),
        cancel.child_token(),
    ));
    let intents_bus = bus.clone();
    tokio::spawn(async move {
        match bridge::pump_intents(BufReader::new(tokio::io::stdin()), &intents_bus).await {
            Ok(count) => info!(count, "stdin closed"),
            Err(err) => warn!(error = %err, "reading intents failed"),
        }
    });

    stack.connect().await?;
    eprintln!(
        "  Connected to {} ({} device(s))",
        stack.address().to_string().bold(),
        stack.connected_devices().len()
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; shutting down");
    }
    eprintln!("{}", "  Ctrl-C received, shutting down …".yellow().bold());

    cancel.cancel();
    services.shutdown().await;
    if let Err(err) = stack.disconnect().await {
        warn!(error = %err, "disconnect failed");
    }
    stack.shutdown().await;
    match events.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "writing events failed"),
        Err(err) => warn!(error = %err, "event writer ended abnormally"),
    }
    eprintln!("{}", "  ✓ Stopped.".green());
    Ok(())
}
