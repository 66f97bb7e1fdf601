//! RelayTap - Intercepting TCP Relay
//!
//! Relays one listen port to a fixed target and optionally prints every
//! chunk crossing the relay.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use relaytap::{
    config::ConfigManager,
    output::{self, OutputMode},
    Adaptor, ShutdownCoordinator,
};

/// CLI arguments for RelayTap
#[derive(Parser, Debug)]
#[command(name = "relaytap")]
#[command(about = "RelayTap - Intercepting TCP relay")]
#[command(version)]
#[command(long_about = "
RelayTap - Intercepting TCP relay

Accepts one connection at a time on the listen port, connects it to the
target endpoint and relays bytes in both directions. With an output mode of
b (binary) or s (string) every relayed chunk is printed to the console.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  RELAYTAP_LISTEN_ADDR      - Listen address (e.g., 127.0.0.1:8000)
  RELAYTAP_TARGET_ADDR      - Target address (e.g., 10.0.0.2:502)
  RELAYTAP_TICK_INTERVAL    - Pump tick (e.g., 10ms)
  RELAYTAP_READ_CHUNK_SIZE  - Socket read buffer size in bytes
  RELAYTAP_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
  RELAYTAP_OUTPUT           - Output mode (n, b, s)
")]
pub struct CliArgs {
    /// Port to listen on
    #[arg(help = "Port to listen on")]
    pub listen_port: u16,

    /// Target IP address
    #[arg(help = "Target IP address")]
    pub target_ip: IpAddr,

    /// Target port
    #[arg(help = "Target port")]
    pub target_port: u16,

    /// Output mode: B (binary), S (string) or N (none)
    #[arg(help = "Output mode: B (binary), S (string) or N (none)")]
    pub output: Option<String>,

    /// Listen IP address (defaults to the configured one, 127.0.0.1)
    #[arg(long, help = "Listen IP address")]
    pub listen_ip: Option<IpAddr>,

    /// Configuration file path
    #[arg(short, long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Pump tick interval in milliseconds
    #[arg(long, help = "Pump tick interval in milliseconds")]
    pub tick_ms: Option<u64>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Bootstrap logging; the configured level is swapped in once it is known
    let filter_handle = init_tracing(&bootstrap_level(
        &args,
        std::env::var("RELAYTAP_LOG_LEVEL").ok(),
    ))?;

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::load_from_env()?,
    };

    config.merge_with_cli_args(
        args.listen_ip,
        Some(args.listen_port),
        Some(SocketAddr::new(args.target_ip, args.target_port)),
        args.tick_ms,
        args.output.as_deref().map(OutputMode::from_arg),
    );
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    if let Some(handle) = &filter_handle {
        handle
            .reload(EnvFilter::new(effective_level(&args, &config.logging.level)))
            .context("Failed to apply configured log level")?;
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}", config.adaptor.listen_addr);
        info!("  Target address: {}", config.adaptor.target_addr);
        info!("  Tick interval: {:?}", config.adaptor.tick_interval);
        info!("  Read chunk size: {} bytes", config.adaptor.read_chunk_size);
        info!("  Output mode: {:?}", config.logging.output);
        return Ok(());
    }

    info!("Starting RelayTap v{}", env!("CARGO_PKG_VERSION"));

    let adaptor = Adaptor::from_config(&config.adaptor);
    info!(
        "Relay {} -> {} (tick {:?})",
        adaptor.listen_addr(),
        adaptor.target_addr(),
        adaptor.tick_interval()
    );

    let printer = match config.logging.output {
        OutputMode::None => None,
        mode => {
            let rx = output::install_capture(&adaptor);
            Some(tokio::spawn(output::run_printer(
                rx,
                mode,
                adaptor.listen_addr(),
                adaptor.target_addr(),
            )))
        }
    };

    let shutdown_coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let stopper = shutdown_coordinator.stop_on_shutdown(adaptor.clone());

    let server = adaptor.clone();
    let mut server_handle = tokio::spawn(async move { server.start().await });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to stop");

    let finished = tokio::select! {
        result = &mut server_handle => Some(result),
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
                adaptor.stop();
            }
            None
        }
    };

    // A session blocked on the target connect can outlive the stop request
    let outcome = match finished {
        Some(result) => Ok(result),
        None => tokio::time::timeout(shutdown_coordinator.timeout(), server_handle).await,
    };
    stopper.abort();

    // Hooks hold the capture senders; releasing them lets the printer drain and exit
    adaptor.clear_hooks();
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match outcome {
        Ok(Ok(Ok(()))) => {
            info!("Stopped.");
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            error!("Relay failed: {}", e);
            Err(e.into())
        }
        Ok(Err(e)) => Err(anyhow::anyhow!("Relay task failed: {}", e)),
        Err(_) => {
            error!(
                "Relay did not stop within {:?}, exiting",
                shutdown_coordinator.timeout()
            );
            Ok(())
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn effective_level<'a>(args: &CliArgs, configured_level: &'a str) -> &'a str {
    if args.verbose {
        "debug"
    } else {
        configured_level
    }
}

/// Level used until the configuration has been loaded
fn bootstrap_level(args: &CliArgs, env_level: Option<String>) -> String {
    let level = args
        .log_level
        .clone()
        .or(env_level)
        .unwrap_or_else(|| "info".to_string());
    effective_level(args, &level).to_string()
}

/// Initialize tracing/logging.
///
/// Returns a handle for swapping in the configured level later, or `None`
/// when RUST_LOG governs the filter.
fn init_tracing(log_level: &str) -> Result<Option<FilterHandle>> {
    let (env_filter, reloadable) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new(log_level), true),
    };
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    Ok(reloadable.then_some(handle))
}
