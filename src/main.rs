//! Camera Relay - on-demand camera capture served over HTTP.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use camera_relay::config::{ConfigLoader, RelayConfig};
use camera_relay::server::{RelayServer, ServerError};
use camera_relay::trace::EVENT_TARGET;

#[derive(Parser)]
#[command(
    name = "camera-relay",
    about = "Raspberry Pi camera relay service",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to .camera-relay.toml, then the user config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind to.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Log every capture, relay and request event.
    #[arg(long, env = "EV_DEBUG")]
    trace_events: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve /stream and /still (the default).
    Serve,
    /// Print the effective configuration as TOML.
    PrintConfig,
}

fn init_tracing(verbosity: u8, trace_events: bool) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let directives = if trace_events {
        format!("{level},{EVENT_TARGET}=debug")
    } else {
        level.to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<RelayConfig, ServerError> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;

    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.trace_events |= cli.trace_events;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.verbose, cli.trace_events);
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.verbose, config.trace_events);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!(
                address = %config.server.address(),
                stream = %config.capture.continuous.program,
                still = %config.capture.snapshot.program,
                trace_events = config.trace_events,
                "Starting camera relay"
            );
            match RelayServer::new(&config).run().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "Camera relay stopped");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::PrintConfig => match toml::to_string_pretty(&config) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to render configuration");
                ExitCode::FAILURE
            }
        },
    }
}
