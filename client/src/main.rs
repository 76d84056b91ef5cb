use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use live_roster::config::{ConfigSource, WatchConfig};
use live_roster::LiveRosterChannel;

/// Watch a live roster and log every presence and connectivity change.
#[derive(Parser, Debug)]
#[command(name = "live-roster", version, about)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "roster.toml")]
    config: String,

    /// Roster server URL; overrides the config file.
    #[arg(long)]
    endpoint: Option<String>,

    /// "admin" or "teacher"; overrides the config file.
    #[arg(long)]
    role: Option<String>,

    /// Identity id; overrides the config file.
    #[arg(long)]
    id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = WatchConfig::load(&args.config)?;
    if let Some(endpoint) = args.endpoint {
        config.channel.endpoint = endpoint;
    }
    if let Some(role) = args.role {
        config.channel.role = role;
    }
    if let Some(id) = args.id {
        config.channel.id = id;
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter)),
        )
        .init();

    match config.source {
        ConfigSource::File => info!(path = %args.config, "loaded config file"),
        ConfigSource::Defaults => info!("No config file found at {}, using defaults", args.config),
    }

    let identity = config.identity()?;
    let channel = LiveRosterChannel::with_connector(
        live_roster::transport::ws::WsConnector,
        identity,
        config.channel.endpoint.clone(),
        config.channel_options(),
    )?;

    channel.subscribe(|roster| {
        info!(
            online = roster.len(),
            ids = ?roster.to_sorted_vec(),
            at = %roster.updated_at(),
            "roster updated"
        );
    });
    channel.on_state_change(|change| match change.reason {
        Some(reason) => warn!(state = %change.state, %reason, "connection state changed"),
        None => info!(state = %change.state, "connection state changed"),
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, closing roster channel");
        }
        _ = channel.stopped() => {
            warn!(state = %channel.current_state(), "roster channel stopped, exiting");
        }
    }

    channel.close();
    Ok(())
}
