use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::Rng;
use std::sync::Arc;

use beach_tide::cli::Cli;
use beach_tide::config::ClientConfig;
use beach_tide::negotiation::{PeerFactory, RtcPeerFactory};
use beach_tide::orchestrator::{self, Orchestrator};
use beach_tide::replay;
use beach_tide::telemetry::logging;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("beach-tide: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = cli.client_config(ClientConfig::from_env());
    let options = cli.replay_options(&config);
    let recording = match &cli.recording {
        Some(source) => replay::load(source)
            .await
            .with_context(|| format!("failed to load recording from {source}"))?,
        None => Vec::new(),
    };
    tracing::info!(
        target = "orchestrator",
        gateway = %config.gateway_url,
        room = %cli.room,
        participants = cli.participants,
        events = recording.len(),
        "starting clients"
    );

    let peers: Arc<dyn PeerFactory> = Arc::new(RtcPeerFactory::new(config.ice_servers.clone()));
    let clients = orchestrator::launch(
        cli.participants,
        cli.spawn_delay(),
        &recording,
        &options,
        |_| {
            let user_id = rand::thread_rng().gen_range(1..u32::MAX).to_string();
            Orchestrator::connect(config.clone(), cli.room.clone(), user_id, peers.clone())
        },
    )
    .await;
    if clients.is_empty() && cli.participants > 0 {
        bail!("no client could join room {} on {}", cli.room, config.gateway_url);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!(target = "orchestrator", "shutting down");
    for client in clients {
        client.shutdown().await;
    }
    Ok(())
}
