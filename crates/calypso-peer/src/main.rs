use std::sync::Arc;

use anyhow::{Context, Result};
use calypso_peer::rtc::DEFAULT_STUN_SERVERS;
use calypso_peer::{ContactPolicy, PeerEvent, PeerManager, RtcNegotiatorFactory, SignalingClient};
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "calypso-peer")]
#[command(about = "Join a Calypso relay and negotiate with every peer on the roster")]
struct Cli {
    /// Relay WebSocket URL
    #[arg(long, env = "CALYPSO_RELAY_URL", default_value = "ws://localhost:8080/")]
    url: String,

    /// STUN server URL; repeat for several
    #[arg(long = "stun", default_values_t = DEFAULT_STUN_SERVERS.map(String::from))]
    stun: Vec<String>,

    /// Who calls when a new peer shows up
    #[arg(long, value_enum, default_value_t = ContactPolicy::LowerIdInitiates)]
    contact: ContactPolicy,

    /// Label announced to connected peers via `peer:update`
    #[arg(long)]
    label: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut client = SignalingClient::connect(&cli.url)
        .await
        .with_context(|| format!("failed to connect to relay at {}", cli.url))?;
    info!(url = %cli.url, contact = ?cli.contact, "connected to relay");

    let factory = Arc::new(RtcNegotiatorFactory::new(cli.stun.clone()));
    let (manager, mut events) = PeerManager::new(factory, Arc::new(client.sender()), cli.contact);

    let label = cli.label.clone();
    let reporter = manager.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Connected(peer) => {
                    info!(peer_id = %peer, "peer connected");
                    if let Some(label) = &label {
                        if let Err(err) = reporter.send_update(&peer, json!({ "label": label })) {
                            warn!(peer_id = %peer, error = %err, "failed to send update");
                        }
                    }
                }
                PeerEvent::Closed { peer, reason } => {
                    info!(peer_id = %peer, reason = %reason, "peer session closed");
                }
                other => info!(event = ?other, "peer event"),
            }
        }
    });

    loop {
        tokio::select! {
            inbound = client.recv() => match inbound {
                Some(inbound) => manager.handle_inbound(inbound).await,
                None => {
                    warn!("relay connection closed");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    drop(manager);
    event_task.abort();
    Ok(())
}
