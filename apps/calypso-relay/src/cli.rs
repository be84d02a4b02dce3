use anyhow::{anyhow, bail, Context, Result};
use calypso_proto::{Envelope, Inbound, RelayEvent, RelayRequest};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::ServeArgs;

#[derive(Parser, Debug)]
#[command(name = "calypso-relay")]
#[command(about = "Calypso signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve(ServeArgs),

    /// Connect to a running relay and exercise it
    Debug {
        /// Relay WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Seconds to keep printing inbound envelopes after the command is sent
        #[arg(long, default_value_t = 2)]
        wait_secs: u64,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Print this client's id and the current roster
    Roster,

    /// Send a unicast `message` to one connection
    Send {
        target: String,
        method: String,
        /// JSON array of params (defaults to `[]`)
        params: Option<String>,
    },

    /// Send a `broadcast` to every connection
    Broadcast {
        method: String,
        /// JSON array of params (defaults to `[]`)
        params: Option<String>,
    },
}

fn inner_envelope(method: String, params: Option<String>) -> Result<Value> {
    let params = match params {
        Some(raw) => match serde_json::from_str::<Value>(&raw)
            .with_context(|| format!("params are not valid JSON: {raw}"))?
        {
            Value::Array(items) => items,
            other => bail!("params must be a JSON array, got {other}"),
        },
        None => Vec::new(),
    };
    Ok(Envelope::new(method, params).to_value())
}

pub async fn run_debug_client(url: String, wait_secs: u64, command: DebugCommands) -> Result<()> {
    debug!("connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", url, e);
            return Err(anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            error!("connection timeout after 5 seconds");
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // The relay speaks first: `me`, then the roster.
    let handshake = timeout(Duration::from_secs(5), async {
        let mut me = None;
        while let Some(msg) = read.next().await {
            let Message::Text(text) = msg? else { continue };
            match Inbound::try_from(Envelope::decode_str(text.as_str())?)? {
                Inbound::Relay(RelayEvent::Me { id }) => me = Some(id),
                Inbound::Relay(RelayEvent::Peers(peers)) => {
                    if let Some(id) = me.take() {
                        return Ok::<_, anyhow::Error>((id, peers));
                    }
                }
                Inbound::Peer(_) => {}
            }
        }
        Err(anyhow!("connection closed before the relay identified us"))
    })
    .await;

    let (me, peers) = match handshake {
        Ok(result) => result?,
        Err(_) => bail!("timeout waiting for `me` and `peers`"),
    };
    println!("me: {me}");
    println!("peers:");
    for peer in &peers {
        let marker = if peer.id == me { " (self)" } else { "" };
        println!("  {}{}", peer.id, marker);
    }

    let request = match command {
        DebugCommands::Roster => None,
        DebugCommands::Send {
            target,
            method,
            params,
        } => Some(RelayRequest::message(
            target.into(),
            inner_envelope(method, params)?,
        )),
        DebugCommands::Broadcast { method, params } => Some(RelayRequest::Broadcast {
            payload: inner_envelope(method, params)?,
        }),
    };

    if let Some(request) = request {
        let text = request.into_envelope().encode();
        write.send(Message::text(text)).await?;

        let deadline = Instant::now() + Duration::from_secs(wait_secs);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => println!("<- {}", text.as_str()),
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e.into()),
                Err(_) => break,
            }
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inner_envelope_requires_array_params() {
        assert_eq!(
            inner_envelope("ping".into(), None).expect("no params"),
            json!({ "method": "ping", "params": [] })
        );
        assert_eq!(
            inner_envelope("ping".into(), Some("[1, \"x\"]".into())).expect("array"),
            json!({ "method": "ping", "params": [1, "x"] })
        );
        assert!(inner_envelope("ping".into(), Some("{}".into())).is_err());
        assert!(inner_envelope("ping".into(), Some("nope".into())).is_err());
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["calypso-relay", "--listen-addr", "127.0.0.1:0"])
            .expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.listen_addr, "127.0.0.1:0");
    }
}
