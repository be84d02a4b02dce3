use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, ValueEnum};
use serde::Serialize;

/// Which concrete transport feeds the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Clients hold a WebSocket directly to this process.
    Socket,
    /// A managed push gateway terminates client sockets and calls back over HTTP.
    Gateway,
}

/// Whether `broadcast` payloads are echoed back to their sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum BroadcastPolicy {
    #[default]
    IncludeSender,
    ExcludeSender,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CALYPSO_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Transport that delivers client connections.
    #[arg(long, env = "CALYPSO_TRANSPORT", value_enum, default_value_t = TransportKind::Socket)]
    pub transport: TransportKind,

    /// Base URL of the push gateway's connection management endpoint.
    #[arg(long, env = "CALYPSO_GATEWAY_CALLBACK_URL")]
    pub gateway_callback_url: Option<String>,

    /// Frames queued per socket connection before sends start failing.
    #[arg(long, env = "CALYPSO_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Sender inclusion for `broadcast`.
    #[arg(
        long,
        env = "CALYPSO_BROADCAST_POLICY",
        value_enum,
        default_value_t = BroadcastPolicy::IncludeSender
    )]
    pub broadcast_policy: BroadcastPolicy,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CALYPSO_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub transport: TransportKind,
    pub gateway_callback_url: Option<String>,
    pub outbound_buffer: usize,
    pub broadcast_policy: BroadcastPolicy,
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            transport: TransportKind::Socket,
            gateway_callback_url: None,
            outbound_buffer: 64,
            broadcast_policy: BroadcastPolicy::IncludeSender,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.outbound_buffer == 0 {
            bail!("outbound buffer must be greater than zero");
        }
        if args.transport == TransportKind::Gateway && args.gateway_callback_url.is_none() {
            bail!("gateway transport requires --gateway-callback-url");
        }
        Ok(Self {
            listen_addr,
            transport: args.transport,
            gateway_callback_url: args
                .gateway_callback_url
                .map(|url| url.trim_end_matches('/').to_string()),
            outbound_buffer: args.outbound_buffer,
            broadcast_policy: args.broadcast_policy,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
