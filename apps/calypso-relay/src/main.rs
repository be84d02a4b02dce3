use anyhow::Result;
use calypso_relay::cli::{self, Cli, Commands};
use calypso_relay::config::RelayConfig;
use calypso_relay::server;
use calypso_relay::telemetry::{self, Telemetry};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = match cli.command {
        Some(Commands::Debug {
            url,
            wait_secs,
            command,
        }) => {
            telemetry::init_tracing()?;
            return cli::run_debug_client(url, wait_secs, command).await;
        }
        Some(Commands::Serve(args)) => args,
        None => cli.serve,
    };

    let telemetry = Telemetry::init()?;
    let config = RelayConfig::try_from(args)?;
    info!(
        listen_addr = %config.listen_addr,
        transport = ?config.transport,
        outbound_buffer = config.outbound_buffer,
        "starting calypso relay"
    );
    server::serve(config, Some(telemetry.metrics_handle())).await
}
