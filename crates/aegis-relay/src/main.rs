#![forbid(unsafe_code)]

use aegis_relay::config::{Args, RelayConfig};
use aegis_relay::metrics::start_metrics_server;
use aegis_relay::Relay;
use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config: RelayConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    let metrics_addr = config.metrics_addr;

    let relay = Relay::start(config).await?;
    info!("relay ready on ws://{}", relay.local_addr());

    if let Some(addr) = metrics_addr {
        let state = relay.state();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, state).await {
                warn!("metrics server error: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    relay.close().await;

    Ok(())
}

fn init_logging(verbose: u8) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        let directive = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
