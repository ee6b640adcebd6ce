use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use allium::{Config, Router};

#[derive(Parser, Debug)]
#[command(name = "allium")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (key = value, [section] headers allowed)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transport bind address, overrides the config file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Known router addresses to dial at startup
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// HTTP proxy port, overrides the config file
    #[arg(long)]
    http_port: Option<u16>,

    /// SOCKS proxy port, overrides the config file
    #[arg(long)]
    socks_port: Option<u16>,

    /// Seconds between status log lines
    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.set("host", bind.ip().to_string());
        config.set("port", bind.port().to_string());
    }
    if let Some(port) = args.http_port {
        config.set("httpproxy.port", port.to_string());
    }
    if let Some(port) = args.socks_port {
        config.set("socksproxy.port", port.to_string());
    }

    let router = Router::new(config);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr),
        )
        .with(router.log_buffer().layer())
        .init();

    router.start().await?;
    info!("Router identity: {}", router.router_id().to_hex());

    for addr in &args.bootstrap {
        match router.bootstrap(*addr).await {
            Ok(peer) => info!(peer = %peer.short(), %addr, "bootstrap complete"),
            Err(e) => warn!(%addr, error = %e, "bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));
    interval.tick().await;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let report = router.info().await;
                info!(
                    status = %report.network_status,
                    peers = report.connected_peers,
                    routers = report.known_routers,
                    client_tunnels = report.tunnels.client,
                    transit_tunnels = report.tunnels.transit,
                    in_bps = report.bandwidth.in_rate,
                    out_bps = report.bandwidth.out_rate,
                    transit_bps = report.bandwidth.transit_rate,
                    "status"
                );
            }
        }
    }

    router.stop().await?;
    Ok(())
}
