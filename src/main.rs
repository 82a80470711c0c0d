use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use etherguard::{
    ActivityMonitor, Device, EdgeConfig, EnabledAf, Endpoint, InboundHandler, NodeId,
    TransportKind, YamlEndpointStore,
};

/// Watchdog window: a dataplane with traffic should never be idle this long
/// while packets are pending.
const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "etherguard")]
#[command(author, version, about = "Mesh VPN dataplane node", long_about = None)]
struct Args {
    /// Path to the edge node YAML configuration.
    #[arg(short, long)]
    config: PathBuf,
}

/// Placeholder session layer: logs deobfuscated packets. The real consumer
/// (handshake + transport decryption + TAP writes) plugs in here.
struct LoggingHandler;

#[async_trait]
impl InboundHandler for LoggingHandler {
    async fn handle_packet(&self, packet: Vec<u8>, from: Endpoint, transport: TransportKind) {
        debug!(
            len = packet.len(),
            from = %from,
            %transport,
            "inbound packet"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = EdgeConfig::load(&args.config)?;
    info!(node = config.node_id, "starting etherguard");

    let monitor = ActivityMonitor::start(DEADLOCK_TIMEOUT);
    let store = Arc::new(YamlEndpointStore::new(args.config.clone(), config.clone()));
    let device = Device::new(
        config.clone(),
        Arc::new(LoggingHandler),
        monitor.clone(),
        Some(store),
    )?;

    let port = device.up().await.context("bring device up")?;
    info!(port, "listening");

    for entry in &config.peers {
        let peer = device.new_peer(NodeId(entry.node_id))?;
        if let Some(url) = &entry.endpoint {
            match peer
                .set_endpoint_from_conn_url(url, EnabledAf::BOTH, 6, entry.static_conn)
                .await
            {
                Ok(()) => info!(node = entry.node_id, endpoint = %url, "peer configured"),
                Err(e) => warn!(node = entry.node_id, endpoint = %url, error = %e,
                                "peer endpoint not installed"),
            }
        }
    }

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("received shutdown signal, exiting gracefully");

    device.close().await;
    monitor.stop();
    Ok(())
}
