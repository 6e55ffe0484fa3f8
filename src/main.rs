//! KeyBridge daemon entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keybridge::approval::{ApprovalQueue, QueueEvent};
use keybridge::cli::{Cli, Command};
use keybridge::config::BridgeConfig;
use keybridge::device::{DeviceStateController, DeviceTransport, SimulatedDevice};
use keybridge::pairing::PairingStore;
use keybridge::server::{AppState, BridgeServer, BridgeServerConfig};
use keybridge::walletconnect::ProtocolAdapter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve { simulate: false }) {
        Command::Serve { simulate } => serve(simulate).await,
        Command::Pairings => list_pairings().await,
    }
}

async fn serve(simulate: bool) -> anyhow::Result<()> {
    let config = BridgeConfig::from_env()?;

    // The device wire protocol is an opaque capability behind the
    // transport trait; this build ships the simulated transport only.
    if !simulate {
        anyhow::bail!("no hardware transport in this build; run with --simulate");
    }
    let transport: Arc<dyn DeviceTransport> = Arc::new(SimulatedDevice::new());

    let controller = Arc::new(DeviceStateController::new(transport));
    let probe_loop = Arc::clone(&controller).spawn_probe_loop(config.probe_interval);

    let queue = ApprovalQueue::new(Arc::clone(&controller), config.queue_config());
    let store = Arc::new(PairingStore::open(&config.store_path)?);

    let adapter = ProtocolAdapter::new(
        Arc::clone(&controller),
        queue.clone(),
        Arc::clone(&store),
    );
    let session_watcher = adapter.spawn_device_watcher();

    // Surface the pending-request feed in the logs; the embedding UI is
    // the actual decision consumer.
    let mut events = queue.subscribe_events();
    let feed = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Enqueued(request)) => {
                    tracing::info!(id = %request.id, method = %request.method, "awaiting approval");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut server = BridgeServer::new(BridgeServerConfig {
        addr: config.bind_addr,
    });
    server
        .start(AppState {
            store,
            queue,
            controller,
        })
        .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    server.shutdown().await;
    probe_loop.abort();
    session_watcher.abort();
    feed.abort();
    Ok(())
}

async fn list_pairings() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env()?;
    let store = PairingStore::open(&config.store_path)?;

    let pairings = store.list().await;
    if pairings.is_empty() {
        println!("No paired applications.");
        return Ok(());
    }

    for record in pairings {
        println!(
            "{}  {}  {}  added {}",
            record.pairing_type,
            record.service_name,
            record.service_home_page,
            record.added_on.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
