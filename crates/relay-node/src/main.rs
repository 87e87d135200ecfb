mod logging;
mod udp;

use anyhow::Result;
use ble_mesh::connectivity::spawn_probe;
use ble_mesh::{
    ConnectivityFlag, EngineConfig, GatewayConfig, GatewayRelay, MeshEngine, MeshEvent,
};
use blockchain::{EvmClient, EvmClientConfig, TransferLedger};
use shared::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use udp::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env();

    info!("Starting mesh relay node");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded successfully");

    let ledger: Arc<dyn TransferLedger> = Arc::new(EvmClient::new(EvmClientConfig {
        rpc_url: config.ledger.rpc_url.clone(),
        chain_id: config.ledger.chain_id,
        relayer_address: config.ledger.relayer_address.clone(),
        explorer_tx_url: config.ledger.explorer_tx_url.clone(),
        receipt_poll_interval: Duration::from_millis(config.ledger.receipt_poll_interval_ms),
    })?);
    let gateway_config = GatewayConfig::from(&config.gateway);
    let gateway = Arc::new(GatewayRelay::new(ledger.clone(), gateway_config.clone()));

    let shutdown = CancellationToken::new();
    let connectivity = ConnectivityFlag::new(config.connectivity.forced.unwrap_or(false));
    let probe = match config.connectivity.forced {
        Some(online) => {
            info!(
                "Connectivity pinned {}",
                if online { "online" } else { "offline" }
            );
            None
        }
        None => Some(spawn_probe(
            ledger.clone(),
            connectivity.clone(),
            Duration::from_secs(config.connectivity.probe_interval_secs),
            gateway_config.connection_timeout,
            shutdown.clone(),
        )),
    };

    let transport = Arc::new(
        UdpTransport::bind(
            config.mesh.udp_listen_addr,
            config.mesh.udp_broadcast_addr,
            config.mesh.max_packet_size,
        )
        .await?,
    );

    let engine = MeshEngine::spawn(
        transport,
        Some(gateway),
        connectivity,
        EngineConfig::from(&config.mesh),
    )
    .await?;
    info!("Mesh engine running");

    tokio::spawn(log_events(engine.clone()));
    tokio::spawn(read_commands(engine.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    if let Some(probe) = probe {
        probe.await?;
    }
    engine.shutdown().await?;

    Ok(())
}

async fn log_events(engine: MeshEngine) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(MeshEvent::MessageCompleted { id, role, text }) => {
                info!("Message {} completed ({:?}): {}", id, role, text)
            }
            Ok(MeshEvent::AckReceived {
                id,
                response: Some(response),
            }) => {
                if response.success {
                    info!(
                        "Transfer {} confirmed: {}",
                        id,
                        response.explorer_url.unwrap_or_default()
                    );
                } else {
                    warn!(
                        "Transfer {} failed at {:?}: {}",
                        id,
                        response.stage,
                        response.error.unwrap_or_default()
                    );
                }
            }
            Ok(MeshEvent::AckReceived { id, response: None }) => {
                info!("Acknowledgement {} received", id)
            }
            Ok(MeshEvent::GatewayResult { id, response }) => {
                info!(
                    "Gateway result for {} queued (success: {})",
                    id, response.success
                )
            }
            Ok(MeshEvent::RelayScheduled { id, role, chunks }) => {
                info!("Relaying {:?} {} ({} chunks)", role, id, chunks)
            }
            Ok(MeshEvent::Cleared) => info!("All messages cleared"),
            Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Each stdin line is broadcast as a new message; `/`-prefixed lines control the engine
async fn read_commands(engine: MeshEngine) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let result = match line.trim() {
            "" => continue,
            "/start" => engine.start_broadcasting().await,
            "/stop" => engine.stop_broadcasting().await,
            "/clear" => engine.clear_all_and_stop().await,
            "/status" => print_status(&engine).await,
            text => engine
                .broadcast_message(text)
                .await
                .map(|id| info!("Queued message {}", id)),
        };

        if let Err(e) = result {
            error!("Command failed: {}", e);
        }
    }
}

async fn print_status(engine: &MeshEngine) -> ble_mesh::MeshResult<()> {
    match engine.current_broadcast_info().await? {
        Some(current) => info!("Broadcasting {}: {}", current.id, current.preview),
        None => info!("Nothing queued"),
    }

    for message in engine.messages().await? {
        let progress = message.progress;
        info!(
            "{} {:?} {}/{} chunks ({}%)",
            message.id, message.role, progress.received, progress.total, progress.percent
        );
    }
    Ok(())
}
