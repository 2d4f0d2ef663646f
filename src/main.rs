mod simulation;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chain::{ChainConfig, DEVNET_CONFIG};
use clap::Parser;
use libp2p_identity::PeerId;
use metrics::Metrics;
use metrics::server::{MetricsServerConfig, run_metrics_server};
use networking::sync::{
    ChainStore, LONG_DELAY, MemoryStore, PeerManager, RangePeerSync, SHORT_DELAY,
    SampledCommonAncestor, SyncConfig, SyncManagerService, DEFAULT_BATCH_SIZE,
};
use networking::types::ConnectionState;
use tokio::task;
use tracing::{error, info, warn};

use crate::simulation::{PeerBehaviour, SimulatedChain, SimulatedNetwork, genesis_block};

/// Epochs by which finalization trails the head, locally and on every peer.
const FINALIZATION_LAG_EPOCHS: u64 = 2;

#[derive(Parser, Debug)]
struct Args {
    /// Number of honest peers.
    #[arg(long, default_value_t = 4)]
    peers: usize,

    /// Peers serving blocks that do not link to their parents.
    #[arg(long, default_value_t = 1)]
    corrupt_peers: usize,

    /// Peers that drop the connection mid-sync.
    #[arg(long, default_value_t = 1)]
    flaky_peers: usize,

    /// Slots in the remote chain.
    #[arg(long, default_value_t = 1024)]
    chain_length: u64,

    /// Leave every n-th slot empty, 0 to fill every slot.
    #[arg(long, default_value_t = 5)]
    skip_every: u64,

    #[arg(long, default_value_t = DEVNET_CONFIG.slots_per_epoch)]
    slots_per_epoch: u64,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: u64,

    /// Simulated round trip for each request.
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    #[arg(long, default_value_t = SHORT_DELAY.as_secs())]
    short_delay_secs: u64,

    #[arg(long, default_value_t = LONG_DELAY.as_secs())]
    long_delay_secs: u64,

    /// Pause between peer connections.
    #[arg(long, default_value_t = 1000)]
    connect_interval_ms: u64,

    #[arg(long)]
    metrics: bool,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    #[arg(long, default_value_t = 5054)]
    metrics_port: u16,

    /// Give up if the node is not synced after this long.
    #[arg(long, default_value_t = 300)]
    max_runtime_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let chain_config = ChainConfig {
        slots_per_epoch: args.slots_per_epoch,
        ..DEVNET_CONFIG
    };
    let sync_config = SyncConfig {
        chain: chain_config,
        short_delay: Duration::from_secs(args.short_delay_secs),
        long_delay: Duration::from_secs(args.long_delay_secs),
        batch_size: args.batch_size,
        ..SyncConfig::default()
    };

    let metrics = Arc::new(Metrics::new());
    if args.metrics {
        let config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port: args.metrics_port,
        };
        let metrics = metrics.clone();
        task::spawn(async move {
            if let Err(err) = run_metrics_server(config, metrics).await {
                error!(?err, "Metrics server exited with error");
            }
        });
    }

    let genesis = genesis_block();
    let remote_chain = Arc::new(SimulatedChain::build(
        genesis.clone(),
        args.chain_length,
        args.skip_every,
    ));
    let tip = remote_chain.head().slot;

    let store = Arc::new(
        MemoryStore::new(genesis, args.slots_per_epoch)
            .with_finalization_lag(FINALIZATION_LAG_EPOCHS),
    );
    store.set_current_slot(Some(tip));

    let peers = Arc::new(PeerManager::with_metrics(metrics.clone()));
    let network = Arc::new(SimulatedNetwork::new(Duration::from_millis(args.latency_ms)));
    let probe = SampledCommonAncestor::new(store.clone(), network.clone());
    let peer_sync = RangePeerSync::new(
        store.clone(),
        peers.clone(),
        network.clone(),
        probe,
        sync_config.clone(),
    )
    .with_metrics(metrics.clone());

    let service = SyncManagerService::new(
        store.clone(),
        peers.clone(),
        Arc::new(peer_sync),
        sync_config,
        Some(metrics),
    );
    let sync_manager = service.handle();
    sync_manager.subscribe_to_sync_changes(|syncing| {
        if syncing {
            info!("Node is syncing");
        } else {
            info!("Node is no longer syncing");
        }
    });
    let service_handle = task::spawn(service.run());

    let mut behaviours = Vec::new();
    behaviours.extend(std::iter::repeat_n(PeerBehaviour::Corrupt, args.corrupt_peers));
    behaviours.extend(std::iter::repeat_n(PeerBehaviour::Flaky, args.flaky_peers));
    behaviours.extend(std::iter::repeat_n(PeerBehaviour::Honest, args.peers));

    let connect_interval = Duration::from_millis(args.connect_interval_ms);
    let slots_per_epoch = args.slots_per_epoch;
    let connector = {
        let peers = peers.clone();
        let network = network.clone();
        task::spawn(async move {
            for behaviour in behaviours {
                tokio::time::sleep(connect_interval).await;
                let peer_id = PeerId::random();
                let status = network.add_peer(
                    peer_id,
                    &remote_chain,
                    behaviour,
                    slots_per_epoch,
                    FINALIZATION_LAG_EPOCHS,
                );
                info!(peer = %peer_id, ?behaviour, "Peer connected");
                peers.add_peer(peer_id, ConnectionState::Connecting);
                peers.update_connection_state(&peer_id, ConnectionState::Connected);
                peers.update_status(&peer_id, status);
            }
        })
    };

    let deadline = tokio::time::sleep(Duration::from_secs(args.max_runtime_secs));
    tokio::pin!(deadline);
    let mut progress = tokio::time::interval(Duration::from_secs(1));

    let synced = loop {
        tokio::select! {
            _ = progress.tick() => {
                let status = sync_manager.sync_status().await?;
                if store.head_slot() == tip && !status.is_syncing && !sync_manager.is_sync_active().await? {
                    break true;
                }
                info!(
                    head_slot = status.current_slot.0,
                    target_slot = tip.0,
                    finalized_epoch = store.finalized_epoch().0,
                    syncing = status.is_syncing,
                    "Sync progress"
                );
            }
            _ = &mut deadline => break false,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break false;
            }
        }
    };

    if synced {
        info!(head_slot = tip.0, head_root = %store.head_root(), "Node is synced");
    } else {
        warn!(head_slot = store.head_slot().0, target_slot = tip.0, "Stopping before sync completed");
    }

    connector.abort();
    sync_manager.stop();
    service_handle.await?;

    Ok(())
}
