/// Single-peer sync session.
///
/// One session tries to bring the local chain up to the head advertised by a
/// single peer. It finds a trusted starting slot, then downloads the range in
/// batches, checks each batch links onto what we already have, and imports it.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use containers::{Bytes32, Slot};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    batch::{Batch, NetworkRequester},
    common_ancestor::{CommonAncestorProbe, MultipeerCommonAncestorFinder},
    config::SyncConfig,
    error::SyncError,
    peer_manager::{PeerSet, PeerStatus, SyncPeer},
    store::ChainStore,
    target_chain::{ChainHead, TargetChain},
};
use crate::types::GoodbyeReason;

/// How a sync session ended, when it ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSyncResult {
    SuccessfulSync,
    /// The peer's status promised blocks it could not deliver.
    FaultyAdvertisement,
    /// The peer served blocks that do not link onto our chain.
    BadBlock,
    ImportFailed,
    Cancelled,
}

impl PeerSyncResult {
    pub fn is_success(&self) -> bool {
        *self == PeerSyncResult::SuccessfulSync
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerSyncResult::SuccessfulSync => "successful_sync",
            PeerSyncResult::FaultyAdvertisement => "faulty_advertisement",
            PeerSyncResult::BadBlock => "bad_block",
            PeerSyncResult::ImportFailed => "import_failed",
            PeerSyncResult::Cancelled => "cancelled",
        }
    }
}

/// Executor of single-peer sync sessions.
#[async_trait]
pub trait PeerSync: Send + Sync {
    async fn sync(&self, peer: &SyncPeer) -> Result<PeerSyncResult, SyncError>;

    /// First slot downloaded by the most recent session.
    fn starting_slot(&self) -> Slot;

    fn stop(&self);
}

/// Sequential by-range download from one peer.
pub struct RangePeerSync<N: NetworkRequester, P: CommonAncestorProbe> {
    store: Arc<dyn ChainStore>,
    peers: Arc<dyn PeerSet>,
    network: Arc<N>,
    ancestor_finder: MultipeerCommonAncestorFinder<P>,
    config: SyncConfig,
    starting_slot: Mutex<Slot>,
    stopped: AtomicBool,
    metrics: Option<SharedMetrics>,
}

impl<N: NetworkRequester, P: CommonAncestorProbe> RangePeerSync<N, P> {
    pub fn new(
        store: Arc<dyn ChainStore>,
        peers: Arc<dyn PeerSet>,
        network: Arc<N>,
        probe: P,
        config: SyncConfig,
    ) -> Self {
        Self {
            ancestor_finder: MultipeerCommonAncestorFinder::new(
                store.clone(),
                probe,
                config.chain.clone(),
            ),
            store,
            peers,
            network,
            config,
            starting_slot: Mutex::new(Slot(0)),
            stopped: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.ancestor_finder = self.ancestor_finder.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn ancestor_finder(&self) -> &MultipeerCommonAncestorFinder<P> {
        &self.ancestor_finder
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// The selected peer plus every other connected peer on the same head.
    fn target_chain_for(&self, peer_id: PeerId, status: &PeerStatus) -> TargetChain {
        let head = ChainHead {
            slot: status.head_slot,
            root: status.head_root,
        };
        let mut target_chain = TargetChain::new(head);
        target_chain.add_peer(peer_id);
        for peer in self.peers.connected_peers() {
            if peer
                .status
                .as_ref()
                .is_some_and(|other| other.head_root == status.head_root)
            {
                target_chain.add_peer(peer.peer_id);
            }
        }
        target_chain
    }

    /// Check every block links to its predecessor. The first block of a
    /// session must build on a block we already store.
    fn verify_linkage(&self, batch: &mut Batch, previous_root: &mut Option<Bytes32>) -> bool {
        let mut expected_parent = *previous_root;
        for block in batch.blocks() {
            let linked = match expected_parent {
                Some(parent_root) => block.parent_root == parent_root,
                None => self.store.contains_block(&block.parent_root),
            };
            if !linked {
                return false;
            }
            expected_parent = Some(block.root());
        }

        *previous_root = expected_parent;
        batch.mark_first_block_confirmed();
        batch.mark_last_block_confirmed();
        true
    }

    fn import(&self, batch: &Batch) -> anyhow::Result<()> {
        let mut transaction = self.store.begin_transaction();
        for block in batch.blocks() {
            let blob_sidecars = batch.blob_sidecars_for(&block.root());
            transaction.put_block(block.clone(), blob_sidecars);
        }
        transaction.commit()?;

        if let Some(metrics) = &self.metrics {
            metrics.inc_blocks_imported(batch.blocks().len() as u64);
            metrics.set_head_slot(self.store.head_slot().0 as i64);
        }
        Ok(())
    }

    fn reject_peer(&self, peer_id: &PeerId, batch: &mut Batch) -> PeerSyncResult {
        batch.mark_as_invalid();
        self.peers.disconnect_peer(peer_id, GoodbyeReason::FaultOrError);
        PeerSyncResult::BadBlock
    }

    async fn download(&self, peer_id: PeerId, batch: &mut Batch) -> Result<bool, SyncError> {
        let started = Instant::now();
        while !batch.is_complete() {
            if self.is_stopped() {
                return Ok(false);
            }
            batch.request_more_blocks(self.network.as_ref(), peer_id).await?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_batch_download_time(started.elapsed().as_secs_f64());
        }
        Ok(true)
    }
}

#[async_trait]
impl<N: NetworkRequester, P: CommonAncestorProbe> PeerSync for RangePeerSync<N, P> {
    async fn sync(&self, peer: &SyncPeer) -> Result<PeerSyncResult, SyncError> {
        let peer_id = peer.peer_id;
        if self.is_stopped() {
            return Ok(PeerSyncResult::Cancelled);
        }

        let Some(status) = peer.status.as_ref() else {
            return Ok(PeerSyncResult::FaultyAdvertisement);
        };

        let our_finalized_epoch = self.store.finalized_epoch();
        let our_head_slot = self.store.head_slot();
        if status.head_slot <= our_head_slot && status.finalized_epoch() <= our_finalized_epoch {
            debug!(
                peer = %peer_id,
                peer_head = status.head_slot.0,
                our_head = our_head_slot.0,
                "Peer is not ahead of us"
            );
            return Ok(PeerSyncResult::FaultyAdvertisement);
        }

        let target_chain = Arc::new(self.target_chain_for(peer_id, status));
        let ancestor = self
            .ancestor_finder
            .find_common_ancestor(&target_chain)
            .await?;
        let start_slot = ancestor.saturating_add(1);
        *self.starting_slot.lock() = start_slot;

        info!(
            peer = %peer_id,
            start_slot = start_slot.0,
            target_slot = status.head_slot.0,
            "Syncing to peer"
        );

        let mut previous_root = None;
        let mut imported_blocks = 0usize;
        let mut next_slot = start_slot;

        while next_slot <= status.head_slot {
            if self.is_stopped() {
                return Ok(PeerSyncResult::Cancelled);
            }

            let count = self.config.batch_size.min(status.head_slot.0 - next_slot.0 + 1);
            let mut batch = Batch::new(target_chain.clone(), next_slot, count)
                .map_err(|err| SyncError::Other(err.into()))?;

            match self.download(peer_id, &mut batch).await {
                Ok(true) => {}
                Ok(false) => return Ok(PeerSyncResult::Cancelled),
                Err(SyncError::InvalidResponse { peer, reason }) => {
                    warn!(%peer, %reason, "Peer sent an invalid batch response");
                    return Ok(self.reject_peer(&peer_id, &mut batch));
                }
                Err(err) => return Err(err),
            }

            if !self.verify_linkage(&mut batch, &mut previous_root) {
                warn!(
                    peer = %peer_id,
                    first_slot = batch.first_slot().0,
                    last_slot = batch.last_slot().0,
                    "Batch does not link onto our chain"
                );
                return Ok(self.reject_peer(&peer_id, &mut batch));
            }

            if !batch.is_empty() {
                if let Err(err) = self.import(&batch) {
                    warn!(peer = %peer_id, ?err, "Failed to import batch");
                    return Ok(PeerSyncResult::ImportFailed);
                }
                imported_blocks += batch.blocks().len();
            }

            debug!(
                peer = %peer_id,
                first_slot = batch.first_slot().0,
                last_slot = batch.last_slot().0,
                num_blocks = batch.blocks().len(),
                "Batch imported"
            );
            next_slot = batch.last_slot().saturating_add(1);
        }

        if imported_blocks == 0 && status.head_slot > ancestor {
            warn!(
                peer = %peer_id,
                peer_head = status.head_slot.0,
                "Peer returned no blocks for its advertised chain"
            );
            return Ok(PeerSyncResult::FaultyAdvertisement);
        }

        info!(
            peer = %peer_id,
            imported_blocks,
            head_slot = self.store.head_slot().0,
            "Sync to peer complete"
        );
        Ok(PeerSyncResult::SuccessfulSync)
    }

    fn starting_slot(&self) -> Slot {
        *self.starting_slot.lock()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
