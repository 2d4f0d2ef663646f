mod peer_sync_tests;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use containers::{BlobSidecar, Block, Bytes32, Checkpoint, Epoch, Slot, ValidatorIndex};
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::sync::{
    BlocksByRangeResponse, CommonAncestorProbe, NetworkRequester, PeerManager, PeerStatus,
    PeerSync, PeerSyncResult, SyncError, SyncPeer,
};
use crate::types::ConnectionState;

pub const SLOTS_PER_EPOCH: u64 = 32;

pub fn block(slot: u64, parent_root: Bytes32) -> Block {
    Block {
        slot: Slot(slot),
        proposer_index: ValidatorIndex(slot % 8),
        parent_root,
        state_root: Bytes32::from([slot as u8; 32]),
        body_root: Bytes32::zero(),
    }
}

pub fn genesis() -> Block {
    block(0, Bytes32::zero())
}

/// Blocks at `slots`, each the child of the previous one, starting on `parent`.
pub fn build_chain(parent: &Block, slots: impl IntoIterator<Item = u64>) -> Vec<Block> {
    let mut parent_root = parent.root();
    slots
        .into_iter()
        .map(|slot| {
            let block = block(slot, parent_root);
            parent_root = block.root();
            block
        })
        .collect()
}

pub fn peer_status(finalized_epoch: u64, head_slot: u64) -> PeerStatus {
    PeerStatus {
        fork_digest: [0; 4],
        finalized: Checkpoint::new(Bytes32::zero(), Epoch(finalized_epoch)),
        head_root: Bytes32::from([head_slot as u8; 32]),
        head_slot: Slot(head_slot),
        earliest_available_slot: None,
    }
}

pub fn add_connected_peer(manager: &PeerManager, status: PeerStatus) -> PeerId {
    let peer_id = PeerId::random();
    manager.add_peer(peer_id, ConnectionState::Connected);
    manager.update_status(&peer_id, status);
    peer_id
}

pub fn sync_peer(status: PeerStatus) -> SyncPeer {
    let mut peer = SyncPeer::new(PeerId::random(), ConnectionState::Connected);
    peer.status = Some(status);
    peer
}

/// Let every ready task run. Only meaningful with a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Serves by-range requests from a per-peer chain.
#[derive(Default)]
pub struct MockNetwork {
    chains: Mutex<HashMap<PeerId, Vec<Block>>>,
    blob_sidecars: Mutex<HashMap<PeerId, Vec<BlobSidecar>>>,
    timing_out: Mutex<HashSet<PeerId>>,
    requests: Mutex<Vec<(PeerId, Slot, u64)>>,
}

impl MockNetwork {
    pub fn serve_chain(&self, peer_id: PeerId, blocks: Vec<Block>) {
        self.chains.lock().insert(peer_id, blocks);
    }

    pub fn serve_blob_sidecars(&self, peer_id: PeerId, sidecars: Vec<BlobSidecar>) {
        self.blob_sidecars.lock().insert(peer_id, sidecars);
    }

    pub fn time_out(&self, peer_id: PeerId) {
        self.timing_out.lock().insert(peer_id);
    }

    pub fn requests(&self) -> Vec<(PeerId, Slot, u64)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl NetworkRequester for MockNetwork {
    async fn request_blocks_by_range(
        &self,
        peer_id: PeerId,
        start_slot: Slot,
        count: u64,
    ) -> Result<BlocksByRangeResponse, SyncError> {
        self.requests.lock().push((peer_id, start_slot, count));

        if self.timing_out.lock().contains(&peer_id) {
            return Err(SyncError::RpcTimeout(peer_id));
        }

        let end_slot = start_slot.saturating_add(count);
        let in_range = |slot: Slot| slot >= start_slot && slot < end_slot;

        let blocks = self
            .chains
            .lock()
            .get(&peer_id)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|block| in_range(block.slot))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let blob_sidecars = self
            .blob_sidecars
            .lock()
            .get(&peer_id)
            .map(|sidecars| {
                sidecars
                    .iter()
                    .filter(|sidecar| in_range(sidecar.slot))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(BlocksByRangeResponse {
            blocks,
            blob_sidecars,
        })
    }
}

/// Probe with canned answers per peer.
#[derive(Default)]
pub struct FixedProbe {
    answers: HashMap<PeerId, Result<Slot, String>>,
    calls: Mutex<Vec<(PeerId, Slot, Slot)>>,
}

impl FixedProbe {
    pub fn answer(mut self, peer_id: PeerId, slot: u64) -> Self {
        self.answers.insert(peer_id, Ok(Slot(slot)));
        self
    }

    pub fn fail(mut self, peer_id: PeerId, message: &str) -> Self {
        self.answers.insert(peer_id, Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<(PeerId, Slot, Slot)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommonAncestorProbe for FixedProbe {
    async fn get_common_ancestor(
        &self,
        peer_id: PeerId,
        lower_bound: Slot,
        upper_bound: Slot,
    ) -> anyhow::Result<Slot> {
        self.calls.lock().push((peer_id, lower_bound, upper_bound));
        match self.answers.get(&peer_id) {
            Some(Ok(slot)) => Ok(*slot),
            Some(Err(message)) => Err(anyhow::anyhow!("{message}")),
            None => Ok(lower_bound),
        }
    }
}

/// Session executor whose sessions finish only when the test says so.
pub struct ControlledPeerSync {
    sessions: Mutex<Vec<PeerId>>,
    pending: Mutex<VecDeque<oneshot::Sender<Result<PeerSyncResult, SyncError>>>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    starting_slot: Slot,
    stopped: AtomicBool,
}

impl ControlledPeerSync {
    pub fn new(starting_slot: u64) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            starting_slot: Slot(starting_slot),
            stopped: AtomicBool::new(false),
        }
    }

    /// Peers of every session started so far, in order.
    pub fn sessions(&self) -> Vec<PeerId> {
        self.sessions.lock().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn complete_next(&self, outcome: Result<PeerSyncResult, SyncError>) {
        let sender = self
            .pending
            .lock()
            .pop_front()
            .expect("no sync session is running");
        let _ = sender.send(outcome);
    }
}

#[async_trait]
impl PeerSync for ControlledPeerSync {
    async fn sync(&self, peer: &SyncPeer) -> Result<PeerSyncResult, SyncError> {
        let (sender, receiver) = oneshot::channel();
        self.sessions.lock().push(peer.peer_id);
        self.pending.lock().push_back(sender);

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let outcome = receiver.await.unwrap_or(Ok(PeerSyncResult::Cancelled));
        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn starting_slot(&self) -> Slot {
        self.starting_slot
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
