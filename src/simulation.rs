use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use containers::{
    BlobSidecar, Block, Bytes32, Checkpoint, Epoch, Slot, Status, ValidatorIndex,
};
use libp2p_identity::PeerId;
use networking::sync::{BlocksByRangeResponse, NetworkRequester, PeerStatus, SyncError};
use parking_lot::Mutex;
use tracing::debug;

/// How a simulated peer answers block requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerBehaviour {
    Honest,
    /// Serves blocks whose parent roots do not link.
    Corrupt,
    /// Drops the connection after a few requests.
    Flaky,
}

const FLAKY_REQUEST_LIMIT: u64 = 3;

/// Canonical chain shared by the simulated network.
pub struct SimulatedChain {
    genesis: Block,
    blocks: Vec<Block>,
    blob_sidecars: Vec<BlobSidecar>,
}

pub fn genesis_block() -> Block {
    Block {
        slot: Slot(0),
        proposer_index: ValidatorIndex(0),
        parent_root: Bytes32::zero(),
        state_root: Bytes32::zero(),
        body_root: Bytes32::zero(),
    }
}

impl SimulatedChain {
    /// Build a chain up to `length` slots, leaving every `skip_every`-th slot
    /// empty. Every third block carries a blob sidecar.
    pub fn build(genesis: Block, length: u64, skip_every: u64) -> Self {
        let mut blocks = Vec::new();
        let mut blob_sidecars = Vec::new();
        let mut parent_root = genesis.root();

        for slot in 1..=length {
            if skip_every > 0 && slot % skip_every == 0 {
                continue;
            }
            let block = Block {
                slot: Slot(slot),
                proposer_index: ValidatorIndex(slot % 64),
                parent_root,
                state_root: Bytes32::from(slot_bytes(slot, 0x5a)),
                body_root: Bytes32::from(slot_bytes(slot, 0xb0)),
            };
            parent_root = block.root();
            if slot % 3 == 0 {
                blob_sidecars.push(BlobSidecar {
                    index: 0,
                    slot: Slot(slot),
                    block_root: parent_root,
                });
            }
            blocks.push(block);
        }

        Self {
            genesis,
            blocks,
            blob_sidecars,
        }
    }

    /// The same slots with every parent link broken.
    fn corrupted(&self) -> Self {
        let blocks = self
            .blocks
            .iter()
            .map(|block| Block {
                parent_root: Bytes32::from(slot_bytes(block.slot.0, 0xee)),
                ..block.clone()
            })
            .collect();

        Self {
            genesis: self.genesis.clone(),
            blocks,
            blob_sidecars: Vec::new(),
        }
    }

    pub fn head(&self) -> &Block {
        self.blocks.last().unwrap_or(&self.genesis)
    }

    /// Status advertised by a node on this chain whose finalization trails
    /// its head by `finalization_lag` epochs.
    pub fn status(&self, slots_per_epoch: u64, finalization_lag: u64) -> Status {
        let head = self.head();
        let head_epoch = head.slot.epoch(slots_per_epoch);
        let finalized_epoch = Epoch(head_epoch.0.saturating_sub(finalization_lag));
        let finalized_slot = finalized_epoch.start_slot(slots_per_epoch);
        let finalized_root = self
            .blocks
            .iter()
            .rev()
            .find(|block| block.slot <= finalized_slot)
            .unwrap_or(&self.genesis)
            .root();

        Status::new(
            Checkpoint::new(finalized_root, finalized_epoch),
            head.root(),
            head.slot,
        )
    }

    fn range(&self, start_slot: Slot, count: u64) -> BlocksByRangeResponse {
        let end_slot = start_slot.saturating_add(count);
        let in_range = |slot: Slot| slot >= start_slot && slot < end_slot;

        BlocksByRangeResponse {
            blocks: self
                .blocks
                .iter()
                .filter(|block| in_range(block.slot))
                .cloned()
                .collect(),
            blob_sidecars: self
                .blob_sidecars
                .iter()
                .filter(|sidecar| in_range(sidecar.slot))
                .cloned()
                .collect(),
        }
    }
}

fn slot_bytes(slot: u64, tag: u8) -> [u8; 32] {
    let mut bytes = [tag; 32];
    bytes[..8].copy_from_slice(&slot.to_le_bytes());
    bytes
}

struct SimulatedPeer {
    chain: Arc<SimulatedChain>,
    behaviour: PeerBehaviour,
    requests_served: u64,
}

/// In-process stand-in for the req/resp network.
pub struct SimulatedNetwork {
    peers: Mutex<HashMap<PeerId, SimulatedPeer>>,
    latency: Duration,
}

impl SimulatedNetwork {
    pub fn new(latency: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            latency,
        }
    }

    /// Register a peer and return the status it advertises.
    pub fn add_peer(
        &self,
        peer_id: PeerId,
        chain: &Arc<SimulatedChain>,
        behaviour: PeerBehaviour,
        slots_per_epoch: u64,
        finalization_lag: u64,
    ) -> PeerStatus {
        let status = chain.status(slots_per_epoch, finalization_lag);
        let chain = match behaviour {
            PeerBehaviour::Corrupt => Arc::new(chain.corrupted()),
            PeerBehaviour::Honest | PeerBehaviour::Flaky => chain.clone(),
        };

        self.peers.lock().insert(
            peer_id,
            SimulatedPeer {
                chain,
                behaviour,
                requests_served: 0,
            },
        );
        PeerStatus::from_status([0; 4], &status, None)
    }
}

#[async_trait]
impl NetworkRequester for SimulatedNetwork {
    async fn request_blocks_by_range(
        &self,
        peer_id: PeerId,
        start_slot: Slot,
        count: u64,
    ) -> Result<BlocksByRangeResponse, SyncError> {
        tokio::time::sleep(self.latency).await;

        let mut peers = self.peers.lock();
        let peer = peers
            .get_mut(&peer_id)
            .ok_or(SyncError::PeerDisconnected(peer_id))?;

        if peer.behaviour == PeerBehaviour::Flaky && peer.requests_served >= FLAKY_REQUEST_LIMIT {
            debug!(peer = %peer_id, "Simulated peer dropped the connection");
            return Err(SyncError::PeerDisconnected(peer_id));
        }
        peer.requests_served += 1;

        let response = peer.chain.range(start_slot, count);
        debug!(
            peer = %peer_id,
            start_slot = start_slot.0,
            count,
            num_blocks = response.blocks.len(),
            "Served BlocksByRange request"
        );
        Ok(response)
    }
}
