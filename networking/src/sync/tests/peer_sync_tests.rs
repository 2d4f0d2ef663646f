use std::collections::HashSet;
use std::sync::Arc;

use containers::{BlobSidecar, Block, Bytes32, Checkpoint, Epoch, Slot};
use libp2p_identity::PeerId;
use pretty_assertions::assert_eq;

use super::{FixedProbe, MockNetwork, SLOTS_PER_EPOCH, block, build_chain, genesis};
use crate::sync::{
    ChainStore, MemoryStore, PeerManager, PeerSet, PeerStatus, PeerSync, PeerSyncResult,
    RangePeerSync, SampledCommonAncestor, StoreTransaction, SyncConfig, SyncError,
};
use crate::types::ConnectionState;

struct Setup {
    store: Arc<MemoryStore>,
    peers: Arc<PeerManager>,
    network: Arc<MockNetwork>,
    chain: Vec<Block>,
    peer_id: PeerId,
}

fn config() -> SyncConfig {
    SyncConfig {
        batch_size: 32,
        ..SyncConfig::default()
    }
}

fn status_for(chain: &[Block]) -> PeerStatus {
    let head = chain.last().expect("chain is not empty");
    PeerStatus {
        fork_digest: [0; 4],
        finalized: Checkpoint::new(Bytes32::zero(), Epoch(1)),
        head_root: head.root(),
        head_slot: head.slot,
        earliest_available_slot: None,
    }
}

/// A local store at genesis and one connected peer serving slots `1..=head_slot`.
fn setup(head_slot: u64) -> Setup {
    let genesis = genesis();
    let chain = build_chain(&genesis, 1..=head_slot);
    let store = Arc::new(MemoryStore::new(genesis, SLOTS_PER_EPOCH));
    let peers = Arc::new(PeerManager::new());
    let network = Arc::new(MockNetwork::default());

    let peer_id = PeerId::random();
    peers.add_peer(peer_id, ConnectionState::Connected);
    peers.update_status(&peer_id, status_for(&chain));
    network.serve_chain(peer_id, chain.clone());

    Setup {
        store,
        peers,
        network,
        chain,
        peer_id,
    }
}

impl Setup {
    fn peer_sync(&self, probe: FixedProbe) -> RangePeerSync<MockNetwork, FixedProbe> {
        RangePeerSync::new(
            self.store.clone(),
            self.peers.clone(),
            self.network.clone(),
            probe,
            config(),
        )
    }

    async fn sync_with(
        &self,
        peer_sync: &RangePeerSync<MockNetwork, FixedProbe>,
    ) -> Result<PeerSyncResult, SyncError> {
        let peer = self.peers.get_peer(&self.peer_id).unwrap();
        peer_sync.sync(&peer).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.peers.get_peer(&self.peer_id).unwrap().connection_state
    }
}

#[tokio::test]
async fn test_imports_full_chain_in_batches() {
    let setup = setup(100);
    let sidecar = BlobSidecar {
        index: 0,
        slot: Slot(10),
        block_root: setup.chain[9].root(),
    };
    setup
        .network
        .serve_blob_sidecars(setup.peer_id, vec![sidecar.clone()]);
    let peer_sync = setup.peer_sync(FixedProbe::default());

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::SuccessfulSync);
    assert_eq!(peer_sync.starting_slot(), Slot(1));
    assert_eq!(setup.store.head_slot(), Slot(100));
    assert_eq!(setup.store.head_root(), setup.chain[99].root());
    assert_eq!(setup.store.blob_sidecars(&setup.chain[9].root()), vec![sidecar]);

    let peer_id = setup.peer_id;
    assert_eq!(
        setup.network.requests(),
        vec![
            (peer_id, Slot(1), 32),
            (peer_id, Slot(33), 32),
            (peer_id, Slot(65), 32),
            (peer_id, Slot(97), 4),
        ]
    );
}

#[tokio::test]
async fn test_resumes_after_common_ancestor() {
    let setup = setup(100);
    setup
        .store
        .import_blocks(setup.chain[..40].iter().cloned())
        .unwrap();
    let probe = FixedProbe::default().answer(setup.peer_id, 40);
    let peer_sync = setup.peer_sync(probe);

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::SuccessfulSync);
    assert_eq!(peer_sync.starting_slot(), Slot(41));
    assert_eq!(setup.network.requests()[0], (setup.peer_id, Slot(41), 32));
    assert_eq!(setup.store.head_slot(), Slot(100));
}

#[tokio::test]
async fn test_peers_on_same_head_join_target_chain() {
    let setup = setup(100);
    let second_peer = PeerId::random();
    setup.peers.add_peer(second_peer, ConnectionState::Connected);
    setup
        .peers
        .update_status(&second_peer, status_for(&setup.chain));
    let other_head = PeerId::random();
    setup.peers.add_peer(other_head, ConnectionState::Connected);
    setup
        .peers
        .update_status(&other_head, status_for(&setup.chain[..50]));
    let peer_sync = setup.peer_sync(FixedProbe::default());

    setup.sync_with(&peer_sync).await.unwrap();

    let probed: HashSet<_> = peer_sync
        .ancestor_finder()
        .probe()
        .calls()
        .into_iter()
        .map(|(peer, _, _)| peer)
        .collect();
    assert_eq!(probed, HashSet::from([setup.peer_id, second_peer]));
}

#[tokio::test]
async fn test_peer_not_ahead_is_faulty_advertisement() {
    let setup = setup(100);
    setup
        .store
        .import_blocks(setup.chain.iter().cloned())
        .unwrap();
    setup.store.set_finalized_epoch(Epoch(1));
    let peer_sync = setup.peer_sync(FixedProbe::default());

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::FaultyAdvertisement);
    assert!(setup.network.requests().is_empty());
}

#[tokio::test]
async fn test_no_blocks_served_is_faulty_advertisement() {
    let setup = setup(100);
    setup.network.serve_chain(setup.peer_id, vec![]);
    let peer_sync = setup.peer_sync(FixedProbe::default());

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::FaultyAdvertisement);
    assert_eq!(setup.store.head_slot(), Slot(0));
    assert_eq!(setup.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_unlinked_blocks_disconnect_peer() {
    let setup = setup(100);
    let foreign_parent = block(0, Bytes32::from([4; 32]));
    setup
        .network
        .serve_chain(setup.peer_id, build_chain(&foreign_parent, 1..=100));
    let peer_sync = setup.peer_sync(FixedProbe::default());

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::BadBlock);
    assert_eq!(setup.connection_state(), ConnectionState::Disconnecting);
    assert_eq!(setup.store.head_slot(), Slot(0));
}

#[tokio::test]
async fn test_invalid_response_disconnects_peer() {
    let setup = setup(100);
    setup.network.serve_blob_sidecars(
        setup.peer_id,
        vec![BlobSidecar {
            index: 0,
            slot: Slot(3),
            block_root: Bytes32::from([8; 32]),
        }],
    );
    let peer_sync = setup.peer_sync(FixedProbe::default());

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::BadBlock);
    assert_eq!(setup.connection_state(), ConnectionState::Disconnecting);
}

#[tokio::test]
async fn test_timeout_is_returned_as_error() {
    let setup = setup(100);
    setup.network.time_out(setup.peer_id);
    let peer_sync = setup.peer_sync(FixedProbe::default());

    let result = setup.sync_with(&peer_sync).await;

    assert!(matches!(result, Err(ref err) if err.is_expected()));
}

#[tokio::test]
async fn test_probe_failure_is_returned_as_error() {
    let setup = setup(100);
    let probe = FixedProbe::default().fail(setup.peer_id, "no response");
    let peer_sync = setup.peer_sync(probe);

    let result = setup.sync_with(&peer_sync).await;

    assert!(matches!(result, Err(SyncError::Other(_))));
    assert!(setup.network.requests().is_empty());
}

#[tokio::test]
async fn test_stopped_sync_is_cancelled() {
    let setup = setup(100);
    let peer_sync = setup.peer_sync(FixedProbe::default());

    peer_sync.stop();
    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::Cancelled);
    assert!(setup.network.requests().is_empty());
}

struct RejectingStore(MemoryStore);

struct RejectingTransaction;

impl StoreTransaction for RejectingTransaction {
    fn put_block(&mut self, _block: Block, _blob_sidecars: Vec<BlobSidecar>) {}

    fn commit(self: Box<Self>) -> anyhow::Result<()> {
        anyhow::bail!("store is read-only")
    }
}

impl ChainStore for RejectingStore {
    fn finalized_epoch(&self) -> Epoch {
        self.0.finalized_epoch()
    }

    fn head_slot(&self) -> Slot {
        self.0.head_slot()
    }

    fn head_root(&self) -> Bytes32 {
        self.0.head_root()
    }

    fn current_slot(&self) -> Option<Slot> {
        self.0.current_slot()
    }

    fn block_root_at_slot(&self, slot: Slot) -> Option<Bytes32> {
        self.0.block_root_at_slot(slot)
    }

    fn contains_block(&self, root: &Bytes32) -> bool {
        self.0.contains_block(root)
    }

    fn begin_transaction(&self) -> Box<dyn StoreTransaction + '_> {
        Box::new(RejectingTransaction)
    }
}

#[tokio::test]
async fn test_commit_failure_is_import_failed() {
    let setup = setup(100);
    let store = Arc::new(RejectingStore(MemoryStore::new(genesis(), SLOTS_PER_EPOCH)));
    let peer_sync = RangePeerSync::new(
        store,
        setup.peers.clone(),
        setup.network.clone(),
        FixedProbe::default(),
        config(),
    );

    let result = setup.sync_with(&peer_sync).await.unwrap();

    assert_eq!(result, PeerSyncResult::ImportFailed);
}

#[tokio::test]
async fn test_sampled_probe_finds_local_progress() {
    let genesis = genesis();
    let chain = build_chain(&genesis, 1..=150);
    let store = Arc::new(MemoryStore::new(genesis, SLOTS_PER_EPOCH));
    store.import_blocks(chain[..80].iter().cloned()).unwrap();

    let peers = Arc::new(PeerManager::new());
    let peer_id = PeerId::random();
    peers.add_peer(peer_id, ConnectionState::Connected);
    peers.update_status(&peer_id, status_for(&chain));
    let network = Arc::new(MockNetwork::default());
    network.serve_chain(peer_id, chain.clone());

    let probe = SampledCommonAncestor::new(store.clone(), network.clone());
    let peer_sync = RangePeerSync::new(store.clone(), peers.clone(), network.clone(), probe, config());
    let peer = peers.get_peer(&peer_id).unwrap();

    let result = peer_sync.sync(&peer).await.unwrap();

    assert_eq!(result, PeerSyncResult::SuccessfulSync);
    assert_eq!(peer_sync.starting_slot(), Slot(81));
    assert_eq!(store.head_slot(), Slot(150));
    assert_eq!(network.requests()[0], (peer_id, Slot(49), 32));
}

#[tokio::test]
async fn test_timeout_while_sampling_ancestor_is_expected() {
    let setup = setup(100);
    setup
        .store
        .import_blocks(setup.chain[..80].iter().cloned())
        .unwrap();
    setup.network.time_out(setup.peer_id);
    let probe = SampledCommonAncestor::new(setup.store.clone(), setup.network.clone());
    let peer_sync = RangePeerSync::new(
        setup.store.clone(),
        setup.peers.clone(),
        setup.network.clone(),
        probe,
        config(),
    );
    let peer = setup.peers.get_peer(&setup.peer_id).unwrap();

    let err = peer_sync.sync(&peer).await.unwrap_err();

    assert!(matches!(err, SyncError::Other(_)));
    assert!(err.is_expected());
    assert_eq!(setup.network.requests(), vec![(setup.peer_id, Slot(49), 32)]);
    assert_eq!(setup.connection_state(), ConnectionState::Connected);
}
