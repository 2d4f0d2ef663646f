/// Peer manager for sync operations.
///
/// Tracks peer connection state and advertised chain status, and notifies
/// subscribers when a peer finishes its status handshake.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use containers::{Bytes32, Checkpoint, Epoch, Slot, Status};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::types::{ConnectionState, GoodbyeReason};

/// Immutable snapshot of what a peer last told us about its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub fork_digest: [u8; 4],
    pub finalized: Checkpoint,
    pub head_root: Bytes32,
    pub head_slot: Slot,
    /// Earliest slot the peer still serves, if it advertised one.
    pub earliest_available_slot: Option<Slot>,
}

impl PeerStatus {
    pub fn from_status(
        fork_digest: [u8; 4],
        status: &Status,
        earliest_available_slot: Option<Slot>,
    ) -> Self {
        Self {
            fork_digest,
            finalized: status.finalized.clone(),
            head_root: status.head_root,
            head_slot: status.head_slot,
            earliest_available_slot,
        }
    }

    pub fn finalized_epoch(&self) -> Epoch {
        self.finalized.epoch
    }

    pub fn finalized_root(&self) -> Bytes32 {
        self.finalized.root
    }
}

/// Sync-specific peer state.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub connection_state: ConnectionState,
    pub status: Option<PeerStatus>,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            status: None,
        }
    }

    /// Check if peer is connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

pub type ConnectSubscriber = Box<dyn Fn(&SyncPeer) + Send + Sync>;

/// The set of remote peers the sync engine can choose from.
pub trait PeerSet: Send + Sync {
    /// Connected peers that have completed the status handshake.
    fn connected_peers(&self) -> Vec<SyncPeer>;

    fn peer_count(&self) -> usize;

    fn get_peer(&self, peer_id: &PeerId) -> Option<SyncPeer>;

    /// Register a callback invoked whenever a peer becomes available for sync.
    fn subscribe_connect(&self, subscriber: ConnectSubscriber) -> u64;

    fn unsubscribe_connect(&self, subscription_id: u64);

    fn disconnect_peer(&self, peer_id: &PeerId, reason: GoodbyeReason);
}

/// Peer manager for sync operations.
///
/// A peer is announced to connect subscribers once it is connected and its
/// first status has arrived, since only then can sync judge it.
#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<PeerId, SyncPeer>>,
    connect_subscribers: Mutex<HashMap<u64, Arc<ConnectSubscriber>>>,
    next_subscription_id: AtomicU64,
    metrics: Option<SharedMetrics>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: SharedMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    /// Add a peer to the manager.
    pub fn add_peer(&self, peer_id: PeerId, connection_state: ConnectionState) {
        self.peers
            .write()
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id, connection_state));
        self.update_peer_gauge();
    }

    /// Remove a peer from the manager.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        let removed = self.peers.write().remove(peer_id);
        self.update_peer_gauge();
        removed
    }

    /// Update peer connection state.
    pub fn update_connection_state(&self, peer_id: &PeerId, state: ConnectionState) {
        let announce = {
            let mut peers = self.peers.write();
            match peers.get_mut(peer_id) {
                Some(peer) => {
                    let was_connected = peer.is_connected();
                    peer.connection_state = state;
                    !was_connected && peer.is_connected() && peer.status.is_some()
                }
                None => false,
            }
        };
        self.update_peer_gauge();

        if announce {
            self.announce(peer_id);
        }
    }

    /// Update peer chain status.
    ///
    /// The first status received from a connected peer completes its
    /// handshake and is announced to connect subscribers.
    pub fn update_status(&self, peer_id: &PeerId, status: PeerStatus) {
        let announce = {
            let mut peers = self.peers.write();
            match peers.get_mut(peer_id) {
                Some(peer) => {
                    debug!(
                        peer = %peer_id,
                        finalized_epoch = status.finalized_epoch().0,
                        head_slot = status.head_slot.0,
                        "Updated peer status"
                    );
                    let first_status = peer.status.is_none();
                    peer.status = Some(status);
                    first_status && peer.is_connected()
                }
                None => false,
            }
        };

        if announce {
            self.announce(peer_id);
        }
    }

    fn announce(&self, peer_id: &PeerId) {
        let Some(peer) = self.get_peer(peer_id) else {
            return;
        };
        let subscribers: Vec<_> = self.connect_subscribers.lock().values().cloned().collect();
        for subscriber in subscribers {
            subscriber(&peer);
        }
    }

    fn update_peer_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            let connected = self.peers.read().values().filter(|p| p.is_connected()).count();
            metrics.set_peers(connected as i64);
        }
    }
}

impl PeerSet for PeerManager {
    fn connected_peers(&self) -> Vec<SyncPeer> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_connected() && peer.status.is_some())
            .cloned()
            .collect()
    }

    fn peer_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.is_connected()).count()
    }

    fn get_peer(&self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.read().get(peer_id).cloned()
    }

    fn subscribe_connect(&self, subscriber: ConnectSubscriber) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.connect_subscribers.lock().insert(id, Arc::new(subscriber));
        id
    }

    fn unsubscribe_connect(&self, subscription_id: u64) {
        self.connect_subscribers.lock().remove(&subscription_id);
    }

    fn disconnect_peer(&self, peer_id: &PeerId, reason: GoodbyeReason) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get_mut(peer_id) {
            if peer.connection_state == ConnectionState::Connected {
                peer.connection_state = ConnectionState::Disconnecting;
                info!(peer = %peer_id, %reason, "Disconnecting peer");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_peer_disconnection(&reason.to_string());
                }
            }
        }
        drop(peers);
        self.update_peer_gauge();
    }
}
