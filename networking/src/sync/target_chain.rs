/// A chain the node is trying to reach, and the peers believed to be on it.
use std::collections::HashSet;
use std::fmt;

use containers::{Bytes32, Slot};
use libp2p_identity::PeerId;
use rand::seq::IteratorRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainHead {
    pub slot: Slot,
    pub root: Bytes32,
}

#[derive(Debug, Clone)]
pub struct TargetChain {
    head: ChainHead,
    peers: HashSet<PeerId>,
}

impl TargetChain {
    pub fn new(head: ChainHead) -> Self {
        Self {
            head,
            peers: HashSet::new(),
        }
    }

    pub fn with_peers(head: ChainHead, peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            head,
            peers: peers.into_iter().collect(),
        }
    }

    pub fn chain_head(&self) -> ChainHead {
        self.head
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn add_peer(&mut self, peer_id: PeerId) {
        self.peers.insert(peer_id);
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Pick a random peer on this chain, other than `exclude`.
    pub fn select_random_peer(&self, exclude: Option<&PeerId>) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|peer| Some(*peer) != exclude)
            .choose(&mut rand::thread_rng())
            .copied()
    }
}

impl fmt::Display for TargetChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TargetChain(head_slot={}, head_root={}, peers={})",
            self.head.slot,
            self.head.root,
            self.peers.len()
        )
    }
}
