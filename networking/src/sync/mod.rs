/// Forward sync for the lean Ethereum consensus client.
///
/// This module catches the local chain up with peers that are ahead of it.
/// It includes:
///
/// - **Sync Manager**: Decides when to sync and from which peer, and retries
/// - **Peer Sync**: Runs one session against one peer, batch by batch
/// - **Common Ancestor**: Picks a trusted starting slot, cross-checking two peers
/// - **Batch**: A contiguous slot range being downloaded and verified
/// - **Peer Manager**: Tracks peer connection state and advertised chain status
///
/// ## Architecture
///
/// 1. A peer connects or a retry timer fires, and a sync run is requested
/// 2. The manager selects the best suitable peer, if any
/// 3. The session finds a common ancestor and downloads batches after it
/// 4. Each batch is checked to link onto our chain and imported atomically
/// 5. Unsuccessful sessions retry quickly, erroring peers are excluded for a while
///
/// ## State Machine
///
/// - **IDLE**: Nothing running
/// - **RUNNING**: A run is in progress
/// - **RUNNING_QUEUED**: A run is in progress and exactly one more will follow
pub mod batch;
pub mod common_ancestor;
pub mod config;
pub mod error;
pub mod peer_manager;
pub mod peer_sync;
pub mod states;
pub mod store;
pub mod sync_manager;
pub mod target_chain;

pub use batch::{Batch, BlocksByRangeResponse, NetworkRequester};
pub use common_ancestor::{CommonAncestorProbe, MultipeerCommonAncestorFinder, SampledCommonAncestor};
pub use config::*;
pub use error::{BatchError, SyncError};
pub use peer_manager::{PeerManager, PeerSet, PeerStatus, SyncPeer};
pub use peer_sync::{PeerSync, PeerSyncResult, RangePeerSync};
pub use states::SyncState;
pub use store::{ChainStore, MemoryStore, StoreTransaction};
pub use sync_manager::{SyncManager, SyncManagerService, SyncingStatus};
pub use target_chain::{ChainHead, TargetChain};

#[cfg(test)]
mod tests;
