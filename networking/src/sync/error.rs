use libp2p_identity::PeerId;
use thiserror::Error;

use containers::Slot;

/// Failure of a sync session or of a request made on its behalf.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("peer {0} disconnected")]
    PeerDisconnected(PeerId),
    #[error("request to peer {0} timed out")]
    RpcTimeout(PeerId),
    #[error("peer {peer} sent an invalid response: {reason}")]
    InvalidResponse { peer: PeerId, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Disconnects and timeouts are part of normal operation on an open
    /// network and are logged at reduced severity. Wrapped errors are
    /// classified by the sync error at their root.
    pub fn is_expected(&self) -> bool {
        match self {
            SyncError::PeerDisconnected(_) | SyncError::RpcTimeout(_) => true,
            SyncError::InvalidResponse { .. } => false,
            SyncError::Other(err) => err
                .chain()
                .filter_map(|cause| cause.downcast_ref::<SyncError>())
                .any(SyncError::is_expected),
        }
    }
}

/// Violation of the batch contract, or a response that does not fit the batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch is already awaiting blocks")]
    AlreadyAwaitingBlocks,
    #[error("batch cannot be completed while awaiting blocks")]
    AwaitingBlocks,
    #[error("batch is marked invalid")]
    Invalid,
    #[error("batch is already complete")]
    AlreadyComplete,
    #[error("no request is outstanding for this batch")]
    NotAwaitingBlocks,
    #[error("block at slot {slot} is outside batch range {first_slot}..={last_slot}")]
    BlockOutOfRange {
        slot: Slot,
        first_slot: Slot,
        last_slot: Slot,
    },
    #[error("block at slot {slot} does not follow previous block at slot {previous}")]
    BlocksOutOfOrder { slot: Slot, previous: Slot },
    #[error("sidecar at slot {slot} does not belong to any block in the batch")]
    UnexpectedSidecar { slot: Slot },
    #[error("batch must cover at least one slot")]
    EmptyRange,
    #[error("batch of {count} slots from {first_slot} overflows the slot range")]
    RangeOverflow { first_slot: Slot, count: u64 },
}
