use crate::{Bytes32, Epoch};
use serde::{Deserialize, Serialize};
use ssz_derive::Ssz;

/// Represents a finalized or justified checkpoint.
///
/// A checkpoint pairs the root of the first block of an epoch with that
/// epoch. Finalization is epoch-granular, so a peer advertises its finalized
/// progress as a checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Ssz, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The root hash of the checkpoint's block.
    pub root: Bytes32,
    /// The epoch of the checkpoint.
    pub epoch: Epoch,
}

impl Checkpoint {
    pub fn new(root: Bytes32, epoch: Epoch) -> Self {
        Self { root, epoch }
    }

    /// Return the genesis checkpoint with zero root and epoch 0.
    pub fn genesis() -> Self {
        Self {
            root: Bytes32::zero(),
            epoch: Epoch(0),
        }
    }
}
