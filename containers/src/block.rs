use crate::{Bytes32, Slot, ValidatorIndex};
use serde::{Deserialize, Serialize};
use ssz_derive::Ssz;

/// A block as seen by the sync engine.
///
/// The body is committed to by `body_root`; sync only needs the header
/// fields to order blocks and check parent linkage.
#[derive(Clone, Debug, PartialEq, Eq, Ssz, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Bytes32,
    pub state_root: Bytes32,
    pub body_root: Bytes32,
}

impl Block {
    /// Root identifying this block.
    pub fn root(&self) -> Bytes32 {
        hash_tree_root(self)
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_root.is_zero()
    }
}

/// Side data committed to by a block, delivered alongside it during sync.
#[derive(Clone, Debug, PartialEq, Eq, Ssz, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobSidecar {
    pub index: u64,
    pub slot: Slot,
    pub block_root: Bytes32,
}

/// Compute the SSZ hash tree root for any type implementing `SszHash`.
pub fn hash_tree_root<T: ssz::SszHash>(value: &T) -> Bytes32 {
    let h = value.hash_tree_root();
    Bytes32(h)
}
