use crate::{Bytes32, Checkpoint, Slot};
use serde::{Deserialize, Serialize};
use ssz_derive::Ssz;

/// Chain status exchanged with peers on connect.
#[derive(Clone, Debug, PartialEq, Eq, Ssz, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub finalized: Checkpoint,
    pub head_root: Bytes32,
    pub head_slot: Slot,
}

impl Status {
    pub fn new(finalized: Checkpoint, head_root: Bytes32, head_slot: Slot) -> Self {
        Self {
            finalized,
            head_root,
            head_slot,
        }
    }
}
