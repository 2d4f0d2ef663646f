pub mod types;
pub mod slot;
pub mod checkpoint;
pub mod status;
pub mod block;

pub use block::{hash_tree_root, BlobSidecar, Block};
pub use checkpoint::Checkpoint;
pub use slot::{Epoch, Slot};
pub use status::Status;
pub use types::{Bytes32, ValidatorIndex};
pub use ssz;
