/// A contiguous slot range of a target chain that can be downloaded,
/// checked and imported independently of its neighbours.
///
/// `Batch` holds state only. The scheduler that owns it decides which peer to
/// ask, when boundaries count as confirmed, and what to do with contested or
/// invalid batches.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use containers::{BlobSidecar, Block, Bytes32, Slot};
use libp2p_identity::PeerId;
use tracing::{debug, trace};

use super::{
    error::{BatchError, SyncError},
    target_chain::TargetChain,
};

/// Blocks and sidecars returned for a by-range request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlocksByRangeResponse {
    pub blocks: Vec<Block>,
    pub blob_sidecars: Vec<BlobSidecar>,
}

/// Network requester trait for fetching blocks.
///
/// Abstracts the network layer to allow testing with mocks.
#[async_trait]
pub trait NetworkRequester: Send + Sync {
    /// Request `count` slots of blocks starting at `start_slot` from a peer.
    ///
    /// Skipped slots simply have no block in the response.
    async fn request_blocks_by_range(
        &self,
        peer_id: PeerId,
        start_slot: Slot,
        count: u64,
    ) -> Result<BlocksByRangeResponse, SyncError>;
}

#[derive(Debug)]
pub struct Batch {
    target_chain: Arc<TargetChain>,
    first_slot: Slot,
    last_slot: Slot,
    blocks: Vec<Block>,
    blob_sidecars_by_block_root: HashMap<Bytes32, Vec<BlobSidecar>>,
    source: Option<PeerId>,
    complete: bool,
    first_block_confirmed: bool,
    last_block_confirmed: bool,
    contested: bool,
    invalid: bool,
    awaiting_blocks: bool,
}

impl Batch {
    /// Create an empty batch covering `count` slots from `first_slot`.
    pub fn new(
        target_chain: Arc<TargetChain>,
        first_slot: Slot,
        count: u64,
    ) -> Result<Self, BatchError> {
        if count == 0 {
            return Err(BatchError::EmptyRange);
        }
        let last_slot = first_slot
            .0
            .checked_add(count - 1)
            .map(Slot)
            .ok_or(BatchError::RangeOverflow { first_slot, count })?;

        Ok(Self {
            target_chain,
            first_slot,
            last_slot,
            blocks: Vec::new(),
            blob_sidecars_by_block_root: HashMap::new(),
            source: None,
            complete: false,
            first_block_confirmed: false,
            last_block_confirmed: false,
            contested: false,
            invalid: false,
            awaiting_blocks: false,
        })
    }

    pub fn first_slot(&self) -> Slot {
        self.first_slot
    }

    pub fn last_slot(&self) -> Slot {
        self.last_slot
    }

    pub fn count(&self) -> u64 {
        self.last_slot.0 - self.first_slot.0 + 1
    }

    pub fn first_block(&self) -> Option<&Block> {
        self.blocks.first()
    }

    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blob_sidecars_by_block_root(&self) -> &HashMap<Bytes32, Vec<BlobSidecar>> {
        &self.blob_sidecars_by_block_root
    }

    pub fn source(&self) -> Option<PeerId> {
        self.source
    }

    pub fn target_chain(&self) -> &TargetChain {
        &self.target_chain
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Both boundaries corroborated, and the content not known to be bad.
    pub fn is_confirmed(&self) -> bool {
        self.first_block_confirmed && self.last_block_confirmed && !self.invalid
    }

    pub fn is_first_block_confirmed(&self) -> bool {
        self.first_block_confirmed && !self.invalid
    }

    pub fn is_last_block_confirmed(&self) -> bool {
        self.last_block_confirmed && !self.invalid
    }

    pub fn is_contested(&self) -> bool {
        self.contested
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// The range was fully downloaded and holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.complete && self.blocks.is_empty()
    }

    pub fn is_awaiting_blocks(&self) -> bool {
        self.awaiting_blocks
    }

    pub fn mark_complete(&mut self) -> Result<(), BatchError> {
        if self.awaiting_blocks {
            return Err(BatchError::AwaitingBlocks);
        }
        self.complete = true;
        Ok(())
    }

    pub fn mark_first_block_confirmed(&mut self) {
        if !self.invalid {
            self.first_block_confirmed = true;
        }
    }

    pub fn mark_last_block_confirmed(&mut self) {
        if !self.invalid {
            self.last_block_confirmed = true;
        }
    }

    /// Conflicting data was seen for this range. Content is kept; the
    /// scheduler decides whether to re-fetch.
    pub fn mark_as_contested(&mut self) {
        debug!(
            first_slot = self.first_slot.0,
            last_slot = self.last_slot.0,
            "Batch contested"
        );
        self.contested = true;
    }

    /// Content failed validation. Terminal: the batch must be replaced.
    pub fn mark_as_invalid(&mut self) {
        debug!(
            first_slot = self.first_slot.0,
            last_slot = self.last_slot.0,
            source = ?self.source,
            "Batch invalid"
        );
        self.invalid = true;
        self.first_block_confirmed = false;
        self.last_block_confirmed = false;
    }

    /// Start a request to `source` for the slots not yet covered.
    ///
    /// Returns the `(start_slot, count)` to request.
    pub fn begin_request(&mut self, source: PeerId) -> Result<(Slot, u64), BatchError> {
        if self.invalid {
            return Err(BatchError::Invalid);
        }
        if self.awaiting_blocks {
            return Err(BatchError::AlreadyAwaitingBlocks);
        }
        if self.complete {
            return Err(BatchError::AlreadyComplete);
        }

        let start_slot = self
            .blocks
            .last()
            .map_or(self.first_slot, |block| block.slot.saturating_add(1));
        let count = self.last_slot.0 - start_slot.0 + 1;

        self.awaiting_blocks = true;
        self.source = Some(source);
        Ok((start_slot, count))
    }

    /// Apply a response to the outstanding request.
    ///
    /// An empty response, or one reaching `last_slot`, completes the batch.
    /// A rejected response leaves the content untouched.
    pub fn on_blocks_received(&mut self, response: BlocksByRangeResponse) -> Result<(), BatchError> {
        if !self.awaiting_blocks {
            return Err(BatchError::NotAwaitingBlocks);
        }
        self.awaiting_blocks = false;

        self.validate_response(&response)?;

        let BlocksByRangeResponse {
            blocks,
            blob_sidecars,
        } = response;

        let reached_end = match blocks.last() {
            None => true,
            Some(block) => block.slot >= self.last_slot,
        };

        trace!(
            first_slot = self.first_slot.0,
            num_blocks = blocks.len(),
            num_sidecars = blob_sidecars.len(),
            "Batch received blocks"
        );

        self.blocks.extend(blocks);
        for sidecar in blob_sidecars {
            self.blob_sidecars_by_block_root
                .entry(sidecar.block_root)
                .or_default()
                .push(sidecar);
        }

        if reached_end {
            self.complete = true;
        }
        Ok(())
    }

    /// The outstanding request failed; the source is dropped.
    pub fn on_request_failed(&mut self) {
        self.awaiting_blocks = false;
        self.source = None;
    }

    /// Arrange for more blocks to arrive from `source`.
    ///
    /// Completion of the returned future stands in for the callback of the
    /// batch contract. Fails immediately if a request is already outstanding.
    pub async fn request_more_blocks<N: NetworkRequester + ?Sized>(
        &mut self,
        network: &N,
        source: PeerId,
    ) -> Result<(), SyncError> {
        let (start_slot, count) = self
            .begin_request(source)
            .map_err(|err| SyncError::Other(err.into()))?;

        match network.request_blocks_by_range(source, start_slot, count).await {
            Ok(response) => {
                self.on_blocks_received(response)
                    .map_err(|err| SyncError::InvalidResponse {
                        peer: source,
                        reason: err.to_string(),
                    })
            }
            Err(err) => {
                self.on_request_failed();
                Err(err)
            }
        }
    }

    /// Sidecars delivered for the block with `root`.
    pub fn blob_sidecars_for(&self, root: &Bytes32) -> Vec<BlobSidecar> {
        self.blob_sidecars_by_block_root
            .get(root)
            .cloned()
            .unwrap_or_default()
    }

    fn validate_response(&self, response: &BlocksByRangeResponse) -> Result<(), BatchError> {
        let mut previous = self.blocks.last().map(|block| block.slot);
        for block in &response.blocks {
            if block.slot < self.first_slot || block.slot > self.last_slot {
                return Err(BatchError::BlockOutOfRange {
                    slot: block.slot,
                    first_slot: self.first_slot,
                    last_slot: self.last_slot,
                });
            }
            if let Some(previous) = previous {
                if block.slot <= previous {
                    return Err(BatchError::BlocksOutOfOrder {
                        slot: block.slot,
                        previous,
                    });
                }
            }
            previous = Some(block.slot);
        }

        if response.blob_sidecars.is_empty() {
            return Ok(());
        }

        let roots: Vec<Bytes32> = self
            .blocks
            .iter()
            .chain(&response.blocks)
            .map(Block::root)
            .collect();
        for sidecar in &response.blob_sidecars {
            if !roots.contains(&sidecar.block_root) {
                return Err(BatchError::UnexpectedSidecar { slot: sidecar.slot });
            }
        }
        Ok(())
    }
}
