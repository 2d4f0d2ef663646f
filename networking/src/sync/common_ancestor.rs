/// Common ancestor discovery.
///
/// Before downloading from a target chain we need a slot at which our chain
/// and the target agree. A single peer's answer may be wrong (it could be on a
/// different fork, or simply lying), so when two peers are available both are
/// asked and the answers must match.
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chain::ChainConfig;
use containers::Slot;
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use tracing::{debug, trace, warn};

use super::{
    batch::NetworkRequester,
    config::{SAMPLE_COUNT, SAMPLE_MIN_DISTANCE},
    store::ChainStore,
    target_chain::TargetChain,
};

/// Single-peer common ancestor lookup.
#[async_trait]
pub trait CommonAncestorProbe: Send + Sync {
    /// Highest slot in `[lower_bound, upper_bound]` at which our chain and the
    /// peer's chain are believed to agree.
    async fn get_common_ancestor(
        &self,
        peer_id: PeerId,
        lower_bound: Slot,
        upper_bound: Slot,
    ) -> Result<Slot>;
}

/// Probe that samples the peer's most recent blocks below our head and looks
/// for the highest one we also have on our canonical chain.
pub struct SampledCommonAncestor<N: NetworkRequester> {
    store: Arc<dyn ChainStore>,
    network: Arc<N>,
}

impl<N: NetworkRequester> SampledCommonAncestor<N> {
    pub fn new(store: Arc<dyn ChainStore>, network: Arc<N>) -> Self {
        Self { store, network }
    }
}

#[async_trait]
impl<N: NetworkRequester> CommonAncestorProbe for SampledCommonAncestor<N> {
    async fn get_common_ancestor(
        &self,
        peer_id: PeerId,
        lower_bound: Slot,
        upper_bound: Slot,
    ) -> Result<Slot> {
        let local_head = self.store.head_slot();
        if local_head < lower_bound.saturating_add(SAMPLE_MIN_DISTANCE) {
            trace!(
                peer = %peer_id,
                local_head = local_head.0,
                lower_bound = lower_bound.0,
                "Local head too close to lower bound, skipping sampling"
            );
            return Ok(lower_bound);
        }

        let sample_end = local_head.min(upper_bound);
        if sample_end <= lower_bound {
            return Ok(lower_bound);
        }
        let sample_start = lower_bound.max(sample_end.saturating_sub(SAMPLE_COUNT - 1));
        let count = sample_end.0 - sample_start.0 + 1;

        debug!(
            peer = %peer_id,
            start_slot = sample_start.0,
            count,
            "Sampling blocks to find common ancestor"
        );

        let response = self
            .network
            .request_blocks_by_range(peer_id, sample_start, count)
            .await
            .with_context(|| format!("Failed to sample blocks from peer {peer_id}"))?;

        let ancestor = response
            .blocks
            .iter()
            .rev()
            .find(|block| self.store.block_root_at_slot(block.slot) == Some(block.root()))
            .map_or(lower_bound, |block| block.slot);

        Ok(ancestor)
    }
}

/// Cross-validates the probe across up to two peers of a target chain.
pub struct MultipeerCommonAncestorFinder<P: CommonAncestorProbe> {
    store: Arc<dyn ChainStore>,
    probe: P,
    chain_config: ChainConfig,
    metrics: Option<SharedMetrics>,
}

impl<P: CommonAncestorProbe> MultipeerCommonAncestorFinder<P> {
    pub fn new(store: Arc<dyn ChainStore>, probe: P, chain_config: ChainConfig) -> Self {
        Self {
            store,
            probe,
            chain_config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Slot from which it is safe to start downloading `target_chain`.
    ///
    /// A chain without peers yields the start slot of our finalized epoch.
    /// Probe failures are returned as errors rather than guessed around.
    pub async fn find_common_ancestor(&self, target_chain: &TargetChain) -> Result<Slot> {
        let latest_finalized_slot = self
            .chain_config
            .compute_start_slot_at_epoch(self.store.finalized_epoch());

        let Some(source1) = target_chain.select_random_peer(None) else {
            return Ok(latest_finalized_slot);
        };

        let ancestor = self
            .find_with_sources(latest_finalized_slot, target_chain, source1)
            .await?;
        debug!(slot = ancestor.0, "Found common ancestor");
        Ok(ancestor)
    }

    async fn find_with_sources(
        &self,
        latest_finalized_slot: Slot,
        target_chain: &TargetChain,
        source1: PeerId,
    ) -> Result<Slot> {
        let head_slot = target_chain.chain_head().slot;

        let Some(source2) = target_chain.select_random_peer(Some(&source1)) else {
            debug!("Finding common ancestor from one peer");
            return self
                .probe
                .get_common_ancestor(source1, latest_finalized_slot, head_slot)
                .await;
        };

        debug!("Finding common ancestor from two peers");
        let (ancestor1, ancestor2) = futures::try_join!(
            self.probe
                .get_common_ancestor(source1, latest_finalized_slot, head_slot),
            self.probe
                .get_common_ancestor(source2, latest_finalized_slot, head_slot),
        )
        .context("Failed to find common ancestor")?;

        Ok(self.verify_results_match(latest_finalized_slot, target_chain, ancestor1, ancestor2))
    }

    fn verify_results_match(
        &self,
        latest_finalized_slot: Slot,
        target_chain: &TargetChain,
        ancestor1: Slot,
        ancestor2: Slot,
    ) -> Slot {
        if ancestor1 == ancestor2 {
            trace!(slot = ancestor1.0, "Found consistent common ancestor");
            return ancestor1;
        }

        warn!(
            %target_chain,
            ancestor1 = ancestor1.0,
            ancestor2 = ancestor2.0,
            "Found different common ancestors, starting sync from finalized checkpoint"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_common_ancestor_mismatches();
        }
        latest_finalized_slot
    }
}
