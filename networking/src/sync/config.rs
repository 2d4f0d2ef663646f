/// Sync service configuration.
///
/// Operational parameters for synchronization: retry delays, thresholds and
/// batch sizes.
use std::time::Duration;

use chain::{ChainConfig, DEVNET_CONFIG};

/// Delay before re-selecting a peer after a session ended unsuccessfully.
pub const SHORT_DELAY: Duration = Duration::from_secs(5);

/// Delay before retrying when no peer is suitable, and how long a peer stays
/// excluded after a sync error.
pub const LONG_DELAY: Duration = Duration::from_secs(20);

/// How far ahead (in epochs) a peer must be before we sync from it.
pub const SYNC_THRESHOLD_IN_EPOCHS: u64 = 1;

/// Tolerated clock skew (in slots) for a peer's advertised head.
pub const SLOT_ERROR_THRESHOLD: u64 = 1;

/// Maximum slots covered by a single batch request.
pub const DEFAULT_BATCH_SIZE: u64 = 64;

/// Number of consecutive slots sampled when probing for a common ancestor.
pub const SAMPLE_COUNT: u64 = 32;

/// Below this distance from the lower bound, the probe skips sampling.
pub const SAMPLE_MIN_DISTANCE: u64 = 64;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub chain: ChainConfig,
    pub short_delay: Duration,
    pub long_delay: Duration,
    pub sync_threshold_in_epochs: u64,
    pub batch_size: u64,
}

impl SyncConfig {
    pub fn slots_per_epoch(&self) -> u64 {
        self.chain.slots_per_epoch
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chain: DEVNET_CONFIG,
            short_delay: SHORT_DELAY,
            long_delay: LONG_DELAY,
            sync_threshold_in_epochs: SYNC_THRESHOLD_IN_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}
