use containers::{Epoch, Slot};

pub const SLOT_DURATION_MS: u64 = 4_000;
pub const SECONDS_PER_SLOT: u64 = SLOT_DURATION_MS / 1_000;
pub const SLOTS_PER_EPOCH: u64 = 32;

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub slot_duration_ms: u64,
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
}

pub const DEVNET_CONFIG: ChainConfig = ChainConfig {
    slot_duration_ms: SLOT_DURATION_MS,
    seconds_per_slot: SECONDS_PER_SLOT,
    slots_per_epoch: SLOTS_PER_EPOCH,
};

impl ChainConfig {
    pub fn compute_epoch_at_slot(&self, slot: Slot) -> Epoch {
        slot.epoch(self.slots_per_epoch)
    }

    pub fn compute_start_slot_at_epoch(&self, epoch: Epoch) -> Slot {
        epoch.start_slot(self.slots_per_epoch)
    }

    /// Slot in progress at `now` (unix seconds), `None` before genesis.
    pub fn slot_at_time(&self, genesis_time: u64, now: u64) -> Option<Slot> {
        now.checked_sub(genesis_time)
            .map(|elapsed| Slot(elapsed / self.seconds_per_slot))
    }

    /// Number of slots that make up `epochs` epochs.
    pub fn slots_in_epochs(&self, epochs: u64) -> u64 {
        epochs.saturating_mul(self.slots_per_epoch)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        DEVNET_CONFIG
    }
}
