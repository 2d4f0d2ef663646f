use serde::{Deserialize, Serialize};
use ssz_derive::Ssz;
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ssz, Default, Serialize, Deserialize)]
pub struct Slot(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ssz, Default, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Slot {
    /// Epoch containing this slot.
    ///
    /// # Panics
    ///
    /// Panics if `slots_per_epoch` is zero.
    pub fn epoch(self, slots_per_epoch: u64) -> Epoch {
        Epoch(self.0 / slots_per_epoch)
    }

    pub fn saturating_sub(self, slots: u64) -> Slot {
        Slot(self.0.saturating_sub(slots))
    }

    pub fn saturating_add(self, slots: u64) -> Slot {
        Slot(self.0.saturating_add(slots))
    }
}

impl Epoch {
    /// First slot of this epoch.
    pub fn start_slot(self, slots_per_epoch: u64) -> Slot {
        Slot(self.0.saturating_mul(slots_per_epoch))
    }

    pub fn saturating_add(self, epochs: u64) -> Epoch {
        Epoch(self.0.saturating_add(epochs))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(31, 0)]
    #[case(32, 1)]
    #[case(320, 10)]
    #[case(449, 14)]
    fn test_slot_epoch(#[case] slot: u64, #[case] epoch: u64) {
        assert_eq!(Slot(slot).epoch(32), Epoch(epoch));
    }

    #[test]
    fn test_epoch_start_slot() {
        assert_eq!(Epoch(0).start_slot(32), Slot(0));
        assert_eq!(Epoch(10).start_slot(32), Slot(320));
        assert_eq!(Epoch(u64::MAX).start_slot(32), Slot(u64::MAX));
    }

    #[test]
    fn test_slot_ordering() {
        assert!(Slot(5) < Slot(6));
        assert_eq!(Slot(3).saturating_sub(5), Slot(0));
        assert_eq!(Slot(3).saturating_add(5), Slot(8));
    }
}
