/// Chain store seen by the sync engine.
///
/// Fork choice owns the real store; sync only reads its finalized and head
/// progress and proposes imports through a transaction.
use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use containers::{BlobSidecar, Block, Bytes32, Epoch, Slot};
use parking_lot::RwLock;
use tracing::debug;

pub trait ChainStore: Send + Sync {
    fn finalized_epoch(&self) -> Epoch;

    fn head_slot(&self) -> Slot;

    fn head_root(&self) -> Bytes32;

    /// Wall-clock slot, `None` before genesis.
    fn current_slot(&self) -> Option<Slot>;

    /// Root of the canonical block proposed exactly at `slot`.
    fn block_root_at_slot(&self, slot: Slot) -> Option<Bytes32>;

    fn contains_block(&self, root: &Bytes32) -> bool;

    fn begin_transaction(&self) -> Box<dyn StoreTransaction + '_>;
}

/// Atomic update of the store. Nothing is visible until `commit`.
pub trait StoreTransaction: Send {
    fn put_block(&mut self, block: Block, blob_sidecars: Vec<BlobSidecar>);

    fn commit(self: Box<Self>) -> Result<()>;
}

struct MemoryStoreInner {
    blocks: HashMap<Bytes32, Block>,
    blob_sidecars: HashMap<Bytes32, Vec<BlobSidecar>>,
    canonical: BTreeMap<Slot, Bytes32>,
    head: (Slot, Bytes32),
    finalized_epoch: Epoch,
    current_slot: Option<Slot>,
}

/// In-memory store with longest-chain head selection.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    slots_per_epoch: u64,
    /// When set, finalization trails the head epoch by this many epochs.
    finalization_lag_epochs: Option<u64>,
}

impl MemoryStore {
    pub fn new(genesis: Block, slots_per_epoch: u64) -> Self {
        let root = genesis.root();
        let slot = genesis.slot;
        let inner = MemoryStoreInner {
            blocks: HashMap::from([(root, genesis)]),
            blob_sidecars: HashMap::new(),
            canonical: BTreeMap::from([(slot, root)]),
            head: (slot, root),
            finalized_epoch: Epoch(0),
            current_slot: Some(slot),
        };

        Self {
            inner: RwLock::new(inner),
            slots_per_epoch,
            finalization_lag_epochs: None,
        }
    }

    pub fn with_finalization_lag(mut self, epochs: u64) -> Self {
        self.finalization_lag_epochs = Some(epochs);
        self
    }

    pub fn set_current_slot(&self, slot: Option<Slot>) {
        self.inner.write().current_slot = slot;
    }

    pub fn set_finalized_epoch(&self, epoch: Epoch) {
        self.inner.write().finalized_epoch = epoch;
    }

    pub fn get_block(&self, root: &Bytes32) -> Option<Block> {
        self.inner.read().blocks.get(root).cloned()
    }

    pub fn blob_sidecars(&self, root: &Bytes32) -> Vec<BlobSidecar> {
        self.inner
            .read()
            .blob_sidecars
            .get(root)
            .cloned()
            .unwrap_or_default()
    }

    /// Import blocks directly, bypassing the transaction API.
    pub fn import_blocks(&self, blocks: impl IntoIterator<Item = Block>) -> Result<()> {
        let mut transaction = self.begin_transaction();
        for block in blocks {
            transaction.put_block(block, Vec::new());
        }
        transaction.commit()
    }

    fn apply(&self, pending: Vec<(Block, Vec<BlobSidecar>)>) -> Result<()> {
        let mut inner = self.inner.write();

        for (block, _) in &pending {
            let known_parent = inner.blocks.contains_key(&block.parent_root)
                || pending.iter().any(|(other, _)| other.root() == block.parent_root);
            if !known_parent {
                bail!(
                    "block at slot {} has unknown parent {}",
                    block.slot,
                    block.parent_root
                );
            }
        }

        for (block, blob_sidecars) in pending {
            let root = block.root();
            if !blob_sidecars.is_empty() {
                inner.blob_sidecars.insert(root, blob_sidecars);
            }
            inner.blocks.insert(root, block);
            Self::update_head(&mut inner, root);
        }

        if let Some(lag) = self.finalization_lag_epochs {
            let head_epoch = inner.head.0.epoch(self.slots_per_epoch);
            let candidate = Epoch(head_epoch.0.saturating_sub(lag));
            if candidate > inner.finalized_epoch {
                debug!(finalized_epoch = candidate.0, "Advanced finalized epoch");
                inner.finalized_epoch = candidate;
            }
        }

        Ok(())
    }

    fn update_head(inner: &mut MemoryStoreInner, root: Bytes32) {
        let Some(slot) = inner.blocks.get(&root).map(|block| block.slot) else {
            return;
        };
        if slot <= inner.head.0 {
            return;
        }

        // Walk back until we meet the canonical chain.
        let mut branch = Vec::new();
        let mut fork_slot = None;
        let mut cursor = root;
        while let Some(block) = inner.blocks.get(&cursor) {
            if inner.canonical.get(&block.slot) == Some(&cursor) {
                fork_slot = Some(block.slot);
                break;
            }
            branch.push((block.slot, cursor));
            if block.is_genesis() {
                break;
            }
            cursor = block.parent_root;
        }

        let first_replaced = fork_slot.map_or(Slot(0), |slot| slot.saturating_add(1));
        inner.canonical.split_off(&first_replaced);
        inner.canonical.extend(branch);
        inner.head = (slot, root);
    }
}

impl ChainStore for MemoryStore {
    fn finalized_epoch(&self) -> Epoch {
        self.inner.read().finalized_epoch
    }

    fn head_slot(&self) -> Slot {
        self.inner.read().head.0
    }

    fn head_root(&self) -> Bytes32 {
        self.inner.read().head.1
    }

    fn current_slot(&self) -> Option<Slot> {
        self.inner.read().current_slot
    }

    fn block_root_at_slot(&self, slot: Slot) -> Option<Bytes32> {
        self.inner.read().canonical.get(&slot).copied()
    }

    fn contains_block(&self, root: &Bytes32) -> bool {
        self.inner.read().blocks.contains_key(root)
    }

    fn begin_transaction(&self) -> Box<dyn StoreTransaction + '_> {
        Box::new(MemoryStoreTransaction {
            store: self,
            pending: Vec::new(),
        })
    }
}

struct MemoryStoreTransaction<'a> {
    store: &'a MemoryStore,
    pending: Vec<(Block, Vec<BlobSidecar>)>,
}

impl StoreTransaction for MemoryStoreTransaction<'_> {
    fn put_block(&mut self, block: Block, blob_sidecars: Vec<BlobSidecar>) {
        self.pending.push((block, blob_sidecars));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.store.apply(self.pending)
    }
}
