//! Block metadata table: address -> {size, tier}.
//!
//! Sharded by address bits so concurrent routers rarely contend.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use crate::tier::MemoryTier;
use crate::tier_alloc::GRANULE;

/// Number of shards for table locks (power of 2).
pub const NUM_SHARDS: usize = 16;

/// A live allocation. Its tier is fixed when the block is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Block {
    pub addr: usize,
    /// Bytes the caller asked for.
    pub size: usize,
    /// Bytes carved from the arena.
    pub reserved: usize,
    pub tier: MemoryTier,
}

/// Per-tier totals over the live blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierTally {
    pub blocks: usize,
    pub requested_bytes: usize,
    pub reserved_bytes: usize,
}

/// Thread-safe block table.
pub struct BlockTable {
    shards: Box<[Mutex<HashMap<usize, Block>>]>,
}

impl Default for BlockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockTable {
    #[must_use]
    pub fn new() -> Self {
        let shards: Vec<Mutex<HashMap<usize, Block>>> =
            (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    fn shard_for(addr: usize) -> usize {
        (addr / GRANULE) & (NUM_SHARDS - 1)
    }

    fn shard(&self, addr: usize) -> &Mutex<HashMap<usize, Block>> {
        &self.shards[Self::shard_for(addr)]
    }

    /// Record a block. Returns the entry it displaced, which indicates a
    /// router bug if it is ever `Some`.
    pub fn insert(&self, block: Block) -> Option<Block> {
        self.shard(block.addr).lock().insert(block.addr, block)
    }

    pub fn remove(&self, addr: usize) -> Option<Block> {
        self.shard(addr).lock().remove(&addr)
    }

    #[must_use]
    pub fn get(&self, addr: usize) -> Option<Block> {
        self.shard(addr).lock().get(&addr).copied()
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.shard(addr).lock().contains_key(&addr)
    }

    /// Run `f` on the block at `addr` while its shard is locked.
    pub fn with_block_mut<R>(&self, addr: usize, f: impl FnOnce(&mut Block) -> R) -> Option<R> {
        self.shard(addr).lock().get_mut(&addr).map(f)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    /// All live blocks, ordered by address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> = self
            .shards
            .iter()
            .flat_map(|s| s.lock().values().copied().collect::<Vec<_>>())
            .collect();
        blocks.sort_unstable_by_key(|b| b.addr);
        blocks
    }

    /// Per-tier totals, indexed by [`MemoryTier::index`].
    #[must_use]
    pub fn tally(&self) -> [TierTally; MemoryTier::COUNT] {
        let mut out = [TierTally::default(); MemoryTier::COUNT];
        for shard in self.shards.iter() {
            for block in shard.lock().values() {
                let t = &mut out[block.tier.index()];
                t.blocks += 1;
                t.requested_bytes += block.size;
                t.reserved_bytes += block.reserved;
            }
        }
        out
    }
}
