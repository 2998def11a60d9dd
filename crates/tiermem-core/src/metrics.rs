//! Atomic counters for engine observability.
//!
//! All counters use relaxed ordering: they are advisory, not synchronization.
//! Gauges (`live_blocks`, `outstanding_bytes`) are only exact at quiescent
//! points.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::tier::MemoryTier;

/// Counters for one tier.
#[derive(Debug, Default)]
pub struct TierCounters {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    /// Gauge: live blocks.
    pub live_blocks: AtomicU64,
    /// Gauge: caller-requested bytes outstanding.
    pub outstanding_bytes: AtomicU64,
    pub out_of_memory: AtomicU64,
    pub arena_growths: AtomicU64,
}

/// Snapshot of [`TierCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierCountersSnapshot {
    pub tier: MemoryTier,
    pub allocations: u64,
    pub frees: u64,
    pub live_blocks: u64,
    pub outstanding_bytes: u64,
    pub out_of_memory: u64,
    pub arena_growths: u64,
}

/// Engine-wide counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    tiers: [TierCounters; MemoryTier::COUNT],
    pub unknown_frees: AtomicU64,
    pub invalid_requests: AtomicU64,
    pub resizes_in_place: AtomicU64,
    pub trims: AtomicU64,
}

/// Snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tiers: Vec<TierCountersSnapshot>,
    pub unknown_frees: u64,
    pub invalid_requests: u64,
    pub resizes_in_place: u64,
    pub trims: u64,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn tier(&self, tier: MemoryTier) -> &TierCountersSnapshot {
        &self.tiers[tier.index()]
    }
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn tier(&self, tier: MemoryTier) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    pub fn on_allocate(&self, tier: MemoryTier, size: usize, grew: bool) {
        let t = self.tier(tier);
        Self::inc(&t.allocations);
        Self::inc(&t.live_blocks);
        t.outstanding_bytes.fetch_add(size as u64, Ordering::Relaxed);
        if grew {
            Self::inc(&t.arena_growths);
        }
    }

    pub fn on_free(&self, tier: MemoryTier, size: usize) {
        let t = self.tier(tier);
        Self::inc(&t.frees);
        t.live_blocks.fetch_sub(1, Ordering::Relaxed);
        t.outstanding_bytes.fetch_sub(size as u64, Ordering::Relaxed);
    }

    /// Adjust the outstanding gauge after an in-place resize.
    pub fn on_resize(&self, tier: MemoryTier, old_size: usize, new_size: usize) {
        let t = self.tier(tier);
        Self::inc(&self.resizes_in_place);
        if new_size >= old_size {
            t.outstanding_bytes
                .fetch_add((new_size - old_size) as u64, Ordering::Relaxed);
        } else {
            t.outstanding_bytes
                .fetch_sub((old_size - new_size) as u64, Ordering::Relaxed);
        }
    }

    pub fn on_out_of_memory(&self, tier: MemoryTier) {
        Self::inc(&self.tier(tier).out_of_memory);
    }

    /// Live blocks across every tier.
    #[must_use]
    pub fn live_blocks(&self) -> u64 {
        self.tiers.iter().map(|t| Self::get(&t.live_blocks)).sum()
    }

    /// Outstanding requested bytes across every tier.
    #[must_use]
    pub fn outstanding_bytes(&self) -> u64 {
        self.tiers.iter().map(|t| Self::get(&t.outstanding_bytes)).sum()
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tiers: MemoryTier::ALL
                .iter()
                .map(|&tier| {
                    let t = self.tier(tier);
                    TierCountersSnapshot {
                        tier,
                        allocations: Self::get(&t.allocations),
                        frees: Self::get(&t.frees),
                        live_blocks: Self::get(&t.live_blocks),
                        outstanding_bytes: Self::get(&t.outstanding_bytes),
                        out_of_memory: Self::get(&t.out_of_memory),
                        arena_growths: Self::get(&t.arena_growths),
                    }
                })
                .collect(),
            unknown_frees: Self::get(&self.unknown_frees),
            invalid_requests: Self::get(&self.invalid_requests),
            resizes_in_place: Self::get(&self.resizes_in_place),
            trims: Self::get(&self.trims),
        }
    }
}
