//! Multi-threaded allocate/free churn across both tiers.
//!
//! Each worker keeps a bounded set of live blocks, randomly allocating on
//! HOST or CXL and freeing one of its own blocks. With a thread-scoped mode
//! register the worker selects the tier through the register; with the
//! process-wide register (shared by every worker) it pins the tier per call
//! instead. Every free is checked against the tier the worker asked for.

use std::time::Instant;

use serde::Serialize;
use tiermem_core::{AllocError, Engine, EngineStats, MemoryTier, ModeScope};

use crate::error::HarnessError;

/// Workload parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ChurnConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    /// Largest single request in bytes.
    pub max_size: usize,
    /// Share of allocations aimed at CXL, 0..=100.
    pub cxl_percent: u8,
    /// Live blocks each worker may hold at once.
    pub max_live_per_thread: usize,
    pub seed: u64,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 10_000,
            max_size: 4096,
            cxl_percent: 50,
            max_live_per_thread: 256,
            seed: 0x5EED_7135_4E4D_0001,
        }
    }
}

/// Per-tier outcome counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierTally {
    pub tier: MemoryTier,
    pub allocations: u64,
    pub frees: u64,
    pub out_of_memory: u64,
}

/// Result of one churn run.
#[derive(Debug, Clone, Serialize)]
pub struct ChurnReport {
    pub config: ChurnConfig,
    pub scope: ModeScope,
    pub elapsed_ms: u64,
    pub tiers: Vec<TierTally>,
    /// Frees whose recorded tier differed from the requested one.
    pub tier_mismatches: u64,
    pub unknown_frees: u64,
    /// Each worker's own high-water mark, added up. An upper bound on the
    /// concurrent peak, not the peak itself.
    pub sum_of_worker_peaks: usize,
    pub engine: EngineStats,
}

impl ChurnReport {
    #[must_use]
    pub fn tier(&self, tier: MemoryTier) -> &TierTally {
        &self.tiers[tier.index()]
    }

    /// No mismatched or unknown frees, and nothing left live.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.tier_mismatches == 0 && self.unknown_frees == 0 && self.engine.live_blocks == 0
    }
}

struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[derive(Default)]
struct WorkerTally {
    tiers: [TierTally; MemoryTier::COUNT],
    tier_mismatches: u64,
    unknown_frees: u64,
    peak_live: usize,
}

impl WorkerTally {
    fn new() -> Self {
        let mut tally = Self::default();
        for tier in MemoryTier::ALL {
            tally.tiers[tier.index()].tier = tier;
        }
        tally
    }

    fn release(&mut self, engine: &Engine, addr: usize, expected: MemoryTier) {
        match engine.free(addr) {
            Ok(recorded) => {
                self.tiers[recorded.index()].frees += 1;
                if recorded != expected {
                    self.tier_mismatches += 1;
                }
            }
            Err(_) => self.unknown_frees += 1,
        }
    }
}

fn worker(engine: &Engine, config: &ChurnConfig, index: usize) -> Result<WorkerTally, AllocError> {
    let mut rng = XorShift64::new(config.seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let mut tally = WorkerTally::new();
    let mut live: Vec<(usize, MemoryTier)> = Vec::with_capacity(config.max_live_per_thread);
    let thread_scoped = engine.config().scope == ModeScope::Thread;
    let max_size = config.max_size.max(1);

    for _ in 0..config.ops_per_thread {
        let r = rng.next();
        let want_alloc =
            live.is_empty() || (live.len() < config.max_live_per_thread && r % 3 != 0);

        if want_alloc {
            let tier = if (r >> 8) % 100 < u64::from(config.cxl_percent) {
                MemoryTier::Cxl
            } else {
                MemoryTier::Host
            };
            let size = 1 + ((r >> 16) as usize % max_size);
            let result = if thread_scoped {
                engine.set_memory_mode(tier);
                engine.allocate(size)
            } else {
                engine.allocate_on(tier, size)
            };
            match result {
                Ok(addr) => {
                    tally.tiers[tier.index()].allocations += 1;
                    live.push((addr, tier));
                    tally.peak_live = tally.peak_live.max(live.len());
                }
                Err(AllocError::OutOfMemory { tier, .. }) => {
                    tally.tiers[tier.index()].out_of_memory += 1;
                }
                Err(err) => return Err(err),
            }
        } else {
            let idx = (r >> 24) as usize % live.len();
            let (addr, tier) = live.swap_remove(idx);
            tally.release(engine, addr, tier);
        }
    }

    for (addr, tier) in live {
        tally.release(engine, addr, tier);
    }
    Ok(tally)
}

/// Run the churn workload against `engine` and verify it afterwards.
///
/// The engine should be otherwise idle; the final verification assumes no
/// other thread is allocating.
pub fn run_churn(engine: &Engine, config: &ChurnConfig) -> Result<ChurnReport, HarnessError> {
    let start = Instant::now();
    let tallies: Vec<WorkerTally> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..config.threads.max(1))
            .map(|i| s.spawn(move || worker(engine, config, i)))
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(result) => result.map_err(HarnessError::from),
                Err(_) => Err(HarnessError::WorkerPanicked),
            })
            .collect::<Result<Vec<_>, _>>()
    })?;
    let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    engine.verify()?;

    let mut tiers = WorkerTally::new().tiers;
    let mut tier_mismatches = 0;
    let mut unknown_frees = 0;
    let mut sum_of_worker_peaks = 0;
    for t in &tallies {
        for tier in MemoryTier::ALL {
            let dst = &mut tiers[tier.index()];
            let src = &t.tiers[tier.index()];
            dst.allocations += src.allocations;
            dst.frees += src.frees;
            dst.out_of_memory += src.out_of_memory;
        }
        tier_mismatches += t.tier_mismatches;
        unknown_frees += t.unknown_frees;
        sum_of_worker_peaks += t.peak_live;
    }

    Ok(ChurnReport {
        config: config.clone(),
        scope: engine.config().scope,
        elapsed_ms,
        tiers: tiers.to_vec(),
        tier_mismatches,
        unknown_frees,
        sum_of_worker_peaks,
        engine: engine.stats(),
    })
}
