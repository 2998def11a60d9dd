//! Allocation router.
//!
//! The [`Engine`] owns one tier allocator per tier, the mode register, and
//! the block table. Allocation consults the register, carves from the
//! selected tier and records the block before handing the address out.
//! Release looks the block up and returns it to the tier recorded on the
//! block, whatever the register says at that moment.
//!
//! Lock order: a table shard may be held while a tier lock is taken, never
//! the other way round.

use serde::Serialize;

use crate::backend::{ArenaBackend, PAGE_SIZE, backend_for};
use crate::block_table::{Block, BlockTable, TierTally};
use crate::config::{BackendKind, EngineConfig, ModeScope};
use crate::error::{AllocError, ConfigError, GrowError, InvariantViolation};
use crate::log::{LifecycleLog, LifecycleRecord, LogEvent, LogLevel};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::mode::ModeRegister;
use crate::reentry::EngineScope;
use crate::tier::MemoryTier;
use crate::tier_alloc::{GRANULE, TierAllocator, TierStats, granule_align};

/// Largest request the router accepts.
pub const MAX_REQUEST: usize = (isize::MAX as usize) & !(GRANULE - 1);

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub mode: MemoryTier,
    pub scope: ModeScope,
    pub explicit_indicator_enabled: bool,
    pub mode_switches: u64,
    pub live_blocks: usize,
    pub tiers: Vec<TierStats>,
    pub metrics: MetricsSnapshot,
    pub log_records_dropped: u64,
}

impl EngineStats {
    #[must_use]
    pub fn tier(&self, tier: MemoryTier) -> &TierStats {
        &self.tiers[tier.index()]
    }
}

/// Explicit-indicator allocation engine.
pub struct Engine {
    config: EngineConfig,
    mode: ModeRegister,
    tiers: [TierAllocator; MemoryTier::COUNT],
    table: BlockTable,
    metrics: EngineMetrics,
    log: LifecycleLog,
}

impl Engine {
    /// Build an engine with the backends `config` selects.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let host = backend_for(MemoryTier::Host, &config);
        let cxl = backend_for(MemoryTier::Cxl, &config);
        let unbound_cxl = config.backend == BackendKind::Mmap && config.cxl.numa_node.is_none();
        let engine = Self::with_backends(config, host, cxl);
        if unbound_cxl {
            engine.note(LogLevel::Warn, || {
                LogEvent::new("init", "cxl_node_unset", "unbound")
                    .tier(MemoryTier::Cxl)
                    .details("cxl segments use the local placement policy")
            });
        }
        engine
    }

    /// Build an engine from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(EngineConfig::from_env()?))
    }

    /// Build an engine over caller-supplied backends.
    #[must_use]
    pub fn with_backends(
        config: EngineConfig,
        host: Box<dyn ArenaBackend>,
        cxl: Box<dyn ArenaBackend>,
    ) -> Self {
        let _scope = EngineScope::enter();
        debug_assert_eq!(host.tier(), MemoryTier::Host);
        debug_assert_eq!(cxl.tier(), MemoryTier::Cxl);
        let tiers = [
            TierAllocator::new(MemoryTier::Host, host, config.host.capacity, config.segment_size),
            TierAllocator::new(MemoryTier::Cxl, cxl, config.cxl.capacity, config.segment_size),
        ];
        let engine = Self {
            mode: ModeRegister::new(config.scope),
            tiers,
            table: BlockTable::new(),
            metrics: EngineMetrics::new(),
            log: LifecycleLog::new(config.log_level, config.log_capacity),
            config,
        };
        engine.note(LogLevel::Info, || {
            LogEvent::new("init", "engine_ready", "ready").details(format!(
                "scope={:?} host={} cxl={}",
                engine.config.scope,
                engine.tiers[0].backend_description(),
                engine.tiers[1].backend_description()
            ))
        });
        engine
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn note<F>(&self, level: LogLevel, build: F)
    where
        F: FnOnce() -> LogEvent,
    {
        if self.log.enabled(level) {
            self.log.record(
                level,
                build(),
                self.metrics.live_blocks(),
                self.metrics.outstanding_bytes(),
            );
        }
    }

    fn tier_alloc(&self, tier: MemoryTier) -> &TierAllocator {
        &self.tiers[tier.index()]
    }

    // -----------------------------------------------------------------------
    // Explicit indicator
    // -----------------------------------------------------------------------

    /// Turn on explicit-indicator mode. Idempotent. The register already
    /// reads HOST until a tier is selected.
    pub fn enable_explicit_indicator(&self) {
        let _scope = EngineScope::enter();
        if self.mode.enable() {
            self.note(LogLevel::Info, || {
                LogEvent::new("enable_explicit_indicator", "indicator_enabled", "applied")
                    .tier(self.mode.get())
            });
        }
    }

    #[must_use]
    pub fn is_explicit_indicator_enabled(&self) -> bool {
        self.mode.is_enabled()
    }

    /// Route subsequent allocations (in the configured scope) to `tier`.
    /// Returns the previously selected tier.
    pub fn set_memory_mode(&self, tier: MemoryTier) -> MemoryTier {
        let _scope = EngineScope::enter();
        let prev = self.mode.set(tier);
        if prev != tier {
            self.note(LogLevel::Info, || {
                LogEvent::new("set_memory_mode", "mode_switch", "applied")
                    .tier(tier)
                    .details(format!(
                        "from={prev} scope={:?} indicator_enabled={}",
                        self.mode.scope(),
                        self.mode.is_enabled()
                    ))
            });
        }
        prev
    }

    pub fn set_host_memory(&self) {
        self.set_memory_mode(MemoryTier::Host);
    }

    pub fn set_cxl_memory(&self) {
        self.set_memory_mode(MemoryTier::Cxl);
    }

    /// Tier the calling thread's next [`Engine::allocate`] draws from.
    #[must_use]
    pub fn get_memory_mode(&self) -> MemoryTier {
        self.mode.get()
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes from the currently selected tier.
    pub fn allocate(&self, size: usize) -> Result<usize, AllocError> {
        let _scope = EngineScope::enter();
        self.route(self.mode.get(), size, GRANULE, "allocate")
    }

    /// Allocate `size` bytes aligned to `align` from the currently selected tier.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<usize, AllocError> {
        let _scope = EngineScope::enter();
        self.route(self.mode.get(), size, align, "allocate_aligned")
    }

    /// Allocate from `tier` regardless of the mode register.
    pub fn allocate_on(&self, tier: MemoryTier, size: usize) -> Result<usize, AllocError> {
        let _scope = EngineScope::enter();
        self.route(tier, size, GRANULE, "allocate_on")
    }

    /// Aligned allocation from `tier` regardless of the mode register.
    pub fn allocate_on_aligned(
        &self,
        tier: MemoryTier,
        size: usize,
        align: usize,
    ) -> Result<usize, AllocError> {
        let _scope = EngineScope::enter();
        self.route(tier, size, align, "allocate_on")
    }

    fn reject(&self, symbol: &'static str, err: AllocError) -> AllocError {
        EngineMetrics::inc(&self.metrics.invalid_requests);
        self.note(LogLevel::Warn, || {
            let event = match err {
                AllocError::InvalidAlignment { .. } => "invalid_alignment",
                _ => "invalid_size",
            };
            LogEvent::new(symbol, event, "rejected").details(err.to_string())
        });
        err
    }

    fn checked_reserve(&self, symbol: &'static str, size: usize) -> Result<usize, AllocError> {
        if size == 0 || size > MAX_REQUEST {
            return Err(self.reject(symbol, AllocError::InvalidSize { size }));
        }
        granule_align(size).ok_or_else(|| self.reject(symbol, AllocError::InvalidSize { size }))
    }

    fn route(
        &self,
        tier: MemoryTier,
        size: usize,
        align: usize,
        symbol: &'static str,
    ) -> Result<usize, AllocError> {
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(self.reject(symbol, AllocError::InvalidAlignment { align }));
        }
        let reserved = self.checked_reserve(symbol, size)?;

        let carve = match self.tier_alloc(tier).allocate(reserved, align) {
            Ok(carve) => carve,
            Err(err) => {
                self.metrics.on_out_of_memory(tier);
                let level = match err {
                    GrowError::Backend(_) => LogLevel::Error,
                    GrowError::CapacityExceeded { .. } => LogLevel::Warn,
                };
                self.note(level, || {
                    LogEvent::new(symbol, "tier_exhausted", "oom")
                        .size(size)
                        .tier(tier)
                        .details(err.to_string())
                });
                return Err(AllocError::OutOfMemory {
                    tier,
                    requested: size,
                });
            }
        };

        let displaced = self.table.insert(Block {
            addr: carve.addr,
            size,
            reserved: carve.reserved,
            tier,
        });
        if let Some(stale) = displaced {
            self.note(LogLevel::Error, || {
                LogEvent::new(symbol, "invariant_stale_block", "overwritten")
                    .addr(stale.addr)
                    .size(stale.size)
                    .tier(stale.tier)
            });
        }
        self.metrics.on_allocate(tier, size, carve.grew);

        if carve.grew {
            self.note(LogLevel::Debug, || {
                let stats = self.tier_alloc(tier).stats();
                LogEvent::new(symbol, "arena_grow", "committed")
                    .tier(tier)
                    .details(format!(
                        "committed_bytes={} segments={}",
                        stats.committed_bytes, stats.segments
                    ))
            });
        }
        self.note(LogLevel::Trace, || {
            LogEvent::new(symbol, "alloc", "success")
                .addr(carve.addr)
                .size(size)
                .tier(tier)
        });
        Ok(carve.addr)
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Release the block at `addr` to the tier it was allocated from.
    ///
    /// Returns that tier. An address that is not a live block start fails
    /// with [`AllocError::UnknownAddress`] and leaves the table untouched.
    pub fn free(&self, addr: usize) -> Result<MemoryTier, AllocError> {
        let _scope = EngineScope::enter();
        // Unpublish first so a concurrent allocation reusing the range can
        // never have its fresh record removed.
        let Some(block) = self.table.remove(addr) else {
            EngineMetrics::inc(&self.metrics.unknown_frees);
            self.note(LogLevel::Warn, || {
                LogEvent::new("free", "unknown_address", "rejected")
                    .addr(addr)
                    .details(if addr == 0 {
                        "null_pointer"
                    } else {
                        "address_not_in_block_table"
                    })
            });
            return Err(AllocError::UnknownAddress { addr });
        };

        self.tier_alloc(block.tier).free(block.addr, block.reserved);
        self.metrics.on_free(block.tier, block.size);
        self.note(LogLevel::Trace, || {
            LogEvent::new("free", "free", "success")
                .addr(addr)
                .size(block.size)
                .tier(block.tier)
                .details(format!("active_mode={}", self.mode.get()))
        });
        Ok(block.tier)
    }

    /// Resize the block at `addr` without moving it.
    ///
    /// `Ok(false)` means the block is unchanged and the caller has to move it.
    pub fn resize_in_place(&self, addr: usize, new_size: usize) -> Result<bool, AllocError> {
        let _scope = EngineScope::enter();
        let new_reserved = self.checked_reserve("resize_in_place", new_size)?;

        let outcome = self.table.with_block_mut(addr, |block| {
            let resized = self.tier_alloc(block.tier).resize_in_place(
                block.addr,
                block.reserved,
                new_reserved,
            )?;
            let old_size = std::mem::replace(&mut block.size, new_size);
            block.reserved = resized;
            Some((block.tier, old_size))
        });

        match outcome {
            None => {
                self.note(LogLevel::Warn, || {
                    LogEvent::new("resize_in_place", "unknown_address", "rejected").addr(addr)
                });
                Err(AllocError::UnknownAddress { addr })
            }
            Some(None) => {
                self.note(LogLevel::Debug, || {
                    LogEvent::new("resize_in_place", "resize_blocked", "must_move")
                        .addr(addr)
                        .size(new_size)
                });
                Ok(false)
            }
            Some(Some((tier, old_size))) => {
                self.metrics.on_resize(tier, old_size, new_size);
                self.note(LogLevel::Trace, || {
                    LogEvent::new("resize_in_place", "resize", "success")
                        .addr(addr)
                        .size(new_size)
                        .tier(tier)
                        .details(format!("old_size={old_size}"))
                });
                Ok(true)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// The live block starting at `addr`.
    #[must_use]
    pub fn block(&self, addr: usize) -> Option<Block> {
        let _scope = EngineScope::enter();
        self.table.get(addr)
    }

    /// Tier recorded for the live block at `addr`.
    #[must_use]
    pub fn owner_of(&self, addr: usize) -> Option<MemoryTier> {
        self.block(addr).map(|b| b.tier)
    }

    /// Whether `addr` is the start of a live block.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        let _scope = EngineScope::enter();
        self.table.contains(addr)
    }

    /// Bytes usable at `addr` (the granule-rounded reservation).
    pub fn usable_size(&self, addr: usize) -> Result<usize, AllocError> {
        self.block(addr)
            .map(|b| b.reserved)
            .ok_or(AllocError::UnknownAddress { addr })
    }

    #[must_use]
    pub fn live_blocks(&self) -> usize {
        let _scope = EngineScope::enter();
        self.table.len()
    }

    #[must_use]
    pub fn tier_stats(&self, tier: MemoryTier) -> TierStats {
        self.tier_alloc(tier).stats()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let _scope = EngineScope::enter();
        EngineStats {
            mode: self.mode.get(),
            scope: self.mode.scope(),
            explicit_indicator_enabled: self.mode.is_enabled(),
            mode_switches: self.mode.switch_count(),
            live_blocks: self.table.len(),
            tiers: self.tiers.iter().map(TierAllocator::stats).collect(),
            metrics: self.metrics.snapshot(),
            log_records_dropped: self.log.dropped(),
        }
    }

    /// Hand idle segments back to the backends. Returns bytes released.
    pub fn trim(&self) -> usize {
        let _scope = EngineScope::enter();
        EngineMetrics::inc(&self.metrics.trims);
        let mut released = 0;
        for tier_alloc in &self.tiers {
            match tier_alloc.trim() {
                Ok(bytes) => released += bytes,
                Err(err) => self.note(LogLevel::Error, || {
                    LogEvent::new("trim", "release_failed", "kept")
                        .tier(tier_alloc.tier())
                        .details(err.to_string())
                }),
            }
        }
        self.note(LogLevel::Info, || {
            LogEvent::new("trim", "trim", "released").size(released)
        });
        released
    }

    /// Check the table against the tier allocators.
    ///
    /// Exact only while no other thread is allocating or freeing.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let _scope = EngineScope::enter();
        let blocks = self.table.snapshot();
        let mut tally = [TierTally::default(); MemoryTier::COUNT];
        let mut prev: Option<Block> = None;

        for block in &blocks {
            if let Some(p) = prev
                && p.addr + p.reserved > block.addr
            {
                return Err(InvariantViolation::Overlap {
                    first: p.addr,
                    second: block.addr,
                });
            }
            let inside = self
                .tier_alloc(block.tier)
                .segment_of(block.addr)
                .is_some_and(|seg| block.addr + block.reserved <= seg.end());
            if !inside {
                return Err(InvariantViolation::OutsideArena {
                    addr: block.addr,
                    tier: block.tier,
                });
            }
            let t = &mut tally[block.tier.index()];
            t.blocks += 1;
            t.reserved_bytes += block.reserved;
            prev = Some(*block);
        }

        for tier in MemoryTier::ALL {
            let stats = self.tier_alloc(tier).stats();
            let t = tally[tier.index()];
            if t.reserved_bytes != stats.in_use_bytes {
                return Err(InvariantViolation::BytesMismatch {
                    tier,
                    table: t.reserved_bytes,
                    allocator: stats.in_use_bytes,
                });
            }
            if t.blocks != stats.live_ranges {
                return Err(InvariantViolation::CountMismatch {
                    tier,
                    table: t.blocks,
                    allocator: stats.live_ranges,
                });
            }
        }
        Ok(())
    }

    /// Copy of the buffered lifecycle records.
    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        let _scope = EngineScope::enter();
        self.log.snapshot()
    }

    /// Remove and return the buffered lifecycle records.
    pub fn drain_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        let _scope = EngineScope::enter();
        self.log.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(
            EngineConfig::default()
                .with_backend(BackendKind::Heap)
                .with_segment_size(64 * 1024)
                .with_log_level(Some(LogLevel::Trace)),
        )
    }

    #[test]
    fn test_default_mode_is_host_before_enable() {
        let e = engine();
        assert!(!e.is_explicit_indicator_enabled());
        assert_eq!(e.get_memory_mode(), MemoryTier::Host);
        let a = e.allocate(32).unwrap();
        assert_eq!(e.owner_of(a), Some(MemoryTier::Host));
    }

    #[test]
    fn test_allocate_follows_mode_register() {
        let e = engine();
        e.enable_explicit_indicator();
        e.set_cxl_memory();
        let c = e.allocate(100).unwrap();
        e.set_host_memory();
        let h = e.allocate(100).unwrap();
        assert_eq!(e.owner_of(c), Some(MemoryTier::Cxl));
        assert_eq!(e.owner_of(h), Some(MemoryTier::Host));
        assert_eq!(e.block(c).map(|b| b.size), Some(100));
        assert_eq!(e.usable_size(c), Ok(112));
    }

    #[test]
    fn test_free_uses_recorded_tier_not_current_mode() {
        let e = engine();
        e.enable_explicit_indicator();
        e.set_cxl_memory();
        let a = e.allocate(64).unwrap();
        e.set_host_memory();
        assert_eq!(e.free(a), Ok(MemoryTier::Cxl));
        assert_eq!(e.tier_stats(MemoryTier::Cxl).in_use_bytes, 0);
        assert_eq!(e.tier_stats(MemoryTier::Host).in_use_bytes, 0);
        assert_eq!(e.stats().metrics.tier(MemoryTier::Cxl).frees, 1);
        assert_eq!(e.stats().metrics.tier(MemoryTier::Host).frees, 0);
    }

    #[test]
    fn test_unknown_free_is_rejected_without_side_effects() {
        let e = engine();
        let a = e.allocate(64).unwrap();
        assert_eq!(
            e.free(a + 16),
            Err(AllocError::UnknownAddress { addr: a + 16 })
        );
        assert_eq!(e.free(0), Err(AllocError::UnknownAddress { addr: 0 }));
        assert_eq!(e.live_blocks(), 1);
        assert!(e.owns(a));
        assert_eq!(e.stats().metrics.unknown_frees, 2);
        assert_eq!(e.free(a), Ok(MemoryTier::Host));
        assert_eq!(e.free(a), Err(AllocError::UnknownAddress { addr: a }));
    }

    #[test]
    fn test_invalid_requests() {
        let e = engine();
        assert_eq!(e.allocate(0), Err(AllocError::InvalidSize { size: 0 }));
        assert_eq!(
            e.allocate(usize::MAX),
            Err(AllocError::InvalidSize { size: usize::MAX })
        );
        assert_eq!(
            e.allocate_aligned(64, 48),
            Err(AllocError::InvalidAlignment { align: 48 })
        );
        assert_eq!(
            e.allocate_aligned(64, 2 * PAGE_SIZE),
            Err(AllocError::InvalidAlignment {
                align: 2 * PAGE_SIZE
            })
        );
        assert_eq!(e.stats().metrics.invalid_requests, 4);
        assert_eq!(e.live_blocks(), 0);
    }

    #[test]
    fn test_aligned_allocation() {
        let e = engine();
        e.allocate(16).unwrap();
        let a = e.allocate_aligned(200, 1024).unwrap();
        assert_eq!(a % 1024, 0);
        e.verify().unwrap();
    }

    #[test]
    fn test_allocate_on_ignores_register() {
        let e = engine();
        let a = e.allocate_on(MemoryTier::Cxl, 48).unwrap();
        assert_eq!(e.get_memory_mode(), MemoryTier::Host);
        assert_eq!(e.owner_of(a), Some(MemoryTier::Cxl));
    }

    #[test]
    fn test_cxl_capacity_exhaustion_does_not_fall_back() {
        let e = Engine::new(
            EngineConfig::default()
                .with_backend(BackendKind::Heap)
                .with_segment_size(PAGE_SIZE)
                .with_capacity(MemoryTier::Cxl, Some(2 * PAGE_SIZE)),
        );
        e.set_cxl_memory();
        e.allocate(PAGE_SIZE).unwrap();
        e.allocate(PAGE_SIZE).unwrap();
        assert_eq!(
            e.allocate(64),
            Err(AllocError::OutOfMemory {
                tier: MemoryTier::Cxl,
                requested: 64
            })
        );
        assert_eq!(e.tier_stats(MemoryTier::Host).committed_bytes, 0);
        e.set_host_memory();
        let h = e.allocate(64).unwrap();
        assert_eq!(e.owner_of(h), Some(MemoryTier::Host));
        assert_eq!(e.stats().metrics.tier(MemoryTier::Cxl).out_of_memory, 1);
    }

    #[test]
    fn test_resize_in_place_updates_block() {
        let e = engine();
        let a = e.allocate(64).unwrap();
        assert_eq!(e.resize_in_place(a, 200), Ok(true));
        assert_eq!(e.block(a).map(|b| (b.size, b.reserved)), Some((200, 208)));
        let _b = e.allocate(16).unwrap();
        assert_eq!(e.resize_in_place(a, 4000), Ok(false));
        assert_eq!(e.resize_in_place(a, 8), Ok(true));
        assert_eq!(e.usable_size(a), Ok(16));
        assert_eq!(
            e.resize_in_place(a + 1, 8),
            Err(AllocError::UnknownAddress { addr: a + 1 })
        );
        assert_eq!(e.stats().metrics.tier(MemoryTier::Host).outstanding_bytes, 8 + 16);
        e.verify().unwrap();
    }

    #[test]
    fn test_trim_returns_idle_segments() {
        let e = Engine::new(
            EngineConfig::default()
                .with_backend(BackendKind::Heap)
                .with_segment_size(PAGE_SIZE),
        );
        let blocks: Vec<usize> = (0..4).map(|_| e.allocate(PAGE_SIZE).unwrap()).collect();
        for b in blocks {
            e.free(b).unwrap();
        }
        assert_eq!(e.trim(), 3 * PAGE_SIZE);
        assert_eq!(e.tier_stats(MemoryTier::Host).segments, 1);
    }

    #[test]
    fn test_verify_detects_accounting_drift() {
        let e = engine();
        let a = e.allocate(64).unwrap();
        // Release behind the table's back.
        e.tier_alloc(MemoryTier::Host).free(a, 64);
        assert!(matches!(
            e.verify(),
            Err(InvariantViolation::BytesMismatch {
                tier: MemoryTier::Host,
                ..
            })
        ));
    }

    #[test]
    fn test_lifecycle_logs_include_trace_and_decision_ids() {
        let e = engine();
        e.enable_explicit_indicator();
        e.set_cxl_memory();
        let a = e.allocate(64).unwrap();
        e.free(a).unwrap();
        let _ = e.free(a);

        let logs = e.drain_lifecycle_logs();
        assert!(logs.iter().all(|r| r.decision_id > 0));
        assert!(logs.iter().all(|r| r.trace_id.starts_with("core::tiermem::")));
        assert!(logs.iter().any(|r| r.event == "engine_ready"));
        assert!(logs
            .iter()
            .any(|r| r.event == "indicator_enabled" && r.level == LogLevel::Info));
        assert!(logs
            .iter()
            .any(|r| r.event == "mode_switch" && r.tier == Some(MemoryTier::Cxl)));
        assert!(logs.iter().any(|r| r.event == "arena_grow" && r.level == LogLevel::Debug));
        assert!(logs
            .iter()
            .any(|r| r.event == "alloc" && r.addr == Some(a) && r.level == LogLevel::Trace));
        assert!(
            logs.iter()
                .any(|r| r.event == "unknown_address" && r.level == LogLevel::Warn),
            "expected WARN unknown_address entry"
        );
        assert!(e.lifecycle_logs().is_empty());
    }

    #[test]
    fn test_oom_is_logged_at_warn() {
        let e = Engine::new(
            EngineConfig::default()
                .with_backend(BackendKind::Heap)
                .with_capacity(MemoryTier::Cxl, Some(0)),
        );
        assert!(e.allocate_on(MemoryTier::Cxl, 16).is_err());
        let logs = e.lifecycle_logs();
        assert!(logs.iter().any(|r| r.event == "tier_exhausted"
            && r.level == LogLevel::Warn
            && r.tier == Some(MemoryTier::Cxl)));
    }

    #[test]
    fn test_unbound_cxl_mapping_warns() {
        let e = Engine::new(EngineConfig::default());
        assert!(
            e.lifecycle_logs()
                .iter()
                .any(|r| r.event == "cxl_node_unset" && r.level == LogLevel::Warn)
        );
    }

    #[test]
    fn test_accounting_invariant_under_deterministic_trace() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let e = engine();
        let mut live: Vec<(usize, usize, MemoryTier)> = Vec::new();
        let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

        for _ in 0..1500 {
            let r = lcg(&mut rng);
            match r % 4 {
                0 | 1 => {
                    let size = ((r >> 8) as usize % 3000).max(1);
                    if (r >> 40) & 1 == 1 {
                        e.set_cxl_memory();
                    } else {
                        e.set_host_memory();
                    }
                    let addr = e.allocate(size).unwrap();
                    live.push((addr, size, e.get_memory_mode()));
                }
                2 if !live.is_empty() => {
                    let idx = (r as usize >> 3) % live.len();
                    let (addr, _, tier) = live.swap_remove(idx);
                    assert_eq!(e.free(addr), Ok(tier));
                }
                3 if !live.is_empty() => {
                    let idx = (r as usize >> 3) % live.len();
                    let new_size = ((r >> 16) as usize % 3000).max(1);
                    if e.resize_in_place(live[idx].0, new_size) == Ok(true) {
                        live[idx].1 = new_size;
                    }
                }
                _ => {}
            }

            let snap = e.stats().metrics;
            for tier in MemoryTier::ALL {
                let expected: usize = live
                    .iter()
                    .filter(|(_, _, t)| *t == tier)
                    .map(|(_, size, _)| *size)
                    .sum();
                assert_eq!(snap.tier(tier).outstanding_bytes, expected as u64);
            }
            assert_eq!(e.live_blocks(), live.len());
        }
        e.verify().unwrap();
    }
}
