//! Contract tests for the explicit-indicator engine, driven through the
//! public API only.

#![allow(unsafe_code)]

use tiermem_core::backend::PAGE_SIZE;
use tiermem_core::{
    AllocError, BackendKind, Engine, EngineConfig, ExplicitIndicator, LogLevel, MemoryTier,
};

fn heap_config() -> EngineConfig {
    EngineConfig::default()
        .with_backend(BackendKind::Heap)
        .with_segment_size(4 * PAGE_SIZE)
}

fn heap_engine() -> Engine {
    Engine::new(heap_config())
}

#[test]
fn mode_defaults_to_host_after_enable_alone() {
    let e = heap_engine();
    e.enable_explicit_indicator();
    assert_eq!(e.get_memory_mode(), MemoryTier::Host);
}

#[test]
fn get_mode_reflects_last_set() {
    let e = heap_engine();
    e.enable_explicit_indicator();
    e.set_cxl_memory();
    assert_eq!(e.get_memory_mode(), MemoryTier::Cxl);
    e.set_host_memory();
    assert_eq!(e.get_memory_mode(), MemoryTier::Host);
    e.set_cxl_memory();
    e.set_cxl_memory();
    assert_eq!(e.get_memory_mode(), MemoryTier::Cxl);
    assert_eq!(e.stats().mode_switches, 4);
}

#[test]
fn enable_is_idempotent() {
    let e = Engine::new(heap_config().with_log_level(Some(LogLevel::Info)));
    e.enable_explicit_indicator();
    e.set_cxl_memory();
    e.enable_explicit_indicator();
    assert!(e.is_explicit_indicator_enabled());
    // A second enable does not reset the selection.
    assert_eq!(e.get_memory_mode(), MemoryTier::Cxl);
    let enables = e
        .lifecycle_logs()
        .iter()
        .filter(|r| r.event == "indicator_enabled")
        .count();
    assert_eq!(enables, 1);
}

#[test]
fn tier_is_fixed_at_allocation_time() {
    let e = heap_engine();
    e.enable_explicit_indicator();
    e.set_cxl_memory();
    let a = e.allocate(64).unwrap();
    e.set_host_memory();
    assert_eq!(e.owner_of(a), Some(MemoryTier::Cxl));

    let cxl_before = e.tier_stats(MemoryTier::Cxl);
    let host_before = e.tier_stats(MemoryTier::Host);
    assert_eq!(cxl_before.in_use_bytes, 64);

    assert_eq!(e.free(a), Ok(MemoryTier::Cxl));
    let cxl_after = e.tier_stats(MemoryTier::Cxl);
    let host_after = e.tier_stats(MemoryTier::Host);
    assert_eq!(cxl_after.in_use_bytes, 0);
    assert_eq!(cxl_after.free_bytes, cxl_after.committed_bytes);
    assert_eq!(host_after, host_before);
}

#[test]
fn unknown_free_leaves_existing_blocks_alone() {
    let e = heap_engine();
    e.set_cxl_memory();
    let a = e.allocate(100).unwrap();
    e.set_host_memory();
    let b = e.allocate(200).unwrap();
    let before = e.stats();

    for bogus in [1, a + 16, b + 8, usize::MAX & !15] {
        assert_eq!(e.free(bogus), Err(AllocError::UnknownAddress { addr: bogus }));
    }

    let after = e.stats();
    assert_eq!(after.live_blocks, 2);
    assert_eq!(after.tiers, before.tiers);
    assert_eq!(e.block(a).map(|blk| (blk.size, blk.tier)), Some((100, MemoryTier::Cxl)));
    assert_eq!(e.block(b).map(|blk| (blk.size, blk.tier)), Some((200, MemoryTier::Host)));
    assert_eq!(after.metrics.unknown_frees, 4);
    e.verify().unwrap();
}

#[test]
fn double_free_is_an_unknown_address() {
    let e = heap_engine();
    let a = e.allocate(48).unwrap();
    assert_eq!(e.free(a), Ok(MemoryTier::Host));
    assert_eq!(e.free(a), Err(AllocError::UnknownAddress { addr: a }));
    assert_eq!(e.live_blocks(), 0);
}

#[test]
fn repeated_cycles_do_not_grow_footprint() {
    let e = heap_engine();
    for tier in MemoryTier::ALL {
        e.set_memory_mode(tier);
        for _ in 0..1000 {
            let a = e.allocate(4096).unwrap();
            e.free(a).unwrap();
        }
        let stats = e.tier_stats(tier);
        assert_eq!(stats.growths, 1, "{tier} grew more than once");
        assert!(stats.peak_committed_bytes <= 4 * 4096);
        assert_eq!(stats.in_use_bytes, 0);
        assert_eq!(stats.free_ranges, 1);
    }
}

#[test]
fn cycles_with_default_segments_stay_in_one_segment() {
    let e = Engine::new(EngineConfig::default().with_backend(BackendKind::Heap));
    e.set_cxl_memory();
    for _ in 0..1000 {
        let a = e.allocate(4096).unwrap();
        e.free(a).unwrap();
    }
    assert_eq!(e.tier_stats(MemoryTier::Cxl).segments, 1);
}

#[test]
fn bounded_cxl_exhausts_while_host_stays_available() {
    let capacity = 8 * PAGE_SIZE;
    let e = Engine::new(heap_config().with_capacity(MemoryTier::Cxl, Some(capacity)));
    e.enable_explicit_indicator();
    e.set_cxl_memory();

    let mut held = Vec::new();
    let mut served = 0;
    let err = loop {
        match e.allocate(1024) {
            Ok(a) => {
                held.push(a);
                served += 1024;
            }
            Err(err) => break err,
        }
        assert!(served <= capacity);
    };
    assert_eq!(served, capacity);
    assert_eq!(
        err,
        AllocError::OutOfMemory {
            tier: MemoryTier::Cxl,
            requested: 1024
        }
    );
    assert_eq!(e.tier_stats(MemoryTier::Cxl).committed_bytes, capacity);
    assert_eq!(e.tier_stats(MemoryTier::Host).committed_bytes, 0);

    e.set_host_memory();
    let h = e.allocate(1024 * 1024).unwrap();
    assert_eq!(e.owner_of(h), Some(MemoryTier::Host));

    // Freeing CXL space makes CXL allocatable again.
    e.free(held.pop().unwrap()).unwrap();
    assert!(e.allocate_on(MemoryTier::Cxl, 1024).is_ok());
    e.verify().unwrap();
}

#[test]
fn accounting_matches_live_blocks() {
    let e = heap_engine();
    let mut live: Vec<(usize, usize, MemoryTier)> = Vec::new();
    for i in 0..300usize {
        let tier = if i % 3 == 0 { MemoryTier::Cxl } else { MemoryTier::Host };
        e.set_memory_mode(tier);
        let size = 1 + (i * 37) % 2000;
        live.push((e.allocate(size).unwrap(), size, tier));
        if i % 4 == 3 {
            let (addr, _, tier) = live.remove(i % live.len());
            assert_eq!(e.free(addr), Ok(tier));
        }
    }
    let snap = e.stats().metrics;
    for tier in MemoryTier::ALL {
        let expected: usize = live.iter().filter(|l| l.2 == tier).map(|l| l.1).sum();
        assert_eq!(snap.tier(tier).outstanding_bytes, expected as u64);
        let blocks = live.iter().filter(|l| l.2 == tier).count();
        assert_eq!(snap.tier(tier).live_blocks, blocks as u64);
    }
    e.verify().unwrap();
}

#[test]
fn memory_is_writable_on_both_tiers() {
    let e = Engine::new(EngineConfig::default().with_segment_size(PAGE_SIZE));
    for tier in MemoryTier::ALL {
        let a = e.allocate_on(tier, 3 * PAGE_SIZE).unwrap();
        let bytes = a as *mut u8;
        // SAFETY: `a` is a live block of 3 pages owned by this test.
        unsafe {
            std::ptr::write_bytes(bytes, 0x5A, 3 * PAGE_SIZE);
            assert_eq!(*bytes.add(3 * PAGE_SIZE - 1), 0x5A);
        }
        e.free(a).unwrap();
    }
}

#[test]
fn independent_engines_do_not_share_mode() {
    let a = heap_engine();
    let b = heap_engine();
    a.set_cxl_memory();
    assert_eq!(a.get_memory_mode(), MemoryTier::Cxl);
    assert_eq!(b.get_memory_mode(), MemoryTier::Host);
    let block = a.allocate(32).unwrap();
    assert_eq!(b.free(block), Err(AllocError::UnknownAddress { addr: block }));
    assert_eq!(a.free(block), Ok(MemoryTier::Cxl));
}

#[test]
fn capability_drives_the_engine() {
    fn exercise<I: ExplicitIndicator>(binding: &I) -> usize {
        binding.enable();
        binding.set_cxl();
        let a = binding.allocate(256).unwrap();
        binding.set_host();
        binding.free(a).unwrap();
        a
    }
    let e = heap_engine();
    let addr = exercise(&e);
    assert_eq!(e.stats().metrics.tier(MemoryTier::Cxl).frees, 1);
    assert_eq!(e.owner_of(addr), None);
}

#[test]
fn stats_serialize_to_json() {
    let e = heap_engine();
    e.set_cxl_memory();
    let _a = e.allocate(64).unwrap();
    let json = serde_json::to_value(e.stats()).unwrap();
    assert_eq!(json["mode"], "cxl");
    assert_eq!(json["live_blocks"], 1);
    assert_eq!(json["tiers"][1]["in_use_bytes"], 64);
}
