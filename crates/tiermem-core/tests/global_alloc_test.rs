//! Runs the whole test binary on top of the engine-backed global allocator.
//!
//! Everything lives in one test function: the process engine is shared by
//! the harness itself, so switching tiers from parallel tests would race.

#![allow(unsafe_code)]

use std::collections::HashMap;

use tiermem_core::{MemoryTier, TierGlobalAlloc, global};

#[global_allocator]
static ALLOC: TierGlobalAlloc = TierGlobalAlloc;

#[test]
fn global_allocator_routes_by_mode() {
    let engine = global::engine();
    engine.enable_explicit_indicator();

    // HOST before any selection.
    let host_vec: Vec<u64> = Vec::with_capacity(512);
    let host_addr = host_vec.as_ptr() as usize;
    assert_eq!(engine.owner_of(host_addr), Some(MemoryTier::Host));

    engine.set_cxl_memory();
    let mut cxl_vec: Vec<u64> = Vec::with_capacity(512);
    engine.set_host_memory();
    let cxl_addr = cxl_vec.as_ptr() as usize;
    assert_eq!(engine.owner_of(cxl_addr), Some(MemoryTier::Cxl));

    // Growing keeps the tier the vector started on.
    cxl_vec.extend(0..100_000u64);
    let moved = cxl_vec.as_ptr() as usize;
    assert_eq!(engine.owner_of(moved), Some(MemoryTier::Cxl));
    assert_eq!(cxl_vec.iter().sum::<u64>(), (0..100_000u64).sum());

    // Dropping releases to the recorded tier while HOST is selected.
    let cxl_frees = engine.stats().metrics.tier(MemoryTier::Cxl).frees;
    drop(cxl_vec);
    assert!(!engine.owns(moved));
    assert!(engine.stats().metrics.tier(MemoryTier::Cxl).frees > cxl_frees);
    drop(host_vec);
    assert!(!engine.owns(host_addr));

    // Zeroed allocations are zero even when a block is recycled.
    let mut dirty = vec![0xFFu8; 4096];
    dirty[0] = 1;
    drop(dirty);
    let clean = vec![0u8; 4096];
    assert!(clean.iter().all(|b| *b == 0));

    // Over-page alignment goes to the system allocator.
    let layout = std::alloc::Layout::from_size_align(64, 2 * 4096).unwrap();
    // SAFETY: non-zero size; freed with the same layout below.
    let big = unsafe { std::alloc::alloc(layout) };
    assert!(!big.is_null());
    assert_eq!(big as usize % (2 * 4096), 0);
    assert!(!engine.owns(big as usize));
    // SAFETY: allocated above with `layout`.
    unsafe { std::alloc::dealloc(big, layout) };

    // Ordinary collections keep working across tier switches.
    let mut map = HashMap::new();
    for i in 0..2_000u32 {
        if i % 100 == 0 {
            if i % 200 == 0 {
                engine.set_cxl_memory();
            } else {
                engine.set_host_memory();
            }
        }
        map.insert(i, format!("value-{i}"));
    }
    engine.set_host_memory();
    assert_eq!(map.get(&1999).map(String::as_str), Some("value-1999"));
    drop(map);

    let stats = engine.stats();
    assert!(stats.metrics.tier(MemoryTier::Cxl).allocations > 0);
    assert!(stats.metrics.tier(MemoryTier::Host).allocations > 0);
}
