//! `GlobalAlloc` adapter over the process engine.
//!
//! Installing [`TierGlobalAlloc`] as `#[global_allocator]` routes every Rust
//! heap allocation through the mode register, so `set_cxl_memory()`
//! followed by `Vec::with_capacity(n)` places the vector on CXL.
//!
//! Requests made while the engine itself is running on this thread (its
//! table, log, and thread-local bookkeeping) go to the system allocator, as
//! do alignments above a page. Deallocations of addresses the engine does
//! not own are forwarded to the system allocator as well.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;

use crate::backend::PAGE_SIZE;
use crate::engine::Engine;
use crate::global;
use crate::reentry::in_engine_scope;

/// Global allocator routing through the process engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct TierGlobalAlloc;

impl TierGlobalAlloc {
    fn engine_eligible(layout: Layout) -> bool {
        layout.align() <= PAGE_SIZE && !in_engine_scope()
    }
}

// SAFETY: every pointer handed out either comes from the engine (a live,
// exclusively owned block of at least `layout.size()` bytes at the requested
// alignment) or from `System` with the caller's layout. `dealloc` and
// `realloc` send each pointer back to whichever of the two produced it.
unsafe impl GlobalAlloc for TierGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !Self::engine_eligible(layout) {
            // SAFETY: forwarded with the caller's valid layout.
            return unsafe { System.alloc(layout) };
        }
        match global::engine().allocate_aligned(layout.size().max(1), layout.align()) {
            Ok(addr) => addr as *mut u8,
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: same contract as `alloc`.
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            // SAFETY: `p` is valid for `layout.size()` bytes. Engine blocks
            // may be recycled, so they are not guaranteed to be zero.
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !in_engine_scope()
            && let Some(engine) = global::current()
            && engine.owns(ptr as usize)
        {
            let released = engine.free(ptr as usize);
            debug_assert!(released.is_ok(), "owned block {ptr:p} missing from the table");
            return;
        }
        // SAFETY: not an engine block, so it came from `System` with this layout.
        unsafe { System.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let engine = if in_engine_scope() {
            None
        } else {
            global::current().filter(|e| e.owns(ptr as usize))
        };
        let Some(engine) = engine else {
            // SAFETY: `ptr` came from `System` with `layout`.
            return unsafe { System.realloc(ptr, layout, new_size) };
        };
        realloc_engine_block(&engine, ptr, layout, new_size)
    }
}

fn realloc_engine_block(engine: &Engine, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let addr = ptr as usize;
    if engine.resize_in_place(addr, new_size.max(1)) == Ok(true) {
        return ptr;
    }
    // Keep the block on the tier it already lives on.
    let Some(tier) = engine.owner_of(addr) else {
        return ptr::null_mut();
    };
    let Ok(fresh) = engine.allocate_on_aligned(tier, new_size.max(1), layout.align()) else {
        return ptr::null_mut();
    };
    // SAFETY: both blocks are live and distinct; the copy covers the smaller
    // of the two sizes.
    unsafe {
        ptr::copy_nonoverlapping(ptr, fresh as *mut u8, layout.size().min(new_size));
    }
    let released = engine.free(addr);
    debug_assert!(released.is_ok(), "owned block {addr:#x} missing from the table");
    fresh as *mut u8
}
