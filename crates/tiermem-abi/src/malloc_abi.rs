//! ABI layer for tiered allocation (`tiermem_malloc`, `tiermem_free`, ...).
//!
//! The `tiermem_*` entry points draw from whichever tier the mode register
//! selects. The `cxl_*` family and `host_malloc` pin the tier and ignore the
//! register. Every free and resize goes back to the tier the block was
//! allocated from. Failures return null (or an error code) and set `errno`
//! the way the POSIX counterparts do.

use std::ffi::{c_int, c_void};
use std::ptr;

use tiermem_core::backend::PAGE_SIZE;
use tiermem_core::{AllocError, Engine, MemoryTier, global};

use crate::errno::set_abi_errno;

fn errno_for(err: AllocError) -> c_int {
    match err {
        AllocError::OutOfMemory { .. } => libc::ENOMEM,
        AllocError::UnknownAddress { .. }
        | AllocError::InvalidSize { .. }
        | AllocError::InvalidAlignment { .. } => libc::EINVAL,
    }
}

fn into_ptr(result: Result<usize, AllocError>) -> *mut c_void {
    match result {
        Ok(addr) => addr as *mut c_void,
        Err(err) => {
            set_abi_errno(errno_for(err));
            ptr::null_mut()
        }
    }
}

/// Which tier a fresh block comes from.
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// Whatever the mode register selects.
    Mode,
    Pinned(MemoryTier),
}

impl Placement {
    fn allocate(self, engine: &Engine, size: usize) -> Result<usize, AllocError> {
        match self {
            Self::Mode => engine.allocate(size),
            Self::Pinned(tier) => engine.allocate_on(tier, size),
        }
    }

    fn allocate_aligned(self, engine: &Engine, size: usize, align: usize) -> Result<usize, AllocError> {
        match self {
            Self::Mode => engine.allocate_aligned(size, align),
            Self::Pinned(tier) => engine.allocate_on_aligned(tier, size, align),
        }
    }
}

fn free_block(engine: &Engine, addr: usize) {
    let released = engine.free(addr);
    debug_assert!(released.is_ok(), "block {addr:#x} vanished while owned: {released:?}");
}

fn release(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return 0;
    }
    match global::engine().free(ptr as usize) {
        Ok(_) => 0,
        Err(err) => {
            set_abi_errno(errno_for(err));
            -1
        }
    }
}

fn calloc_in(place: Placement, nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        set_abi_errno(libc::ENOMEM);
        return ptr::null_mut();
    };
    let p = into_ptr(place.allocate(&global::engine(), total));
    if !p.is_null() {
        // SAFETY: `p` is a live block of at least `total` bytes.
        unsafe { ptr::write_bytes(p.cast::<u8>(), 0, total) };
    }
    p
}

/// # Safety
///
/// `ptr` must be null or a live pointer returned by this library.
unsafe fn realloc_in(place: Placement, ptr: *mut c_void, size: usize) -> *mut c_void {
    let engine = global::engine();
    if ptr.is_null() {
        return into_ptr(place.allocate(&engine, size));
    }
    if size == 0 {
        release(ptr);
        return ptr::null_mut();
    }

    let addr = ptr as usize;
    let Some(block) = engine.block(addr) else {
        set_abi_errno(libc::EINVAL);
        return ptr::null_mut();
    };

    match engine.resize_in_place(addr, size) {
        Ok(true) => return ptr,
        Ok(false) => {}
        Err(err) => {
            set_abi_errno(errno_for(err));
            return ptr::null_mut();
        }
    }

    // A moved block stays on its own tier whatever the placement says.
    let fresh = into_ptr(engine.allocate_on(block.tier, size));
    if fresh.is_null() {
        return fresh;
    }
    // SAFETY: the old block holds `block.size` bytes and the new one `size`;
    // both are live and distinct.
    unsafe {
        ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), block.size.min(size));
    }
    free_block(&engine, addr);
    fresh
}

/// # Safety
///
/// `memptr` must be null or valid for a pointer-sized write.
unsafe fn posix_memalign_in(
    place: Placement,
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null()
        || !alignment.is_power_of_two()
        || alignment % std::mem::size_of::<*mut c_void>() != 0
        || alignment > PAGE_SIZE
    {
        return libc::EINVAL;
    }
    match place.allocate_aligned(&global::engine(), size, alignment) {
        Ok(addr) => {
            // SAFETY: caller guarantees `memptr` is writable.
            unsafe { *memptr = addr as *mut c_void };
            0
        }
        Err(err) => errno_for(err),
    }
}

fn usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    global::engine().usable_size(ptr as usize).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// Allocate `size` bytes from the currently selected tier.
///
/// Returns null with `errno` set to `EINVAL` for a zero or oversized request
/// and `ENOMEM` when the tier is exhausted.
///
/// # Safety
///
/// The result must be released with [`tiermem_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_malloc(size: usize) -> *mut c_void {
    into_ptr(Placement::Mode.allocate(&global::engine(), size))
}

/// Allocate `size` bytes on CXL memory regardless of the current mode.
///
/// # Safety
///
/// The result must be released with [`tiermem_free`] or [`cxl_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_malloc(size: usize) -> *mut c_void {
    into_ptr(Placement::Pinned(MemoryTier::Cxl).allocate(&global::engine(), size))
}

/// Allocate `size` bytes on host memory regardless of the current mode.
///
/// # Safety
///
/// The result must be released with [`tiermem_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn host_malloc(size: usize) -> *mut c_void {
    into_ptr(Placement::Pinned(MemoryTier::Host).allocate(&global::engine(), size))
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// Release a block to the tier it was allocated from.
///
/// Returns 0 on success. Null is a no-op returning 0. An address that is
/// not a live block returns -1 with `errno` set to `EINVAL` and changes
/// nothing.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this library that has not
/// been freed yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_free(ptr: *mut c_void) -> c_int {
    release(ptr)
}

/// `free` for the `cxl_*` family. Unknown addresses set `EINVAL` and change
/// nothing.
///
/// # Safety
///
/// Same contract as [`tiermem_free`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_free(ptr: *mut c_void) {
    release(ptr);
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// Allocate a zeroed array of `nmemb` elements of `size` bytes from the
/// currently selected tier. Overflow returns null with `ENOMEM`.
///
/// # Safety
///
/// The result must be released with [`tiermem_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_calloc(nmemb: usize, size: usize) -> *mut c_void {
    calloc_in(Placement::Mode, nmemb, size)
}

/// [`tiermem_calloc`] pinned to CXL.
///
/// # Safety
///
/// The result must be released with [`cxl_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_calloc(nmemb: usize, size: usize) -> *mut c_void {
    calloc_in(Placement::Pinned(MemoryTier::Cxl), nmemb, size)
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// Resize a block, keeping it on the tier it was allocated from.
///
/// - Null `ptr` behaves like [`tiermem_malloc`].
/// - `size == 0` frees `ptr` and returns null.
/// - An unknown `ptr` returns null with `EINVAL`; nothing is freed.
/// - On failure the old block is left untouched.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded.
    unsafe { realloc_in(Placement::Mode, ptr, size) }
}

/// [`tiermem_realloc`] whose null-pointer case allocates on CXL.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded.
    unsafe { realloc_in(Placement::Pinned(MemoryTier::Cxl), ptr, size) }
}

// ---------------------------------------------------------------------------
// aligned allocation
// ---------------------------------------------------------------------------

/// Allocate `size` bytes aligned to `alignment` from the selected tier.
///
/// `alignment` must be a power of two no larger than a page; anything else
/// returns null with `EINVAL`.
///
/// # Safety
///
/// The result must be released with [`tiermem_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    into_ptr(Placement::Mode.allocate_aligned(&global::engine(), size, alignment))
}

/// [`tiermem_aligned_alloc`] pinned to CXL.
///
/// # Safety
///
/// The result must be released with [`cxl_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    into_ptr(Placement::Pinned(MemoryTier::Cxl).allocate_aligned(&global::engine(), size, alignment))
}

/// Legacy `memalign` on CXL. Same rules as [`cxl_aligned_alloc`].
///
/// # Safety
///
/// The result must be released with [`cxl_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_memalign(alignment: usize, size: usize) -> *mut c_void {
    // SAFETY: forwarded.
    unsafe { cxl_aligned_alloc(alignment, size) }
}

/// Page-aligned allocation on CXL.
///
/// # Safety
///
/// The result must be released with [`cxl_free`] exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_valloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded.
    unsafe { cxl_aligned_alloc(PAGE_SIZE, size) }
}

/// POSIX-style aligned allocation. Returns 0 and stores the block in
/// `*memptr`, or an error code (`EINVAL`, `ENOMEM`) leaving `*memptr`
/// untouched.
///
/// # Safety
///
/// `memptr` must be valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    // SAFETY: forwarded.
    unsafe { posix_memalign_in(Placement::Mode, memptr, alignment, size) }
}

/// [`tiermem_posix_memalign`] pinned to CXL.
///
/// # Safety
///
/// `memptr` must be valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    // SAFETY: forwarded.
    unsafe { posix_memalign_in(Placement::Pinned(MemoryTier::Cxl), memptr, alignment, size) }
}

// ---------------------------------------------------------------------------
// introspection and maintenance
// ---------------------------------------------------------------------------

/// Usable bytes in the block at `ptr`; 0 for null or unknown pointers.
///
/// # Safety
///
/// `ptr` is only compared, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_malloc_usable_size(ptr: *mut c_void) -> usize {
    usable_size(ptr)
}

/// Same as [`tiermem_malloc_usable_size`]; blocks carry their tier.
///
/// # Safety
///
/// `ptr` is only compared, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cxl_malloc_usable_size(ptr: *mut c_void) -> usize {
    usable_size(ptr)
}

/// Tier of the block at `ptr`: 0 for HOST, 1 for CXL, -1 if unknown.
///
/// # Safety
///
/// `ptr` is only compared, never dereferenced.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tiermem_block_tier(ptr: *mut c_void) -> c_int {
    global::engine()
        .owner_of(ptr as usize)
        .map_or(-1, |tier| c_int::from(tier.as_raw()))
}

/// Return idle arena segments to the system. Returns bytes released.
#[unsafe(no_mangle)]
pub extern "C" fn tiermem_trim() -> usize {
    global::engine().trim()
}
