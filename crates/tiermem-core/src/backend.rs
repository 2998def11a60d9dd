//! Arena backends: where a tier's segments come from.
//!
//! A backend commits page-aligned segments and releases them again. It never
//! looks inside a segment; carving is the tier allocator's job.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout};

use crate::config::{BackendKind, EngineConfig};
use crate::error::BackendError;
use crate::tier::MemoryTier;

/// Page granularity assumed for segment lengths and alignment.
pub const PAGE_SIZE: usize = 4096;

/// Round `size` up to a page multiple. `None` on overflow.
#[must_use]
pub const fn page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// A contiguous committed range owned by one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    base: usize,
    len: usize,
}

impl Segment {
    #[must_use]
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.len
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// OS memory provider bound to one tier.
pub trait ArenaBackend: Send + Sync {
    /// Tier this backend's memory belongs to.
    fn tier(&self) -> MemoryTier;

    /// Commit `len` bytes (a positive page multiple).
    fn commit(&self, len: usize) -> Result<Segment, BackendError>;

    /// Return a segment obtained from [`ArenaBackend::commit`] on this backend.
    fn release(&self, segment: Segment) -> Result<(), BackendError>;

    /// Short description for logs (`mmap node=1`, `heap`).
    fn describe(&self) -> String;
}

fn check_len(len: usize) -> Result<(), BackendError> {
    if len == 0 || len % PAGE_SIZE != 0 {
        return Err(BackendError::InvalidLength { len });
    }
    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// mmap backend
// ---------------------------------------------------------------------------

const MPOL_BIND: libc::c_int = 2;
const NODEMASK_WORDS: usize = 16;
const BITS_PER_WORD: usize = libc::c_ulong::BITS as usize;

/// Anonymous private mappings, optionally bound to a NUMA node with `mbind`.
#[derive(Debug, Clone, Copy)]
pub struct MmapBackend {
    tier: MemoryTier,
    node: Option<u32>,
}

impl MmapBackend {
    #[must_use]
    pub const fn new(tier: MemoryTier, node: Option<u32>) -> Self {
        Self { tier, node }
    }

    #[must_use]
    pub const fn node(&self) -> Option<u32> {
        self.node
    }
}

impl ArenaBackend for MmapBackend {
    fn tier(&self) -> MemoryTier {
        self.tier
    }

    fn commit(&self, len: usize) -> Result<Segment, BackendError> {
        check_len(len)?;
        // SAFETY: anonymous private mapping with no address hint; the kernel
        // picks a fresh range, so no existing memory is affected.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BackendError::MapFailed {
                len,
                errno: last_errno(),
            });
        }
        let segment = Segment::new(ptr as usize, len);
        if let Some(node) = self.node
            && let Err(err) = bind_to_node(segment, node)
        {
            // SAFETY: the mapping was created above and has not been handed out.
            unsafe { libc::munmap(ptr, len) };
            return Err(err);
        }
        Ok(segment)
    }

    fn release(&self, segment: Segment) -> Result<(), BackendError> {
        // SAFETY: the segment came from `commit` on this backend and its owner
        // has stopped handing out addresses inside it.
        let rc = unsafe { libc::munmap(segment.base() as *mut libc::c_void, segment.len()) };
        if rc != 0 {
            return Err(BackendError::UnmapFailed {
                base: segment.base(),
                errno: last_errno(),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self.node {
            Some(node) => format!("mmap node={node}"),
            None => "mmap node=local".to_string(),
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_to_node(segment: Segment, node: u32) -> Result<(), BackendError> {
    let bit = node as usize;
    if bit >= NODEMASK_WORDS * BITS_PER_WORD {
        return Err(BackendError::NodeOutOfRange { node });
    }
    let mut mask = [0 as libc::c_ulong; NODEMASK_WORDS];
    mask[bit / BITS_PER_WORD] |= 1 << (bit % BITS_PER_WORD);
    // SAFETY: the range is a live mapping we own and `mask` outlives the call;
    // maxnode matches the mask's bit width.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            segment.base() as *mut libc::c_void,
            segment.len() as libc::c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            (NODEMASK_WORDS * BITS_PER_WORD) as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    if rc != 0 {
        return Err(BackendError::BindFailed {
            node,
            errno: last_errno(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_segment: Segment, node: u32) -> Result<(), BackendError> {
    Err(BackendError::BindFailed {
        node,
        errno: libc::ENOSYS,
    })
}

// ---------------------------------------------------------------------------
// Heap backend
// ---------------------------------------------------------------------------

/// Page-aligned segments from the Rust system allocator.
///
/// Carries no physical placement; used for tests and for hosts without NUMA.
#[derive(Debug, Clone, Copy)]
pub struct HeapBackend {
    tier: MemoryTier,
}

impl HeapBackend {
    #[must_use]
    pub const fn new(tier: MemoryTier) -> Self {
        Self { tier }
    }
}

impl ArenaBackend for HeapBackend {
    fn tier(&self) -> MemoryTier {
        self.tier
    }

    fn commit(&self, len: usize) -> Result<Segment, BackendError> {
        check_len(len)?;
        let layout =
            Layout::from_size_align(len, PAGE_SIZE).map_err(|_| BackendError::InvalidLength { len })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::System.alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(BackendError::MapFailed {
                len,
                errno: libc::ENOMEM,
            });
        }
        Ok(Segment::new(ptr as usize, len))
    }

    fn release(&self, segment: Segment) -> Result<(), BackendError> {
        let layout = Layout::from_size_align(segment.len(), PAGE_SIZE).map_err(|_| {
            BackendError::InvalidLength {
                len: segment.len(),
            }
        })?;
        // SAFETY: the segment was produced by `commit` with this exact layout.
        unsafe { std::alloc::System.dealloc(segment.base() as *mut u8, layout) };
        Ok(())
    }

    fn describe(&self) -> String {
        "heap".to_string()
    }
}

/// Build the backend a tier uses under `config`.
#[must_use]
pub fn backend_for(tier: MemoryTier, config: &EngineConfig) -> Box<dyn ArenaBackend> {
    match config.backend {
        BackendKind::Mmap => Box::new(MmapBackend::new(tier, config.tier(tier).numa_node)),
        BackendKind::Heap => Box::new(HeapBackend::new(tier)),
    }
}
