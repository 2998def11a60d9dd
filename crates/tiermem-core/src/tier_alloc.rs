//! Per-tier free-list allocator.
//!
//! Each tier owns exactly one arena: an ordered set of segments committed by
//! the tier's backend. Free space is tracked twice, by address (for
//! coalescing) and by `(len, addr)` (for best-fit search). Free ranges never
//! span two segments, so a fully free segment is always a single range and
//! can be handed back to the backend as a unit.
//!
//! The allocator only deals in addresses; it never reads or writes the memory
//! it manages.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use serde::Serialize;

use crate::backend::{ArenaBackend, PAGE_SIZE, Segment, page_align};
use crate::error::{BackendError, GrowError};
use crate::tier::MemoryTier;

/// Allocation granule. Every block starts on and is sized in multiples of it.
pub const GRANULE: usize = 16;

/// Round up to the granule. `None` on overflow.
#[must_use]
pub const fn granule_align(size: usize) -> Option<usize> {
    match size.checked_add(GRANULE - 1) {
        Some(v) => Some(v & !(GRANULE - 1)),
        None => None,
    }
}

/// A carved range handed to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carve {
    pub addr: usize,
    /// Bytes actually set aside (granule-rounded).
    pub reserved: usize,
    /// Whether this carve committed a new segment.
    pub grew: bool,
}

/// Point-in-time arena figures for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub tier: MemoryTier,
    pub capacity: Option<usize>,
    pub committed_bytes: usize,
    pub peak_committed_bytes: usize,
    pub segments: usize,
    pub in_use_bytes: usize,
    pub live_ranges: usize,
    pub free_bytes: usize,
    pub free_ranges: usize,
    pub largest_free_range: usize,
    pub growths: u64,
    pub capacity_failures: u64,
    pub released_segments: u64,
}

#[derive(Debug, Default)]
struct ArenaState {
    /// Segment base -> length.
    segments: BTreeMap<usize, usize>,
    /// Free range start -> length.
    free_by_addr: BTreeMap<usize, usize>,
    /// `(length, start)` for best-fit lookup.
    free_by_size: BTreeSet<(usize, usize)>,
    committed: usize,
    peak_committed: usize,
    in_use: usize,
    live: usize,
    growths: u64,
    capacity_failures: u64,
    released_segments: u64,
}

impl ArenaState {
    fn segment_of(&self, addr: usize) -> Option<Segment> {
        let (&base, &len) = self.segments.range(..=addr).next_back()?;
        let segment = Segment::new(base, len);
        segment.contains(addr).then_some(segment)
    }

    fn insert_raw(&mut self, addr: usize, len: usize) {
        self.free_by_addr.insert(addr, len);
        self.free_by_size.insert((len, addr));
    }

    fn remove_raw(&mut self, addr: usize, len: usize) {
        self.free_by_addr.remove(&addr);
        self.free_by_size.remove(&(len, addr));
    }

    /// Return `[addr, addr + len)` to the free structure, merging with free
    /// neighbours inside the same segment.
    fn insert_free(&mut self, mut addr: usize, mut len: usize) {
        let Some(segment) = self.segment_of(addr) else {
            debug_assert!(false, "free range {addr:#x} outside every segment");
            return;
        };
        if let Some((&prev, &prev_len)) = self.free_by_addr.range(..addr).next_back()
            && prev + prev_len == addr
            && prev >= segment.base()
        {
            self.remove_raw(prev, prev_len);
            addr = prev;
            len += prev_len;
        }
        let next = addr + len;
        if next < segment.end()
            && let Some(&next_len) = self.free_by_addr.get(&next)
        {
            self.remove_raw(next, next_len);
            len += next_len;
        }
        self.insert_raw(addr, len);
    }

    /// Best-fit search for `reserved` bytes at `align`.
    fn find_fit(&self, reserved: usize, align: usize) -> Option<(usize, usize, usize)> {
        self.free_by_size
            .range((reserved, 0)..)
            .find_map(|&(len, addr)| {
                let start = addr.checked_next_multiple_of(align)?;
                let lead = start - addr;
                (lead + reserved <= len).then_some((addr, len, start))
            })
    }

    fn carve(&mut self, reserved: usize, align: usize) -> Option<usize> {
        let (addr, len, start) = self.find_fit(reserved, align)?;
        self.remove_raw(addr, len);
        if start > addr {
            self.insert_raw(addr, start - addr);
        }
        let tail = addr + len - (start + reserved);
        if tail > 0 {
            self.insert_raw(start + reserved, tail);
        }
        self.in_use += reserved;
        self.live += 1;
        Some(start)
    }
}

/// Free-list allocator over one tier's arena.
pub struct TierAllocator {
    tier: MemoryTier,
    backend: Box<dyn ArenaBackend>,
    capacity: Option<usize>,
    segment_size: usize,
    state: Mutex<ArenaState>,
}

impl TierAllocator {
    /// `segment_size` is rounded to whole pages. `capacity` bounds committed bytes.
    #[must_use]
    pub fn new(
        tier: MemoryTier,
        backend: Box<dyn ArenaBackend>,
        capacity: Option<usize>,
        segment_size: usize,
    ) -> Self {
        let segment_size = page_align(segment_size.max(PAGE_SIZE)).unwrap_or(PAGE_SIZE);
        Self {
            tier,
            backend,
            capacity,
            segment_size,
            state: Mutex::new(ArenaState::default()),
        }
    }

    #[must_use]
    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[must_use]
    pub fn backend_description(&self) -> String {
        self.backend.describe()
    }

    /// Carve `reserved` bytes (a granule multiple) aligned to `align`
    /// (a power of two between the granule and the page size).
    ///
    /// Grows the arena by one segment when nothing fits. Never touches any
    /// other tier.
    pub fn allocate(&self, reserved: usize, align: usize) -> Result<Carve, GrowError> {
        debug_assert!(reserved > 0 && reserved % GRANULE == 0);
        debug_assert!(align.is_power_of_two() && align <= PAGE_SIZE);
        let align = align.max(GRANULE);

        let mut state = self.state.lock();
        if let Some(addr) = state.carve(reserved, align) {
            return Ok(Carve {
                addr,
                reserved,
                grew: false,
            });
        }

        self.grow(&mut state, reserved)?;
        match state.carve(reserved, align) {
            Some(addr) => Ok(Carve {
                addr,
                reserved,
                grew: true,
            }),
            // A fresh page-aligned segment of at least `reserved` bytes always fits.
            None => Err(GrowError::CapacityExceeded {
                capacity: self.capacity.unwrap_or(usize::MAX),
                committed: state.committed,
                wanted: reserved,
            }),
        }
    }

    fn grow(&self, state: &mut ArenaState, reserved: usize) -> Result<(), GrowError> {
        let minimum = page_align(reserved).ok_or(GrowError::CapacityExceeded {
            capacity: self.capacity.unwrap_or(usize::MAX),
            committed: state.committed,
            wanted: reserved,
        })?;
        let preferred = minimum.max(self.segment_size);
        let len = match self.capacity {
            None => preferred,
            Some(cap) => {
                let room = cap.saturating_sub(state.committed);
                if preferred <= room {
                    preferred
                } else if minimum <= room {
                    // Take the largest page multiple that still fits under the ceiling.
                    room & !(PAGE_SIZE - 1)
                } else {
                    state.capacity_failures += 1;
                    return Err(GrowError::CapacityExceeded {
                        capacity: cap,
                        committed: state.committed,
                        wanted: minimum,
                    });
                }
            }
        };

        let segment = self.backend.commit(len)?;
        state.segments.insert(segment.base(), segment.len());
        state.committed += segment.len();
        state.peak_committed = state.peak_committed.max(state.committed);
        state.growths += 1;
        state.insert_raw(segment.base(), segment.len());
        Ok(())
    }

    /// Return a carved range.
    pub fn free(&self, addr: usize, reserved: usize) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(reserved);
        state.live = state.live.saturating_sub(1);
        state.insert_free(addr, reserved);
    }

    /// Resize a carved range without moving it.
    ///
    /// Shrinking always succeeds. Growing succeeds only if the bytes directly
    /// after the range are free and inside the same segment. Returns the new
    /// reserved length.
    pub fn resize_in_place(&self, addr: usize, old_reserved: usize, new_reserved: usize) -> Option<usize> {
        debug_assert!(new_reserved > 0 && new_reserved % GRANULE == 0);
        let mut state = self.state.lock();
        if new_reserved == old_reserved {
            return Some(old_reserved);
        }
        if new_reserved < old_reserved {
            let released = old_reserved - new_reserved;
            state.in_use -= released;
            state.insert_free(addr + new_reserved, released);
            return Some(new_reserved);
        }

        let needed = new_reserved - old_reserved;
        let next = addr + old_reserved;
        let segment = state.segment_of(addr)?;
        if next >= segment.end() {
            return None;
        }
        let next_len = *state.free_by_addr.get(&next)?;
        if next_len < needed {
            return None;
        }
        state.remove_raw(next, next_len);
        if next_len > needed {
            state.insert_raw(next + needed, next_len - needed);
        }
        state.in_use += needed;
        Some(new_reserved)
    }

    /// Hand fully free segments back to the backend, keeping one as a warm
    /// reserve. Returns the number of bytes released.
    pub fn trim(&self) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let idle: Vec<Segment> = state
            .segments
            .iter()
            .filter(|&(base, len)| state.free_by_addr.get(base) == Some(len))
            .map(|(&base, &len)| Segment::new(base, len))
            .collect();

        let mut released = 0;
        for segment in idle.into_iter().skip(1) {
            self.backend.release(segment)?;
            state.remove_raw(segment.base(), segment.len());
            state.segments.remove(&segment.base());
            state.committed -= segment.len();
            state.released_segments += 1;
            released += segment.len();
        }
        Ok(released)
    }

    /// Whether `addr` lies inside one of this tier's segments.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.state.lock().segment_of(addr).is_some()
    }

    /// The segment holding `addr`, if any.
    #[must_use]
    pub fn segment_of(&self, addr: usize) -> Option<Segment> {
        self.state.lock().segment_of(addr)
    }

    #[must_use]
    pub fn stats(&self) -> TierStats {
        let state = self.state.lock();
        TierStats {
            tier: self.tier,
            capacity: self.capacity,
            committed_bytes: state.committed,
            peak_committed_bytes: state.peak_committed,
            segments: state.segments.len(),
            in_use_bytes: state.in_use,
            live_ranges: state.live,
            free_bytes: state.free_by_addr.values().sum(),
            free_ranges: state.free_by_addr.len(),
            largest_free_range: state
                .free_by_size
                .iter()
                .next_back()
                .map_or(0, |&(len, _)| len),
            growths: state.growths,
            capacity_failures: state.capacity_failures,
            released_segments: state.released_segments,
        }
    }
}

impl Drop for TierAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (&base, &len) in &state.segments {
            // Nothing useful can be done with a failed unmap during teardown.
            let _ = self.backend.release(Segment::new(base, len));
        }
        state.segments.clear();
    }
}
