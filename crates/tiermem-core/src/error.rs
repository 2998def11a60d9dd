//! Error types for the allocation engine.

use thiserror::Error;

use crate::config;
use crate::tier::MemoryTier;

/// Errors surfaced by the allocation router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The selected tier could not satisfy the request. Never retried on the other tier.
    #[error("out of memory on {tier} tier: requested {requested} bytes")]
    OutOfMemory { tier: MemoryTier, requested: usize },
    /// The address is not the start of a live block.
    #[error("unknown address {addr:#x}")]
    UnknownAddress { addr: usize },
    /// Zero or oversized request.
    #[error("invalid allocation size {size}")]
    InvalidSize { size: usize },
    /// Alignment is not a power of two or exceeds the page size.
    #[error("invalid alignment {align}")]
    InvalidAlignment { align: usize },
}

/// Failures reported by an arena backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("segment length {len} is not a positive page multiple")]
    InvalidLength { len: usize },
    #[error("mapping {len} bytes failed (errno {errno})")]
    MapFailed { len: usize, errno: i32 },
    #[error("binding segment to node {node} failed (errno {errno})")]
    BindFailed { node: u32, errno: i32 },
    #[error("node {node} is outside the supported nodemask")]
    NodeOutOfRange { node: u32 },
    #[error("unmapping segment at {base:#x} failed (errno {errno})")]
    UnmapFailed { base: usize, errno: i32 },
}

/// Why a tier could not grow its arena.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrowError {
    #[error("capacity ceiling of {capacity} bytes reached ({committed} committed, {wanted} wanted)")]
    CapacityExceeded {
        capacity: usize,
        committed: usize,
        wanted: usize,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

impl ConfigError {
    /// Tier whose settings the rejected key belongs to, if any.
    #[must_use]
    pub fn tier(&self) -> Option<MemoryTier> {
        let Self::InvalidValue { key, .. } = self;
        match *key {
            config::ENV_CXL_NODE | config::ENV_CXL_CAPACITY => Some(MemoryTier::Cxl),
            config::ENV_HOST_NODE | config::ENV_HOST_CAPACITY => Some(MemoryTier::Host),
            _ => None,
        }
    }
}

/// A broken engine invariant found by [`crate::Engine::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("{tier} accounting mismatch: table holds {table} bytes, allocator holds {allocator}")]
    BytesMismatch {
        tier: MemoryTier,
        table: usize,
        allocator: usize,
    },
    #[error("{tier} block count mismatch: table holds {table}, allocator holds {allocator}")]
    CountMismatch {
        tier: MemoryTier,
        table: usize,
        allocator: usize,
    },
    #[error("blocks at {first:#x} and {second:#x} overlap")]
    Overlap { first: usize, second: usize },
    #[error("block at {addr:#x} lies outside every {tier} segment")]
    OutsideArena { addr: usize, tier: MemoryTier },
}
