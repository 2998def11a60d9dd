//! Explicit-indicator tiered allocation for HOST and CXL memory.
//!
//! An application marks where its next allocations should live by flipping
//! a mode register (`set_host_memory` / `set_cxl_memory`); every allocation
//! is served from the arena of the selected tier and every free goes back
//! to the tier the block was recorded under.
//!
//! # Architecture
//!
//! - **Tiers** (`tier`): the two-valued `MemoryTier` (HOST = 0, CXL = 1)
//! - **Mode register** (`mode`): process-wide or per-thread tier selection
//! - **Arena backends** (`backend`): page-granular segments from `mmap` (NUMA-bound) or the heap
//! - **Tier allocator** (`tier_alloc`): coalescing free lists over growable, capped arenas
//! - **Block table** (`block_table`): sharded address -> (size, tier) metadata
//! - **Engine** (`engine`): the router tying the above together
//! - **Capability** (`indicator`): the surface bindings are written against
//! - **Process engine** (`global`): construct-on-first-use singleton with teardown
//! - **Global allocator** (`global_alloc`): `#[global_allocator]` adapter
//! - **Configuration** (`config`): `TIERMEM_*` environment settings
//! - **Lifecycle log** (`log`) and **metrics** (`metrics`): observability

#![deny(unsafe_code)]

pub mod backend;
pub mod block_table;
pub mod config;
pub mod engine;
pub mod error;
pub mod global;
pub mod global_alloc;
pub mod indicator;
pub mod log;
pub mod metrics;
pub mod mode;
mod reentry;
pub mod tier;
pub mod tier_alloc;

pub use block_table::Block;
pub use config::{BackendKind, EngineConfig, ModeScope, TierConfig};
pub use engine::{Engine, EngineStats};
pub use error::{AllocError, ConfigError, InvariantViolation};
pub use global::ProcessEngine;
pub use global_alloc::TierGlobalAlloc;
pub use indicator::ExplicitIndicator;
pub use log::{LifecycleRecord, LogLevel};
pub use metrics::MetricsSnapshot;
pub use reentry::in_engine_scope;
pub use tier::MemoryTier;
pub use tier_alloc::TierStats;
