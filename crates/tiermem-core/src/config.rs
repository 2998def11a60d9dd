//! Engine configuration.
//!
//! The process-wide engine reads its configuration from the environment:
//! - `TIERMEM_MODE_SCOPE`: `process` (default) or `thread`. Controls whether
//!   `set_host_memory`/`set_cxl_memory` affect every thread or only the caller.
//! - `TIERMEM_CXL_NODE` / `TIERMEM_HOST_NODE`: NUMA node each tier's segments
//!   are bound to. Unset means the kernel's local placement policy.
//! - `TIERMEM_CXL_CAPACITY` / `TIERMEM_HOST_CAPACITY`: per-tier ceiling on
//!   committed bytes (`K`, `M`, `G`, `T` suffixes accepted). Unset is unlimited.
//! - `TIERMEM_SEGMENT_SIZE`: arena growth unit, rounded up to whole pages.
//! - `TIERMEM_BACKEND`: `mmap` (default) or `heap`.
//! - `TIERMEM_LOG`: lifecycle log threshold or `off`. Default `warn`.
//! - `TIERMEM_LOG_CAPACITY`: bounded lifecycle record count.

use serde::Serialize;

use crate::backend::PAGE_SIZE;
use crate::error::ConfigError;
use crate::log::LogLevel;
use crate::tier::MemoryTier;

pub const ENV_MODE_SCOPE: &str = "TIERMEM_MODE_SCOPE";
pub const ENV_HOST_NODE: &str = "TIERMEM_HOST_NODE";
pub const ENV_CXL_NODE: &str = "TIERMEM_CXL_NODE";
pub const ENV_HOST_CAPACITY: &str = "TIERMEM_HOST_CAPACITY";
pub const ENV_CXL_CAPACITY: &str = "TIERMEM_CXL_CAPACITY";
pub const ENV_SEGMENT_SIZE: &str = "TIERMEM_SEGMENT_SIZE";
pub const ENV_BACKEND: &str = "TIERMEM_BACKEND";
pub const ENV_LOG: &str = "TIERMEM_LOG";
pub const ENV_LOG_CAPACITY: &str = "TIERMEM_LOG_CAPACITY";

/// Visibility of the active tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeScope {
    /// One tier shared by every thread.
    #[default]
    Process,
    /// Each thread holds its own tier, starting at HOST.
    Thread,
}

impl ModeScope {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "global" | "shared" => Some(Self::Process),
            "thread" | "per-thread" | "tls" => Some(Self::Thread),
            _ => None,
        }
    }
}

/// Where arena segments come from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Anonymous `mmap`, optionally bound to a NUMA node.
    #[default]
    Mmap,
    /// Page-aligned blocks from the Rust system allocator. No node binding.
    Heap,
}

impl BackendKind {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mmap" | "os" | "numa" => Some(Self::Mmap),
            "heap" | "system" | "std" => Some(Self::Heap),
            _ => None,
        }
    }
}

/// Per-tier settings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierConfig {
    /// Ceiling on committed bytes. `None` is unlimited.
    pub capacity: Option<usize>,
    /// NUMA node the tier's segments are bound to.
    pub numa_node: Option<u32>,
}

/// Full engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub scope: ModeScope,
    pub host: TierConfig,
    pub cxl: TierConfig,
    /// Arena growth unit in bytes (page multiple).
    pub segment_size: usize,
    pub backend: BackendKind,
    /// Lifecycle log threshold. `None` disables the log.
    pub log_level: Option<LogLevel>,
    pub log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scope: ModeScope::Process,
            host: TierConfig::default(),
            cxl: TierConfig::default(),
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
            backend: BackendKind::Mmap,
            log_level: Some(LogLevel::Warn),
            log_capacity: Self::DEFAULT_LOG_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub const DEFAULT_SEGMENT_SIZE: usize = 2 * 1024 * 1024;
    pub const DEFAULT_LOG_CAPACITY: usize = 4096;

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the environment key by key. See [`Self::from_lookup_lenient`].
    #[must_use]
    pub fn from_env_lenient() -> (Self, Vec<ConfigError>) {
        Self::from_lookup_lenient(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; empty values count as unset. Fails on
    /// the first malformed value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config, rejected) = Self::from_lookup_lenient(lookup);
        match rejected.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(config),
        }
    }

    /// Build a configuration keeping every valid key and returning the
    /// rejected ones.
    ///
    /// A rejected CXL key (node or capacity) caps the CXL tier at zero bytes:
    /// CXL requests then fail with `OutOfMemory` instead of landing on memory
    /// the caller did not ask for.
    #[must_use]
    pub fn from_lookup_lenient<F>(lookup: F) -> (Self, Vec<ConfigError>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();
        let mut rejected = Vec::new();
        let mut keep = |result: Result<(), ConfigError>| {
            if let Err(err) = result {
                rejected.push(err);
            }
        };

        if let Some(raw) = get(ENV_MODE_SCOPE) {
            keep(ModeScope::from_str_loose(&raw)
                .map(|scope| config.scope = scope)
                .ok_or_else(|| invalid(ENV_MODE_SCOPE, raw)));
        }
        if let Some(raw) = get(ENV_BACKEND) {
            keep(BackendKind::from_str_loose(&raw)
                .map(|backend| config.backend = backend)
                .ok_or_else(|| invalid(ENV_BACKEND, raw)));
        }
        if let Some(raw) = get(ENV_HOST_NODE) {
            keep(parse_node(ENV_HOST_NODE, raw).map(|node| config.host.numa_node = Some(node)));
        }
        if let Some(raw) = get(ENV_CXL_NODE) {
            keep(parse_node(ENV_CXL_NODE, raw).map(|node| config.cxl.numa_node = Some(node)));
        }
        if let Some(raw) = get(ENV_HOST_CAPACITY) {
            keep(parse_size(&raw)
                .map(|bytes| config.host.capacity = Some(bytes))
                .ok_or_else(|| invalid(ENV_HOST_CAPACITY, raw)));
        }
        if let Some(raw) = get(ENV_CXL_CAPACITY) {
            keep(parse_size(&raw)
                .map(|bytes| config.cxl.capacity = Some(bytes))
                .ok_or_else(|| invalid(ENV_CXL_CAPACITY, raw)));
        }
        if let Some(raw) = get(ENV_SEGMENT_SIZE) {
            keep(parse_size(&raw)
                .filter(|&s| s > 0)
                .map(|size| config.segment_size = round_to_pages(size))
                .ok_or_else(|| invalid(ENV_SEGMENT_SIZE, raw)));
        }
        if let Some(raw) = get(ENV_LOG) {
            keep(LogLevel::parse_threshold(&raw)
                .map(|level| config.log_level = level)
                .ok_or_else(|| invalid(ENV_LOG, raw)));
        }
        if let Some(raw) = get(ENV_LOG_CAPACITY) {
            keep(raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .map(|n| config.log_capacity = n)
                .ok_or_else(|| invalid(ENV_LOG_CAPACITY, raw)));
        }

        if rejected.iter().any(|err| err.tier() == Some(MemoryTier::Cxl)) {
            config.cxl.capacity = Some(0);
        }
        (config, rejected)
    }

    /// Settings for one tier.
    #[must_use]
    pub fn tier(&self, tier: MemoryTier) -> &TierConfig {
        match tier {
            MemoryTier::Host => &self.host,
            MemoryTier::Cxl => &self.cxl,
        }
    }

    fn tier_mut(&mut self, tier: MemoryTier) -> &mut TierConfig {
        match tier {
            MemoryTier::Host => &mut self.host,
            MemoryTier::Cxl => &mut self.cxl,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: ModeScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, tier: MemoryTier, capacity: Option<usize>) -> Self {
        self.tier_mut(tier).capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_numa_node(mut self, tier: MemoryTier, node: Option<u32>) -> Self {
        self.tier_mut(tier).numa_node = node;
        self
    }

    /// Set the growth unit. Rounded up to whole pages, minimum one page.
    #[must_use]
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = round_to_pages(segment_size.max(1));
        self
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: Option<LogLevel>) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }
}

/// Parse a byte count with an optional binary suffix (`K`, `M`, `G`, `T`,
/// optionally followed by `B` or `iB`).
#[must_use]
pub fn parse_size(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s
        .strip_suffix("ib")
        .or_else(|| s.strip_suffix('b'))
        .unwrap_or(&s);
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        b't' => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(1usize.checked_shl(shift)?)
}

fn parse_node(key: &'static str, raw: String) -> Result<u32, ConfigError> {
    raw.trim().parse::<u32>().map_err(|_| invalid(key, raw))
}

fn round_to_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE).saturating_mul(PAGE_SIZE)
}

fn invalid(key: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { key, value }
}
