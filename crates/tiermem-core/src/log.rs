//! Structured lifecycle records for the allocation engine.
//!
//! Every routing decision that passes the configured threshold leaves a
//! record with a monotonic decision id and a `core::tiermem::<symbol>::<id>`
//! trace id. The buffer is bounded; once full, the oldest records are
//! dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::tier::MemoryTier;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a threshold (case-insensitive). `Some(None)` means logging is off.
    #[must_use]
    pub fn parse_threshold(s: &str) -> Option<Option<Self>> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Some(Some(Self::Trace)),
            "debug" => Some(Some(Self::Debug)),
            "info" => Some(Some(Self::Info)),
            "warn" | "warning" => Some(Some(Self::Warn)),
            "error" => Some(Some(Self::Error)),
            "off" | "none" | "0" => Some(None),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this record.
    pub trace_id: String,
    pub level: LogLevel,
    /// Entry point (`allocate`, `free`, `set_memory_mode`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `unknown_address`, `tier_exhausted`, ...).
    pub event: &'static str,
    pub addr: Option<usize>,
    pub size: Option<usize>,
    pub tier: Option<MemoryTier>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: live blocks across both tiers.
    pub live_blocks: u64,
    /// Snapshot: requested bytes outstanding across both tiers.
    pub outstanding_bytes: u64,
}

/// Builder for a record before ids and snapshots are attached.
#[derive(Debug, Clone)]
pub struct LogEvent {
    symbol: &'static str,
    event: &'static str,
    outcome: &'static str,
    addr: Option<usize>,
    size: Option<usize>,
    tier: Option<MemoryTier>,
    details: String,
}

impl LogEvent {
    #[must_use]
    pub fn new(symbol: &'static str, event: &'static str, outcome: &'static str) -> Self {
        Self {
            symbol,
            event,
            outcome,
            addr: None,
            size: None,
            tier: None,
            details: String::new(),
        }
    }

    #[must_use]
    pub fn addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn tier(mut self, tier: MemoryTier) -> Self {
        self.tier = Some(tier);
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded, thread-safe lifecycle log.
pub struct LifecycleLog {
    threshold: Option<LogLevel>,
    capacity: usize,
    next_decision_id: AtomicU64,
    dropped: AtomicU64,
    records: Mutex<VecDeque<LifecycleRecord>>,
}

impl LifecycleLog {
    /// `threshold == None` disables recording entirely.
    #[must_use]
    pub fn new(threshold: Option<LogLevel>, capacity: usize) -> Self {
        Self {
            threshold,
            capacity: capacity.max(1),
            next_decision_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            records: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> Option<LogLevel> {
        self.threshold
    }

    /// Whether a record at `level` would be kept.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.threshold.is_some_and(|min| level >= min)
    }

    /// Append a record. Returns the assigned decision id, or `None` when filtered.
    pub fn record(
        &self,
        level: LogLevel,
        event: LogEvent,
        live_blocks: u64,
        outstanding_bytes: u64,
    ) -> Option<u64> {
        if !self.enabled(level) {
            return None;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let record = LifecycleRecord {
            decision_id,
            trace_id: format!("core::tiermem::{}::{:016x}", event.symbol, decision_id),
            level,
            symbol: event.symbol,
            event: event.event,
            addr: event.addr,
            size: event.size,
            tier: event.tier,
            outcome: event.outcome,
            details: event.details,
            live_blocks,
            outstanding_bytes,
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
        Some(decision_id)
    }

    /// Copy of the buffered records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Remove and return the buffered records, oldest first.
    pub fn drain(&self) -> Vec<LifecycleRecord> {
        self.records.lock().drain(..).collect()
    }

    /// Records evicted because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
