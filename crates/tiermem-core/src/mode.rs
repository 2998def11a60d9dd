//! Mode register: which tier subsequent allocations come from.
//!
//! The register starts at HOST and can never be unset. In process scope a
//! single atomic is shared by all threads (release on write, acquire on
//! read). In thread scope each thread keeps its own value per register in
//! thread-local storage; a thread that never selected a tier reads HOST.
//! Slots of dropped registers are pruned lazily on the owning thread's next
//! `set`, so a thread holds at most one slot per live register.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::ModeScope;
use crate::tier::MemoryTier;

static NEXT_REGISTER_ID: AtomicU64 = AtomicU64::new(1);

/// Ids of thread-scoped registers that are still alive.
static LIVE_THREAD_REGISTERS: Mutex<BTreeSet<u64>> = parking_lot::const_mutex(BTreeSet::new());

/// Bumped after a thread-scoped register is dropped.
static RETIRE_EPOCH: AtomicU64 = AtomicU64::new(0);

/// This thread's tier per thread-scoped register.
struct ThreadSlots {
    /// `RETIRE_EPOCH` as of the last prune.
    epoch: u64,
    tiers: Vec<(u64, MemoryTier)>,
}

impl ThreadSlots {
    /// Forget registers dropped since the last prune, on whichever thread.
    fn prune(&mut self) {
        let epoch = RETIRE_EPOCH.load(Ordering::Acquire);
        if epoch == self.epoch {
            return;
        }
        let live = LIVE_THREAD_REGISTERS.lock();
        self.tiers.retain(|(id, _)| live.contains(id));
        self.epoch = epoch;
    }
}

thread_local! {
    static THREAD_SLOTS: RefCell<ThreadSlots> = const {
        RefCell::new(ThreadSlots { epoch: 0, tiers: Vec::new() })
    };
}

/// Active-tier register plus the explicit-indicator flag.
#[derive(Debug)]
pub struct ModeRegister {
    id: u64,
    scope: ModeScope,
    process_tier: AtomicU8,
    enabled: AtomicBool,
    switches: AtomicU64,
}

impl ModeRegister {
    #[must_use]
    pub fn new(scope: ModeScope) -> Self {
        let id = NEXT_REGISTER_ID.fetch_add(1, Ordering::Relaxed);
        if scope == ModeScope::Thread {
            LIVE_THREAD_REGISTERS.lock().insert(id);
        }
        Self {
            id,
            scope,
            process_tier: AtomicU8::new(MemoryTier::Host.as_raw()),
            enabled: AtomicBool::new(false),
            switches: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn scope(&self) -> ModeScope {
        self.scope
    }

    /// Turn on explicit-indicator mode. Idempotent; returns `true` only on
    /// the first call.
    pub fn enable(&self) -> bool {
        !self.enabled.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Select `tier` for the configured scope. Returns the previous tier.
    pub fn set(&self, tier: MemoryTier) -> MemoryTier {
        self.switches.fetch_add(1, Ordering::Relaxed);
        match self.scope {
            ModeScope::Process => {
                let prev = self.process_tier.swap(tier.as_raw(), Ordering::AcqRel);
                MemoryTier::from_raw(prev).unwrap_or_default()
            }
            ModeScope::Thread => THREAD_SLOTS
                .try_with(|cell| {
                    let mut slots = cell.borrow_mut();
                    slots.prune();
                    match slots.tiers.iter_mut().find(|(id, _)| *id == self.id) {
                        Some(slot) => std::mem::replace(&mut slot.1, tier),
                        None => {
                            slots.tiers.push((self.id, tier));
                            MemoryTier::Host
                        }
                    }
                })
                // Thread is exiting; its selection no longer matters.
                .unwrap_or_default(),
        }
    }

    /// Tier the calling thread's next allocation comes from.
    #[must_use]
    pub fn get(&self) -> MemoryTier {
        match self.scope {
            ModeScope::Process => {
                MemoryTier::from_raw(self.process_tier.load(Ordering::Acquire)).unwrap_or_default()
            }
            ModeScope::Thread => THREAD_SLOTS
                .try_with(|cell| {
                    cell.borrow()
                        .tiers
                        .iter()
                        .find(|(id, _)| *id == self.id)
                        .map(|&(_, tier)| tier)
                })
                .ok()
                .flatten()
                .unwrap_or_default(),
        }
    }

    /// Number of `set` calls so far.
    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }
}

impl Drop for ModeRegister {
    fn drop(&mut self) {
        if self.scope == ModeScope::Thread {
            LIVE_THREAD_REGISTERS.lock().remove(&self.id);
            RETIRE_EPOCH.fetch_add(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
fn thread_slot_count() -> usize {
    THREAD_SLOTS.with(|cell| cell.borrow().tiers.len())
}
