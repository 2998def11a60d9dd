//! Process-wide engine.
//!
//! The C ABI and the global allocator adapter share one [`Engine`]. It is
//! built from the environment on first use, can be replaced with
//! [`install`], and is dropped by [`teardown`]. Independent engines for
//! tests or embedding are plain [`Engine::new`] values and never touch this
//! slot.
//!
//! Handles are `Arc`s: an engine dropped by `teardown` keeps its arenas
//! until the last in-flight call returns.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{AllocError, ConfigError};
use crate::indicator::ExplicitIndicator;
use crate::log::{LogEvent, LogLevel};
use crate::reentry::EngineScope;
use crate::tier::MemoryTier;

static PROCESS_ENGINE: RwLock<Option<Arc<Engine>>> = parking_lot::const_rwlock(None);

fn build_from_env() -> Engine {
    build(EngineConfig::from_env_lenient())
}

/// Build from a per-key parse, logging every rejected key.
fn build((config, rejected): (EngineConfig, Vec<ConfigError>)) -> Engine {
    let fenced = config.cxl.capacity == Some(0)
        && rejected.iter().any(|err| err.tier() == Some(MemoryTier::Cxl));
    let engine = Engine::new(config);
    for err in &rejected {
        engine.note(LogLevel::Error, || {
            let event = LogEvent::new("init", "config_rejected", "default_kept").details(err.to_string());
            match err.tier() {
                Some(tier) => event.tier(tier),
                None => event,
            }
        });
    }
    if fenced {
        engine.note(LogLevel::Error, || {
            LogEvent::new("init", "cxl_fenced", "capacity_zero")
                .tier(MemoryTier::Cxl)
                .details("cxl settings rejected; cxl requests fail until reconfigured")
        });
    }
    engine
}

/// The process engine, constructing it from the environment if needed.
#[must_use]
pub fn engine() -> Arc<Engine> {
    if let Some(engine) = PROCESS_ENGINE.read().as_ref() {
        return Arc::clone(engine);
    }

    // Build outside the lock: construction allocates, and under the global
    // allocator adapter an allocation may look the slot up again.
    let fresh = {
        let _scope = EngineScope::enter();
        Arc::new(build_from_env())
    };
    let (winner, loser) = {
        let mut slot = PROCESS_ENGINE.write();
        match slot.as_ref() {
            Some(existing) => (Arc::clone(existing), Some(fresh)),
            None => {
                *slot = Some(Arc::clone(&fresh));
                (fresh, None)
            }
        }
    };
    drop(loser);
    winner
}

/// The process engine if one exists. Never constructs.
#[must_use]
pub fn current() -> Option<Arc<Engine>> {
    PROCESS_ENGINE.read().clone()
}

#[must_use]
pub fn is_initialized() -> bool {
    PROCESS_ENGINE.read().is_some()
}

/// Make `engine` the process engine. Returns the engine it replaced.
pub fn install(engine: Engine) -> Option<Arc<Engine>> {
    let engine = Arc::new(engine);
    PROCESS_ENGINE.write().replace(engine)
}

/// Drop the process engine. The next [`engine`] call builds a fresh one.
///
/// Blocks still outstanding in the old engine are lost with its arenas;
/// call this only once they have been released. Returns whether an engine
/// existed.
pub fn teardown() -> bool {
    let old = PROCESS_ENGINE.write().take();
    // Dropped after the write lock is released.
    old.is_some()
}

/// Zero-sized handle implementing [`ExplicitIndicator`] over the process engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEngine;

impl ExplicitIndicator for ProcessEngine {
    fn enable(&self) {
        engine().enable_explicit_indicator();
    }

    fn set_host(&self) {
        engine().set_host_memory();
    }

    fn set_cxl(&self) {
        engine().set_cxl_memory();
    }

    fn get_mode(&self) -> MemoryTier {
        engine().get_memory_mode()
    }

    fn allocate(&self, size: usize) -> Result<usize, AllocError> {
        Engine::allocate(&engine(), size)
    }

    fn free(&self, addr: usize) -> Result<(), AllocError> {
        Engine::free(&engine(), addr).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use parking_lot::Mutex;

    // The slot is process-wide; serialize the tests that touch it.
    static SLOT_LOCK: Mutex<()> = parking_lot::const_mutex(());

    fn heap_engine() -> Engine {
        Engine::new(EngineConfig::default().with_backend(BackendKind::Heap))
    }

    #[test]
    fn test_engine_is_constructed_once() {
        let _guard = SLOT_LOCK.lock();
        teardown();
        assert!(!is_initialized());
        let a = engine();
        let b = engine();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(is_initialized());
        assert!(current().is_some());
        teardown();
    }

    #[test]
    fn test_teardown_then_rebuild_gives_fresh_state() {
        let _guard = SLOT_LOCK.lock();
        install(heap_engine());
        engine().set_cxl_memory();
        assert_eq!(engine().get_memory_mode(), MemoryTier::Cxl);
        assert!(teardown());
        assert!(!teardown());
        assert!(current().is_none());
        install(heap_engine());
        assert_eq!(engine().get_memory_mode(), MemoryTier::Host);
        teardown();
    }

    #[test]
    fn test_old_handle_outlives_teardown() {
        let _guard = SLOT_LOCK.lock();
        install(heap_engine());
        let handle = engine();
        let addr = Engine::allocate(&handle, 64).unwrap();
        teardown();
        assert_eq!(Engine::free(&handle, addr), Ok(MemoryTier::Host));
    }

    #[test]
    fn test_process_engine_capability() {
        let _guard = SLOT_LOCK.lock();
        install(heap_engine());
        let indicator = ProcessEngine;
        indicator.enable();
        indicator.set_cxl();
        let addr = indicator.allocate(128).unwrap();
        indicator.set_host();
        assert_eq!(engine().owner_of(addr), Some(MemoryTier::Cxl));
        indicator.free(addr).unwrap();
        assert_eq!(
            indicator.free(addr),
            Err(AllocError::UnknownAddress { addr })
        );
        assert_eq!(indicator.get_mode(), MemoryTier::Host);
        teardown();
    }

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_bad_key_keeps_valid_cxl_settings() {
        let engine = build(EngineConfig::from_lookup_lenient(lookup(&[
            ("TIERMEM_BACKEND", "heap"),
            ("TIERMEM_CXL_CAPACITY", "64K"),
            ("TIERMEM_CXL_NODE", "1"),
            ("TIERMEM_LOG", "verbose"),
        ])));
        assert_eq!(engine.config().cxl.capacity, Some(64 * 1024));
        assert_eq!(engine.config().cxl.numa_node, Some(1));

        let rejected: Vec<_> = engine
            .lifecycle_logs()
            .into_iter()
            .filter(|r| r.event == "config_rejected")
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].level, LogLevel::Error);
        assert!(rejected[0].details.contains("TIERMEM_LOG"));
        assert!(engine.allocate_on(MemoryTier::Cxl, 64).is_ok());
    }

    #[test]
    fn test_bad_cxl_key_refuses_cxl_allocations() {
        let engine = build(EngineConfig::from_lookup_lenient(lookup(&[
            ("TIERMEM_BACKEND", "heap"),
            ("TIERMEM_CXL_NODE", "far"),
        ])));
        let records = engine.lifecycle_logs();
        assert!(records.iter().any(|r| r.event == "config_rejected" && r.tier == Some(MemoryTier::Cxl)));
        assert!(records.iter().any(|r| r.event == "cxl_fenced"));

        assert!(matches!(
            engine.allocate_on(MemoryTier::Cxl, 64),
            Err(AllocError::OutOfMemory { tier: MemoryTier::Cxl, .. })
        ));
        let host = engine.allocate_on(MemoryTier::Host, 64).unwrap();
        assert_eq!(Engine::free(&engine, host), Ok(MemoryTier::Host));
    }
}
