//! Per-thread "inside the engine" marker.
//!
//! When the engine backs the Rust global allocator, its own bookkeeping
//! (table growth, log records, thread-local tier slots) allocates too.
//! Those nested requests must bypass the engine, or they would try to take
//! locks the thread already holds. Every engine entry point holds an
//! [`EngineScope`]; the global allocator adapter routes anything requested
//! while a scope is open to the system allocator.

use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII marker for code running inside the engine on this thread.
#[derive(Debug)]
pub(crate) struct EngineScope {
    entered: bool,
}

impl EngineScope {
    pub(crate) fn enter() -> Self {
        let entered = DEPTH
            .try_with(|depth| depth.set(depth.get().saturating_add(1)))
            .is_ok();
        Self { entered }
    }
}

impl Drop for EngineScope {
    fn drop(&mut self) {
        if self.entered {
            let _ = DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
        }
    }
}

/// Whether the calling thread is currently inside the engine.
///
/// Reports `true` once thread-local storage is gone, so late allocations
/// during thread teardown go straight to the system allocator.
#[must_use]
pub fn in_engine_scope() -> bool {
    DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        assert!(!in_engine_scope());
        {
            let _outer = EngineScope::enter();
            assert!(in_engine_scope());
            {
                let _inner = EngineScope::enter();
                assert!(in_engine_scope());
            }
            assert!(in_engine_scope());
        }
        assert!(!in_engine_scope());
    }

    #[test]
    fn scope_is_per_thread() {
        let _scope = EngineScope::enter();
        let other = std::thread::spawn(in_engine_scope).join().unwrap();
        assert!(!other);
    }
}
