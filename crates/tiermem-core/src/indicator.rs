//! The explicit-indicator capability consumed by language bindings.
//!
//! Bindings (the C ABI, and through it Python or Java wrappers) only ever
//! see this surface: switch on the indicator, pick a tier, read it back,
//! allocate, free.

use crate::engine::Engine;
use crate::error::AllocError;
use crate::tier::MemoryTier;

pub trait ExplicitIndicator {
    /// Enter explicit-indicator mode. Idempotent.
    fn enable(&self);

    /// Route subsequent allocations to HOST.
    fn set_host(&self);

    /// Route subsequent allocations to CXL.
    fn set_cxl(&self);

    fn get_mode(&self) -> MemoryTier;

    fn allocate(&self, size: usize) -> Result<usize, AllocError>;

    /// Release to the tier the block came from.
    fn free(&self, addr: usize) -> Result<(), AllocError>;
}

impl ExplicitIndicator for Engine {
    fn enable(&self) {
        self.enable_explicit_indicator();
    }

    fn set_host(&self) {
        self.set_host_memory();
    }

    fn set_cxl(&self) {
        self.set_cxl_memory();
    }

    fn get_mode(&self) -> MemoryTier {
        self.get_memory_mode()
    }

    fn allocate(&self, size: usize) -> Result<usize, AllocError> {
        Engine::allocate(self, size)
    }

    fn free(&self, addr: usize) -> Result<(), AllocError> {
        Engine::free(self, addr).map(|_| ())
    }
}

impl<T: ExplicitIndicator + ?Sized> ExplicitIndicator for std::sync::Arc<T> {
    fn enable(&self) {
        (**self).enable();
    }

    fn set_host(&self) {
        (**self).set_host();
    }

    fn set_cxl(&self) {
        (**self).set_cxl();
    }

    fn get_mode(&self) -> MemoryTier {
        (**self).get_mode()
    }

    fn allocate(&self, size: usize) -> Result<usize, AllocError> {
        (**self).allocate(size)
    }

    fn free(&self, addr: usize) -> Result<(), AllocError> {
        (**self).free(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, EngineConfig};

    fn drive(indicator: &dyn ExplicitIndicator) -> (MemoryTier, MemoryTier) {
        indicator.enable();
        indicator.set_cxl();
        let a = indicator.allocate(64).unwrap();
        let during = indicator.get_mode();
        indicator.set_host();
        indicator.free(a).unwrap();
        (during, indicator.get_mode())
    }

    #[test]
    fn engine_satisfies_the_capability() {
        let engine = Engine::new(EngineConfig::default().with_backend(BackendKind::Heap));
        assert_eq!(drive(&engine), (MemoryTier::Cxl, MemoryTier::Host));
        assert_eq!(engine.live_blocks(), 0);
        assert!(engine.is_explicit_indicator_enabled());
    }

    #[test]
    fn shared_engine_satisfies_the_capability() {
        let engine = std::sync::Arc::new(Engine::new(
            EngineConfig::default().with_backend(BackendKind::Heap),
        ));
        assert_eq!(drive(&engine), (MemoryTier::Cxl, MemoryTier::Host));
        assert_eq!(
            engine.free(0x10),
            Err(AllocError::UnknownAddress { addr: 0x10 })
        );
    }
}
