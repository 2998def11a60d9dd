//! # tiermem-abi
//!
//! `extern "C"` boundary for the explicit-indicator engine.
//!
//! This crate produces a `cdylib` (`libtiermem.so`) exposing the indicator
//! protocol (`EnableExplicitIndicator`, `SetHostMemory`, `SetCxlMemory`,
//! `GetMemoryMode`) and a prefixed allocation family (`tiermem_malloc`,
//! `tiermem_free`, ...). Every symbol delegates to the process engine in
//! `tiermem-core`; no routing logic lives here.
//!
//! ```text
//! C / Python / Java caller -> ABI entry (this crate) -> process Engine -> tier arena
//! ```
//!
//! Symbols are prefixed so loading the library never interposes on the
//! system `malloc`.

mod errno;
pub mod indicator_abi;
pub mod malloc_abi;
