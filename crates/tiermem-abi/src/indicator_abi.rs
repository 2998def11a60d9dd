//! ABI layer for the explicit-indicator protocol.
//!
//! Mode integers follow the tier encoding: HOST = 0, CXL = 1.

#![allow(non_snake_case)]

use std::ffi::c_int;

use tiermem_core::global;

/// Switch the process engine into explicit-indicator mode. Idempotent.
#[unsafe(no_mangle)]
pub extern "C" fn EnableExplicitIndicator() {
    global::engine().enable_explicit_indicator();
}

/// Route subsequent allocations to host memory. Always returns 0.
#[unsafe(no_mangle)]
pub extern "C" fn SetHostMemory() -> c_int {
    global::engine().set_host_memory();
    0
}

/// Route subsequent allocations to CXL memory. Always returns 0.
#[unsafe(no_mangle)]
pub extern "C" fn SetCxlMemory() -> c_int {
    global::engine().set_cxl_memory();
    0
}

/// Currently selected tier: 0 for HOST, 1 for CXL.
#[unsafe(no_mangle)]
pub extern "C" fn GetMemoryMode() -> c_int {
    c_int::from(global::engine().get_memory_mode().as_raw())
}
