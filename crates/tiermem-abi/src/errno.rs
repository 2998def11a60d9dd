//! Thread-local `errno` for ABI entry points.

use std::ffi::c_int;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut c_int {
    // SAFETY: returns the calling thread's errno slot; always valid.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut c_int {
    // SAFETY: returns the calling thread's errno slot; always valid.
    unsafe { libc::__error() }
}

pub(crate) fn set_abi_errno(val: c_int) {
    // SAFETY: the slot belongs to this thread and lives as long as it does.
    unsafe { *errno_location() = val };
}

#[cfg(test)]
pub(crate) fn get_abi_errno() -> c_int {
    // SAFETY: as above.
    unsafe { *errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_on_this_thread() {
        set_abi_errno(libc::EINVAL);
        assert_eq!(get_abi_errno(), libc::EINVAL);
        set_abi_errno(0);
        assert_eq!(get_abi_errno(), 0);
    }
}
