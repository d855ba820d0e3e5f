//! The `clock` module returns time values derived from the Posix
//! `clock_gettime` function.
//!
//! Monotonic time is not affected by changes to the wall clock, which makes
//! it the only sane currency for deadlines. Timers in this crate are kept in
//! milliseconds, so the millisecond readings are the ones the rest of the
//! crate uses.
//!
//! - [monotonic()](fn.monotonic.html) - monotonic time since boot
//! - [monotonic_ms()](fn.monotonic_ms.html) - the same, as a 64-bit number of milliseconds

use std::mem::MaybeUninit;
use std::time::Duration;

/// The monotonic time.
///
/// Derived from C function `clock_gettime(CLOCK_MONOTONIC)`.
///
/// Return: time since the computer was booted.
#[inline(always)]
pub fn monotonic() -> Duration {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// The monotonic time in milliseconds.
///
/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

#[inline(always)]
fn clock_gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // CLOCK_MONOTONIC cannot fail on any supported kernel.
    unsafe {
        libc::clock_gettime(clock, ts.as_mut_ptr());
        ts.assume_init()
    }
}
