//! Cooperative poll sleeps.
//!
//! All waiting in this crate is poll-and-sleep; the sleep returns early when
//! a signal arrives (SIGIO from a directory notification, or a shutdown
//! signal) so latency shrinks without the notification ever being
//! load-bearing for correctness.

use std::time::Duration;

#[cfg(unix)]
pub fn sleep_interruptible(duration: Duration) {
    let ts = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    // EINTR is the point: wake up early, let the caller re-check state
    unsafe {
        libc::nanosleep(&ts, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn sleep_interruptible(duration: Duration) {
    std::thread::sleep(duration);
}
