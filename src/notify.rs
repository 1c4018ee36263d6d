//! Optional directory-change notification.
//!
//! On Linux a dnotify subscription on the stream directory raises SIGIO when
//! entries change, interrupting the reader's poll sleep so new chunks are
//! picked up sooner. The default disposition of SIGIO terminates the process,
//! so creating a watch installs a no-op handler if the application has not
//! chosen one of its own. Notifications can be coalesced or missed, so this
//! is a latency optimization only; the poll loop stays correct without it.

use std::path::Path;

use crate::Result;

// dnotify event bits for fcntl(F_NOTIFY); libc exposes the command but not
// the bits
#[cfg(target_os = "linux")]
const DN_MODIFY: libc::c_long = 0x02;
#[cfg(target_os = "linux")]
const DN_CREATE: libc::c_long = 0x04;
#[cfg(target_os = "linux")]
const DN_DELETE: libc::c_long = 0x08;
#[cfg(target_os = "linux")]
const DN_RENAME: libc::c_long = 0x10;

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct DirWatch {
    dir: std::fs::File,
}

#[cfg(target_os = "linux")]
impl DirWatch {
    pub fn new(root: &Path) -> Result<Self> {
        install_sigio_handler();
        Ok(Self {
            dir: std::fs::File::open(root)?,
        })
    }

    /// Re-arms the one-shot subscription. Best effort: a failure only costs
    /// latency.
    pub fn arm(&self) {
        use std::os::unix::io::AsRawFd;
        let events = DN_CREATE | DN_DELETE | DN_RENAME | DN_MODIFY;
        let res = unsafe { libc::fcntl(self.dir.as_raw_fd(), libc::F_NOTIFY, events) };
        if res == -1 {
            log::debug!(
                "F_NOTIFY failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(target_os = "linux")]
extern "C" fn on_sigio(_sig: libc::c_int) {
    // delivery alone interrupts the poll sleep
}

/// Replaces only the default (fatal) SIGIO disposition; a handler the
/// application installed itself is left untouched.
#[cfg(target_os = "linux")]
fn install_sigio_handler() {
    use std::sync::Once;
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGIO, std::ptr::null(), &mut old) != 0 {
            return;
        }
        if old.sa_sigaction != libc::SIG_DFL {
            return;
        }
        let handler: extern "C" fn(libc::c_int) = on_sigio;
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler as libc::sighandler_t;
        libc::sigaction(libc::SIGIO, &act, std::ptr::null_mut());
    });
}

#[cfg(not(target_os = "linux"))]
#[derive(Debug)]
pub struct DirWatch;

#[cfg(not(target_os = "linux"))]
impl DirWatch {
    pub fn new(_root: &Path) -> Result<Self> {
        Ok(Self)
    }

    pub fn arm(&self) {}
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn watch_arms_on_a_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let watch = DirWatch::new(dir.path()).unwrap();
        watch.arm();
        // churn the directory while subscribed; SIGIO must not kill us
        std::fs::write(dir.path().join("entry"), b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}
