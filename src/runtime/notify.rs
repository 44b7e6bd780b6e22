//! Worker-to-reactor wakeup via eventfd.
//!
//! Workers cannot touch the reactor's slot table, so a worker that needs
//! a connection closed posts a completion message and bumps this eventfd.
//! The reactor keeps the fd in its epoll set (level-triggered) and drains
//! the counter plus the message channel when it becomes readable.

use std::io;
use std::os::unix::io::RawFd;

/// Counter-semantics eventfd: any number of `notify` calls collapse into
/// a single readable wakeup.
pub struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter. A full counter (EAGAIN) already guarantees a
    /// pending wakeup, so the result is ignored.
    pub fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Reset the counter. Returns the number of notifications folded into
    /// this wakeup (zero when nothing was pending).
    pub fn drain(&self) -> u64 {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(self.fd, &mut count as *mut u64 as *mut libc::c_void, 8)
        };
        if n == 8 {
            count
        } else {
            0
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_drain_round_trip() {
        let n = Notifier::new().unwrap();
        assert_eq!(n.drain(), 0);
        n.notify();
        n.notify();
        n.notify();
        assert_eq!(n.drain(), 3);
        assert_eq!(n.drain(), 0);
    }

    #[test]
    fn test_notify_from_other_thread() {
        let n = std::sync::Arc::new(Notifier::new().unwrap());
        let handle = {
            let n = std::sync::Arc::clone(&n);
            std::thread::spawn(move || n.notify())
        };
        handle.join().unwrap();
        assert_eq!(n.drain(), 1);
    }
}
