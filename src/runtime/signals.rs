//! Signal-to-pipe bridge.
//!
//! SIGALRM (the timer tick) and SIGTERM are converted into single bytes
//! on a unix socket pair so the reactor observes them through the same
//! readiness interface as every other fd. The handler is
//! async-signal-safe: it saves and restores `errno` and performs exactly
//! one `send` of the raw signal number on a non-blocking fd.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use super::set_nonblocking;

/// Write end of the bridge, published for the signal handler. This is the
/// one process-wide global the design allows: a handler cannot receive
/// injected state.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Flags decoded from drained signal bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalFlags {
    /// SIGALRM arrived: run the timer sweep.
    pub timeout: bool,
    /// SIGTERM arrived: leave the event loop.
    pub stop: bool,
}

extern "C" fn forward_signal(sig: libc::c_int) {
    unsafe {
        let saved_errno = *libc::__errno_location();
        let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const libc::c_void, 1, 0);
        }
        *libc::__errno_location() = saved_errno;
    }
}

/// The socket pair plus the handler registrations that feed it.
pub struct SignalBridge {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalBridge {
    /// Create the socket pair, publish the write end, and install the
    /// SIGALRM/SIGTERM handlers (full mask, no SA_RESTART). SIGPIPE is
    /// ignored process-wide.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        let bridge = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblocking(bridge.write_fd)?;
        PIPE_WRITE_FD.store(bridge.write_fd, Ordering::Relaxed);

        Self::set_handler(libc::SIGPIPE, libc::SIG_IGN)?;
        Self::set_handler(libc::SIGALRM, forward_signal as libc::sighandler_t)?;
        Self::set_handler(libc::SIGTERM, forward_signal as libc::sighandler_t)?;
        Ok(bridge)
    }

    fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler;
            // Interrupt the reactor's wait instead of restarting it.
            sa.sa_flags = 0;
            libc::sigfillset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Fd the reactor registers for readable notification.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain pending signal bytes and fold them into flags. A drained-dry
    /// or interrupted read simply returns whatever was decoded so far.
    pub fn drain(&self) -> SignalFlags {
        let mut flags = SignalFlags::default();
        let mut buf = [0u8; 1024];
        let n = unsafe {
            libc::recv(
                self.read_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n <= 0 {
            return flags;
        }
        for &byte in &buf[..n as usize] {
            match libc::c_int::from(byte) {
                libc::SIGALRM => flags.timeout = true,
                libc::SIGTERM => flags.stop = true,
                _ => {}
            }
        }
        flags
    }

    /// Arm the next SIGALRM `secs` seconds from now.
    pub fn arm(&self, secs: u32) {
        unsafe {
            libc::alarm(secs);
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        PIPE_WRITE_FD.store(-1, Ordering::Relaxed);
        unsafe {
            libc::close(self.write_fd);
            libc::close(self.read_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_drain_decodes_signal_bytes() {
        let (read_fd, write_fd) = raw_pair();
        let bridge = SignalBridge { read_fd, write_fd };

        let bytes = [libc::SIGALRM as u8, libc::SIGTERM as u8, libc::SIGALRM as u8];
        let n = unsafe {
            libc::send(
                write_fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
            )
        };
        assert_eq!(n, bytes.len() as isize);

        let flags = bridge.drain();
        assert!(flags.timeout);
        assert!(flags.stop);
    }

    #[test]
    fn test_drain_ignores_unknown_bytes() {
        let (read_fd, write_fd) = raw_pair();
        let bridge = SignalBridge { read_fd, write_fd };

        let bytes = [0u8, 255u8];
        unsafe {
            libc::send(
                write_fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
            );
        }
        set_nonblocking(read_fd).unwrap();
        assert_eq!(bridge.drain(), SignalFlags::default());
        // Nothing pending: drain comes back empty instead of blocking.
        assert_eq!(bridge.drain(), SignalFlags::default());
    }
}
