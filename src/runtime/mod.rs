//! Reactor plumbing: the epoll wrapper, the signal bridge, the
//! worker-completion eventfd, and the idle-connection timer list.
//!
//! Everything here is Linux-first by design; the server's trigger-mode
//! matrix (LT/ET per listen and connection fd, EPOLLONESHOT on
//! connections) is expressed directly against the epoll interface.

mod notify;
mod poller;
mod signals;
mod timer;

pub use notify::Notifier;
pub use poller::{Event, Interest, Poller, TriggerMode};
pub use signals::{SignalBridge, SignalFlags};
pub use timer::{TimerKey, TimerList};

use std::io;
use std::os::unix::io::RawFd;

/// Switch `fd` to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
