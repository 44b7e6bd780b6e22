//! Thin epoll wrapper.
//!
//! The reactor needs the full readiness matrix: level- or edge-triggered
//! per fd, EPOLLONESHOT on connection fds, EPOLLRDHUP everywhere. Those
//! knobs are expressed directly against the epoll syscalls; the rest of
//! the crate only sees [`Poller`] and decoded [`Event`]s.
//!
//! `add`/`rearm`/`delete` are `&self` and safe to call from worker
//! threads while the reactor blocks in `wait` (epoll_ctl is thread-safe).

use std::io;
use std::os::unix::io::RawFd;

/// Readiness notification style for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Notify repeatedly while the condition holds.
    Level,
    /// Notify once per state transition; the consumer must drain.
    Edge,
}

/// Direction a one-shot registration is rearmed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// One decoded readiness event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// EPOLLRDHUP | EPOLLHUP | EPOLLERR: peer is gone or the fd failed.
    pub closed: bool,
}

pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Register `fd` for readable notification. Connection fds pass
    /// `oneshot = true`; the listen fd and the signal/notify fds stay
    /// permanently armed.
    pub fn add(&self, fd: RawFd, token: u64, mode: TriggerMode, oneshot: bool) -> io::Result<()> {
        let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if mode == TriggerMode::Edge {
            events |= libc::EPOLLET as u32;
        }
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    /// Rearm a one-shot connection fd for the next read or write event.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest, mode: TriggerMode) -> io::Result<()> {
        let mut events = match interest {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        };
        events |= (libc::EPOLLRDHUP | libc::EPOLLONESHOT) as u32;
        if mode == TriggerMode::Edge {
            events |= libc::EPOLLET as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Remove `fd` from the interest set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Block until at least one fd is ready and decode up to
    /// `events.capacity()` events into `events`. A negative `timeout_ms`
    /// blocks indefinitely. `EINTR` surfaces as `ErrorKind::Interrupted`
    /// so the caller can continue its loop.
    pub fn wait(&self, events: &mut Vec<Event>, timeout_ms: i32) -> io::Result<()> {
        events.clear();
        let cap = events.capacity().max(1);
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(cap);
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), cap as libc::c_int, timeout_ms)
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            raw.set_len(n as usize);
        }
        for ev in &raw {
            let bits = ev.events;
            events.push(Event {
                token: ev.u64,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                closed: bits
                    & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
                    != 0,
            });
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_readable_event_with_token() {
        let poller = Poller::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        poller.add(rx.as_raw_fd(), 7, TriggerMode::Level, false).unwrap();

        tx.write_all(b"x").unwrap();
        let mut events = Vec::with_capacity(8);
        poller.wait(&mut events, 1000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);
        assert!(!events[0].closed);
    }

    #[test]
    fn test_oneshot_fires_once_until_rearmed() {
        let poller = Poller::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let fd = rx.as_raw_fd();
        poller.add(fd, 1, TriggerMode::Level, true).unwrap();

        tx.write_all(b"x").unwrap();
        let mut events = Vec::with_capacity(8);
        poller.wait(&mut events, 1000).unwrap();
        assert_eq!(events.len(), 1);

        // Interest is spent: nothing fires even though data is pending.
        poller.wait(&mut events, 50).unwrap();
        assert!(events.is_empty());

        poller.rearm(fd, 1, Interest::Read, TriggerMode::Level).unwrap();
        poller.wait(&mut events, 1000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 1);
    }

    #[test]
    fn test_hangup_reported_as_closed() {
        let poller = Poller::new().unwrap();
        let (tx, rx) = UnixStream::pair().unwrap();
        poller.add(rx.as_raw_fd(), 3, TriggerMode::Level, false).unwrap();
        drop(tx);

        let mut events = Vec::with_capacity(8);
        poller.wait(&mut events, 1000).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].closed);
    }

    #[test]
    fn test_delete_stops_events() {
        let poller = Poller::new().unwrap();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        poller.add(rx.as_raw_fd(), 9, TriggerMode::Level, false).unwrap();
        poller.delete(rx.as_raw_fd()).unwrap();

        tx.write_all(b"x").unwrap();
        let mut events = Vec::with_capacity(8);
        poller.wait(&mut events, 50).unwrap();
        assert!(events.is_empty());
    }
}
