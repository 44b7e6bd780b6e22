//! The reactor: accept loop, event dispatch, timers, shutdown.
//!
//! One thread owns the epoll set, the connection slot table, and the
//! timer list. Connection fds are registered one-shot and rearmed by
//! whichever side finishes handling an event, so at most one task per
//! connection is ever in flight. Workers report slots that must die over
//! the completion channel; the eventfd folds those reports into the same
//! `wait` the reactor already blocks in.
//!
//! SIGALRM drives the idle sweep: every tick closes connections whose
//! last successful I/O is more than `3 * TICK_SECS` in the past. SIGTERM
//! flips the stop flag, which is only observed between dispatch passes.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::http::HttpConn;
use crate::runtime::{Event, Notifier, Poller, SignalBridge, TimerKey, TimerList, TriggerMode};
use crate::workers::{ActorModel, ConnId, WorkOp, WorkerPool};

/// Upper bound on simultaneous connections (and on fd numbers the slot
/// table will ever see).
pub const MAX_FD: usize = 65536;
/// Events decoded per `wait` call.
const MAX_EVENTS: usize = 10000;
/// Timer tick period in seconds; idle connections die after three ticks.
pub const TICK_SECS: u32 = 5;

const LISTENER_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const NOTIFY_TOKEN: u64 = u64::MAX - 2;

/// Sent to a client accepted over the connection limit.
const BUSY_REPLY: &[u8] = b"Internal server busy";

struct ConnEntry {
    conn: Arc<Mutex<HttpConn>>,
    fd: RawFd,
    /// Distinguishes this occupant from earlier users of the same slab
    /// key; stale completions are dropped on mismatch.
    gen: u64,
    timer: Option<TimerKey>,
}

pub struct Server {
    config: Config,
    poller: Arc<Poller>,
    listener: TcpListener,
    bridge: SignalBridge,
    notifier: Arc<Notifier>,
    completions: Receiver<ConnId>,
    pool: WorkerPool,
    conns: Slab<ConnEntry>,
    timers: TimerList,
    doc_root: Arc<PathBuf>,
    user_count: usize,
    next_gen: u64,
}

impl Server {
    /// Bind, set up the epoll set, install the signal bridge, and arm the
    /// first tick. Every failure here is fatal to startup.
    pub fn new(
        config: Config,
        pool: WorkerPool,
        notifier: Arc<Notifier>,
        completions: Receiver<ConnId>,
    ) -> io::Result<Self> {
        let doc_root = Arc::new(std::env::current_dir()?.join("root"));
        let listener = build_listener(config.port, config.opt_linger)?;
        let poller = Arc::new(Poller::new()?);
        poller.add(
            listener.as_raw_fd(),
            LISTENER_TOKEN,
            config.listen_trigger,
            false,
        )?;

        let bridge = SignalBridge::install()?;
        poller.add(bridge.read_fd(), SIGNAL_TOKEN, TriggerMode::Level, false)?;
        poller.add(notifier.raw_fd(), NOTIFY_TOKEN, TriggerMode::Level, false)?;
        bridge.arm(TICK_SECS);

        info!(
            addr = %listener.local_addr()?,
            doc_root = %doc_root.display(),
            listen_trigger = ?config.listen_trigger,
            conn_trigger = ?config.conn_trigger,
            actor_model = ?pool.model(),
            "listening"
        );

        Ok(Self {
            config,
            poller,
            listener,
            bridge,
            notifier,
            completions,
            pool,
            conns: Slab::new(),
            timers: TimerList::new(),
            doc_root,
            user_count: 0,
            next_gen: 0,
        })
    }

    /// Run the event loop until SIGTERM (or an unrecoverable `wait`
    /// failure, which is logged).
    pub fn run(&mut self) {
        let mut events: Vec<Event> = Vec::with_capacity(MAX_EVENTS);
        let mut timeout = false;
        let mut stop = false;

        while !stop {
            match self.poller.wait(&mut events, -1) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    break;
                }
            }

            for i in 0..events.len() {
                let event = events[i];
                match event.token {
                    LISTENER_TOKEN => self.accept_clients(),
                    SIGNAL_TOKEN => {
                        if event.readable {
                            let flags = self.bridge.drain();
                            timeout |= flags.timeout;
                            stop |= flags.stop;
                        }
                    }
                    NOTIFY_TOKEN => {
                        if event.readable {
                            self.drain_completions();
                        }
                    }
                    token => {
                        let key = token as usize;
                        if event.closed {
                            // Peer hung up or the fd failed.
                            self.close_connection(key);
                        } else if event.readable {
                            self.handle_read(key);
                        } else if event.writable {
                            self.handle_write(key);
                        }
                    }
                }
            }

            if timeout {
                self.sweep_timers(Instant::now());
                timeout = false;
            }
        }
        info!(live = self.user_count(), "event loop stopped");
    }

    // ---- accept ------------------------------------------------------

    /// Accept pending connections: one per event in level-triggered
    /// mode, the whole backlog in edge-triggered mode.
    fn accept_clients(&mut self) {
        let edge = self.config.listen_trigger == TriggerMode::Edge;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_client(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            }
            if !edge {
                return;
            }
        }
    }

    fn register_client(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.user_count >= MAX_FD {
            warn!(%peer, "connection limit reached");
            let _ = stream.write_all(BUSY_REPLY);
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            error!(%peer, error = %e, "failed to prepare client socket");
            return;
        }

        let fd = stream.as_raw_fd();
        self.next_gen += 1;
        let gen = self.next_gen;

        let entry = self.conns.vacant_entry();
        let key = entry.key();
        let conn = HttpConn::new(
            stream,
            peer,
            Arc::clone(&self.doc_root),
            self.config.conn_trigger,
            key as u64,
            Arc::clone(&self.poller),
        );
        entry.insert(ConnEntry {
            conn: Arc::new(Mutex::new(conn)),
            fd,
            gen,
            timer: None,
        });

        if let Err(e) = self
            .poller
            .add(fd, key as u64, self.config.conn_trigger, true)
        {
            error!(fd, error = %e, "failed to register connection");
            self.conns.remove(key);
            return;
        }

        let deadline = Instant::now() + idle_window();
        self.conns[key].timer = Some(self.timers.add(deadline, key));
        self.user_count += 1;
        debug!(fd, %peer, token = key, live = self.user_count, "accepted connection");
    }

    // ---- event dispatch ----------------------------------------------

    /// Push a slot's idle deadline out after successful activity.
    fn adjust_timer(&mut self, key: usize) {
        if let Some(timer) = self.conns.get(key).and_then(|e| e.timer) {
            self.timers.adjust(timer, Instant::now() + idle_window());
            debug!(token = key, "adjust timer once");
        }
    }

    fn handle_read(&mut self, key: usize) {
        let Some(entry) = self.conns.get(key) else {
            return;
        };
        let id = ConnId {
            token: key,
            gen: entry.gen,
        };
        let conn = Arc::clone(&entry.conn);

        match self.pool.model() {
            ActorModel::Reactor => {
                self.adjust_timer(key);
                if !self.pool.append(conn, id, WorkOp::Read) {
                    warn!(token = key, "work queue full, closing connection");
                    self.close_connection(key);
                }
            }
            ActorModel::Proactor => {
                let read_ok = {
                    let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                    let ok = conn.read_once();
                    if ok {
                        debug!(peer = %conn.peer(), "client data read");
                    }
                    ok
                };
                if !read_ok {
                    self.close_connection(key);
                } else if !self.pool.append_proactor(conn, id) {
                    warn!(token = key, "work queue full, closing connection");
                    self.close_connection(key);
                } else {
                    self.adjust_timer(key);
                }
            }
        }
    }

    fn handle_write(&mut self, key: usize) {
        let Some(entry) = self.conns.get(key) else {
            return;
        };
        let id = ConnId {
            token: key,
            gen: entry.gen,
        };
        let conn = Arc::clone(&entry.conn);

        match self.pool.model() {
            ActorModel::Reactor => {
                self.adjust_timer(key);
                if !self.pool.append(conn, id, WorkOp::Write) {
                    warn!(token = key, "work queue full, closing connection");
                    self.close_connection(key);
                }
            }
            ActorModel::Proactor => {
                let write_ok = {
                    let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                    let ok = conn.write();
                    if ok {
                        debug!(peer = %conn.peer(), "response data sent");
                    }
                    ok
                };
                if write_ok {
                    self.adjust_timer(key);
                } else {
                    self.close_connection(key);
                }
            }
        }
    }

    /// Close slots the workers reported as dead, skipping reports whose
    /// generation no longer matches the slot occupant.
    fn drain_completions(&mut self) {
        self.notifier.drain();
        while let Ok(id) = self.completions.try_recv() {
            let live = self
                .conns
                .get(id.token)
                .is_some_and(|entry| entry.gen == id.gen);
            if live {
                self.close_connection(id.token);
            }
        }
    }

    // ---- timers and teardown -----------------------------------------

    /// Run the idle sweep and re-arm the alarm.
    fn sweep_timers(&mut self, now: Instant) {
        let mut expired = Vec::new();
        self.timers.tick(now, |slot| expired.push(slot));
        for key in expired {
            if let Some(entry) = self.conns.get_mut(key) {
                // The node is already gone; don't cancel it again.
                entry.timer = None;
            }
            self.close_connection(key);
        }
        self.bridge.arm(TICK_SECS);
        debug!(live = self.user_count, "timer tick");
    }

    /// Remove a slot: deregister the fd, close the socket, release the
    /// mmap, drop the timer, and free the slab entry.
    fn close_connection(&mut self, key: usize) {
        let Some(mut entry) = self.conns.try_remove(key) else {
            return;
        };
        if let Some(timer) = entry.timer.take() {
            self.timers.cancel(timer);
        }
        let mut conn = entry.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = conn.take_stream() {
            let _ = self.poller.delete(entry.fd);
            drop(stream);
            self.user_count = self.user_count.saturating_sub(1);
            debug!(fd = entry.fd, live = self.user_count, "closed connection");
        }
    }

    /// Live connection count (reactor-thread view).
    pub fn user_count(&self) -> usize {
        self.user_count
    }
}

/// Next idle deadline distance: three tick periods.
fn idle_window() -> Duration {
    Duration::from_secs(3 * TICK_SECS as u64)
}

/// Build the listen socket: optional SO_LINGER, SO_REUSEADDR, bind to
/// 0.0.0.0, backlog 5, non-blocking.
fn build_listener(port: u16, opt_linger: bool) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    if opt_linger {
        socket.set_linger(Some(Duration::from_secs(1)))?;
    } else {
        socket.set_linger(None)?;
    }
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
