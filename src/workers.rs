//! Work queue and worker pool.
//!
//! The reactor hands connections off through a bounded [`BlockQueue`];
//! `n_threads` workers pop one item at a time. In Reactor shape the
//! worker performs the socket I/O itself (`Read`/`Write` items); in
//! Proactor shape the reactor has already read and the worker only parses
//! and stages the response (`Process` items). Either way a worker that
//! needs the connection closed cannot touch the reactor's slot table, so
//! it posts the slot id on the completion channel and bumps the eventfd.
//!
//! A full queue rejects the hand-off and the reactor closes the slot:
//! back-pressure instead of an unbounded backlog.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::db::{SqlPool, UserStore};
use crate::http::HttpConn;
use crate::queue::BlockQueue;
use crate::runtime::Notifier;

/// Default bound on queued hand-offs before the reactor starts shedding
/// connections.
pub const MAX_PENDING_REQUESTS: usize = 10000;

/// Dispatch shape. Proactor: the reactor does the I/O and workers parse.
/// Reactor: workers do both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorModel {
    Proactor,
    Reactor,
}

/// Identity of one live connection slot. Slab tokens are recycled, so the
/// generation disambiguates a slot from its successors; a completion that
/// no longer matches is dropped by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    pub token: usize,
    pub gen: u64,
}

/// What the worker should do with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOp {
    /// Reactor shape: read, then parse and stage the response.
    Read,
    /// Reactor shape: drain the staged response.
    Write,
    /// Proactor shape: the read already happened on the reactor thread.
    Process,
}

struct WorkItem {
    conn: Arc<Mutex<HttpConn>>,
    id: ConnId,
    op: WorkOp,
}

/// Worker-side handle for reporting slots that must be closed.
#[derive(Clone)]
pub struct CompletionSender {
    tx: Sender<ConnId>,
    notifier: Arc<Notifier>,
}

impl CompletionSender {
    pub fn new(notifier: Arc<Notifier>) -> (Self, Receiver<ConnId>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx, notifier }, rx)
    }

    /// Ask the reactor to close `id`.
    pub fn close(&self, id: ConnId) {
        let _ = self.tx.send(id);
        self.notifier.notify();
    }
}

pub struct WorkerPool {
    queue: Arc<BlockQueue<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    model: ActorModel,
}

impl WorkerPool {
    /// Spawn `n_threads` workers over a queue bounded at `max_pending`.
    pub fn new(
        model: ActorModel,
        sql: Arc<SqlPool>,
        users: Arc<UserStore>,
        completions: CompletionSender,
        n_threads: usize,
        max_pending: usize,
    ) -> io::Result<Self> {
        assert!(n_threads >= 1, "worker pool needs at least one thread");
        let queue = Arc::new(BlockQueue::new(max_pending));
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(n_threads);
        for worker_id in 0..n_threads {
            let queue = Arc::clone(&queue);
            let sql = Arc::clone(&sql);
            let users = Arc::clone(&users);
            let completions = completions.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &queue, &sql, &users, &completions))?;
            handles.push(handle);
        }

        Ok(Self {
            queue,
            handles,
            stop,
            model,
        })
    }

    pub fn model(&self) -> ActorModel {
        self.model
    }

    /// Reactor-shape hand-off. False means the queue is full and the
    /// caller should close the slot.
    pub fn append(&self, conn: Arc<Mutex<HttpConn>>, id: ConnId, op: WorkOp) -> bool {
        debug_assert!(matches!(op, WorkOp::Read | WorkOp::Write));
        self.queue.push(WorkItem { conn, id, op })
    }

    /// Proactor-shape hand-off of a connection whose read has completed.
    pub fn append_proactor(&self, conn: Arc<Mutex<HttpConn>>, id: ConnId) -> bool {
        self.queue.push(WorkItem {
            conn,
            id,
            op: WorkOp::Process,
        })
    }

    /// Stop accepting work, let the workers drain the backlog, and join
    /// them.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    queue: &BlockQueue<WorkItem>,
    sql: &SqlPool,
    users: &UserStore,
    completions: &CompletionSender,
) {
    debug!(worker = worker_id, "worker started");
    while let Some(item) = queue.pop() {
        let id = item.id;
        match catch_unwind(AssertUnwindSafe(|| handle_item(item, sql, users))) {
            Ok(true) => {}
            Ok(false) => completions.close(id),
            Err(_) => {
                // A poisoned task must not take the worker down; the idle
                // timer will reap the connection.
                error!(worker = worker_id, token = id.token, "worker task panicked");
            }
        }
    }
    debug!(worker = worker_id, "worker stopped");
}

/// Run one task. Returns false when the connection must be closed.
fn handle_item(item: WorkItem, sql: &SqlPool, users: &UserStore) -> bool {
    let mut conn = item.conn.lock().unwrap_or_else(|e| e.into_inner());
    match item.op {
        WorkOp::Read => {
            if conn.read_once() {
                let mut session = sql.borrow();
                conn.process(session.as_mut().map(|s| s.conn_mut()), users)
            } else {
                false
            }
        }
        WorkOp::Write => conn.write(),
        WorkOp::Process => {
            let mut session = sql.borrow();
            conn.process(session.as_mut().map(|s| s.conn_mut()), users)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Poller, TriggerMode};
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;
    use std::time::Duration;
    use temp_dir::TempDir;

    struct Fixture {
        conn: Arc<Mutex<HttpConn>>,
        client: TcpStream,
        _listener: TcpListener,
        _root: TempDir,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let root = TempDir::new().unwrap();
        for (name, contents) in files {
            std::fs::write(root.path().join(name), contents).unwrap();
        }
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let conn = HttpConn::new(
            server_side,
            peer,
            Arc::new(PathBuf::from(root.path())),
            TriggerMode::Level,
            0,
            Arc::new(Poller::new().unwrap()),
        );
        Fixture {
            conn: Arc::new(Mutex::new(conn)),
            client,
            _listener: listener,
            _root: root,
        }
    }

    fn test_pool(model: ActorModel) -> (WorkerPool, Receiver<ConnId>) {
        let notifier = Arc::new(Notifier::new().unwrap());
        let (completions, rx) = CompletionSender::new(notifier);
        let pool = WorkerPool::new(
            model,
            Arc::new(SqlPool::stub_for_tests()),
            Arc::new(UserStore::new()),
            completions,
            1,
            16,
        )
        .unwrap();
        (pool, rx)
    }

    #[test]
    fn test_reactor_read_then_write_serves_file() {
        let mut fx = fixture(&[("sample.html", "0123456789")]);
        let (mut pool, rx) = test_pool(ActorModel::Reactor);
        let id = ConnId { token: 3, gen: 1 };

        fx.client
            .write_all(b"GET /sample.html HTTP/1.1\r\nHost:x\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert!(pool.append(Arc::clone(&fx.conn), id, WorkOp::Read));
        std::thread::sleep(Duration::from_millis(50));
        assert!(pool.append(Arc::clone(&fx.conn), id, WorkOp::Write));

        // Close-after-send: the worker reports the slot for closing.
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), id);

        let mut response = Vec::new();
        fx.client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 512];
        loop {
            match fx.client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
            if response.ends_with(b"0123456789") {
                break;
            }
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got {text:?}");
        assert!(text.ends_with("0123456789"));

        pool.shutdown();
    }

    #[test]
    fn test_reactor_read_failure_posts_completion() {
        let fx = fixture(&[]);
        let (mut pool, rx) = test_pool(ActorModel::Reactor);
        let id = ConnId { token: 9, gen: 4 };

        // Peer is gone: read_once sees EOF and the task reports a close.
        drop(fx.client);
        std::thread::sleep(Duration::from_millis(30));
        assert!(pool.append(Arc::clone(&fx.conn), id, WorkOp::Read));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), id);

        pool.shutdown();
    }

    #[test]
    fn test_proactor_process_stages_response() {
        let mut fx = fixture(&[]);
        let (mut pool, rx) = test_pool(ActorModel::Proactor);
        assert_eq!(pool.model(), ActorModel::Proactor);
        let id = ConnId { token: 1, gen: 1 };

        fx.client
            .write_all(b"GET /nope HTTP/1.1\r\nHost:x\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));

        // Proactor: the reactor already read; the worker only parses.
        assert!(fx.conn.lock().unwrap().read_once());
        assert!(pool.append_proactor(Arc::clone(&fx.conn), id));
        std::thread::sleep(Duration::from_millis(50));
        // Parsing a complete request stages a response without closing.
        assert!(rx.try_recv().is_err());

        assert!(!fx.conn.lock().unwrap().write());
        let mut buf = [0u8; 512];
        fx.client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let n = fx.client.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "got {text:?}");

        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_backlog() {
        let fx = fixture(&[]);
        let (mut pool, _rx) = test_pool(ActorModel::Reactor);
        for _ in 0..4 {
            assert!(pool.append(
                Arc::clone(&fx.conn),
                ConnId { token: 0, gen: 0 },
                WorkOp::Write
            ));
        }
        pool.shutdown();
        // Idempotent.
        pool.shutdown();
    }
}
