//! MySQL connection pool and the in-memory users table.
//!
//! The pool opens every session up front and hands them out with
//! blocking-borrow semantics: a worker that cannot get a session waits on
//! the pool's condvar until one is released or the pool is destroyed.
//! [`SqlSession`] is the RAII guard; dropping it returns the session and
//! signals one waiter, so no exit path of the CGI handler can leak one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};
use tracing::{error, info, warn};

/// Database endpoint settings, resolved by the config layer.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Fixed-size pool of live MySQL sessions.
pub struct SqlPool {
    free: Mutex<VecDeque<Conn>>,
    cond: Condvar,
    destroyed: AtomicBool,
    free_count: AtomicUsize,
    in_use_count: AtomicUsize,
    capacity: usize,
}

impl SqlPool {
    /// Open exactly `capacity` sessions. Any connect failure is returned
    /// and treated as fatal by the caller.
    pub fn connect(cfg: &DbConfig, capacity: usize) -> Result<Self, mysql::Error> {
        let opts: Opts = OptsBuilder::new()
            .ip_or_hostname(Some(cfg.host.clone()))
            .tcp_port(cfg.port)
            .user(Some(cfg.user.clone()))
            .pass(Some(cfg.password.clone()))
            .db_name(Some(cfg.database.clone()))
            .into();

        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(Conn::new(opts.clone())?);
        }

        let pool = Self {
            free_count: AtomicUsize::new(free.len()),
            free: Mutex::new(free),
            cond: Condvar::new(),
            destroyed: AtomicBool::new(false),
            in_use_count: AtomicUsize::new(0),
            capacity,
        };
        info!(
            capacity = pool.capacity(),
            free = pool.free_count(),
            host = %cfg.host,
            db = %cfg.database,
            "SQL pool ready"
        );
        Ok(pool)
    }

    /// Borrow a session, blocking until one is free. Returns `None` once
    /// the pool has been destroyed.
    pub fn borrow(&self) -> Option<SqlSession<'_>> {
        let mut free = self.lock_free();
        loop {
            if self.destroyed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(conn) = free.pop_front() {
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                self.in_use_count.fetch_add(1, Ordering::Relaxed);
                return Some(SqlSession {
                    conn: Some(conn),
                    pool: self,
                });
            }
            free = self.cond.wait(free).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Tear the pool down: wake every waiter and close every session.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut free = self.lock_free();
        let closed = free.len();
        free.clear();
        self.free_count.store(0, Ordering::Relaxed);
        drop(free);
        self.cond.notify_all();
        info!(closed, still_borrowed = self.in_use_count(), "SQL pool destroyed");
    }

    /// Sessions currently in the free list. Advisory only.
    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Sessions currently borrowed. Advisory only.
    pub fn in_use_count(&self) -> usize {
        self.in_use_count.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pool with no sessions that hands out `None` immediately, standing
    /// in for a live database in tests.
    #[cfg(test)]
    pub(crate) fn stub_for_tests() -> Self {
        Self {
            free: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            destroyed: AtomicBool::new(true),
            free_count: AtomicUsize::new(0),
            in_use_count: AtomicUsize::new(0),
            capacity: 0,
        }
    }

    fn release(&self, conn: Conn) {
        self.in_use_count.fetch_sub(1, Ordering::Relaxed);
        if self.destroyed.load(Ordering::Acquire) {
            // Dropping the session closes it.
            return;
        }
        let mut free = self.lock_free();
        free.push_back(conn);
        self.free_count.fetch_add(1, Ordering::Relaxed);
        drop(free);
        self.cond.notify_one();
    }

    fn lock_free(&self) -> MutexGuard<'_, VecDeque<Conn>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// RAII borrow of one pooled session.
pub struct SqlSession<'p> {
    conn: Option<Conn>,
    pool: &'p SqlPool,
}

impl SqlSession<'_> {
    pub fn conn_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("session already released")
    }
}

impl Drop for SqlSession<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    Duplicate,
    SqlError,
}

/// In-memory mirror of the `user(username, passwd)` table.
///
/// One mutex covers lookups, the INSERT, and the map update, so two
/// concurrent registrations of the same name cannot both succeed.
pub struct UserStore {
    users: Mutex<HashMap<String, String>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the map with the current table contents. Called once at
    /// startup; a failure is reported to the caller, who logs it and
    /// runs with an empty map.
    pub fn load(&self, conn: &mut Conn) -> Result<usize, mysql::Error> {
        let rows: Vec<(String, String)> =
            conn.query("SELECT username,passwd FROM user")?;
        let mut users = self.lock();
        users.clear();
        users.extend(rows);
        Ok(users.len())
    }

    /// True when `name` is a known user with exactly this password.
    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.lock().get(name).is_some_and(|p| p == password)
    }

    /// Register a new user: duplicate check, prepared INSERT on the
    /// borrowed session, then the map update, all under the users mutex.
    /// The map only changes when the INSERT succeeded.
    pub fn register(
        &self,
        conn: Option<&mut Conn>,
        name: &str,
        password: &str,
    ) -> RegisterOutcome {
        let mut users = self.lock();
        if users.contains_key(name) {
            return RegisterOutcome::Duplicate;
        }
        let Some(conn) = conn else {
            warn!(name, "registration without a SQL session");
            return RegisterOutcome::SqlError;
        };
        match conn.exec_drop(
            "INSERT INTO user(username, passwd) VALUES(?, ?)",
            (name, password),
        ) {
            Ok(()) => {
                users.insert(name.to_string(), password.to_string());
                RegisterOutcome::Registered
            }
            Err(e) => {
                error!(name, error = %e, "INSERT into user table failed");
                RegisterOutcome::SqlError
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a user straight into the map, bypassing SQL. Test fixtures
    /// stand in for the startup table load.
    #[cfg(test)]
    pub(crate) fn seed_for_tests(&self, name: &str, password: &str) {
        self.lock().insert(name.to_string(), password.to_string());
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> UserStore {
        let store = UserStore::new();
        store
            .lock()
            .insert("alice".to_string(), "secret".to_string());
        store
    }

    #[test]
    fn test_verify_matches_exact_password() {
        let store = seeded_store();
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("bob", "secret"));
    }

    #[test]
    fn test_register_duplicate_without_session() {
        let store = seeded_store();
        // The duplicate check fires before the session is touched.
        assert_eq!(
            store.register(None, "alice", "other"),
            RegisterOutcome::Duplicate
        );
        assert!(store.verify("alice", "secret"));
    }

    #[test]
    fn test_register_new_without_session_is_sql_error() {
        let store = seeded_store();
        assert_eq!(
            store.register(None, "bob", "pw"),
            RegisterOutcome::SqlError
        );
        // A failed registration must not touch the map.
        assert!(!store.verify("bob", "pw"));
        assert!(store.verify("alice", "secret"));
    }
}
