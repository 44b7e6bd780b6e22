//! shoal: a small high-concurrency HTTP/1.1 server.
//!
//! One reactor thread multiplexes tens of thousands of connections over
//! epoll (level- or edge-triggered per fd, one-shot on connections), a
//! pool of worker threads parses requests and serves static files via
//! mmap + vectored writes, and a tiny login/registration path talks to
//! MySQL through a blocking-borrow connection pool. SIGALRM sweeps idle
//! connections; SIGTERM stops the server.

mod config;
mod db;
mod http;
mod logging;
mod queue;
mod runtime;
mod server;
mod workers;

use std::sync::Arc;

use tracing::{error, info};

use config::Config;
use db::{SqlPool, UserStore};
use logging::LogSink;
use runtime::Notifier;
use server::Server;
use workers::{CompletionSender, WorkerPool, MAX_PENDING_REQUESTS};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    // Logging first, so every later init failure is recorded.
    let sink = if config.log_enabled {
        let sink = Arc::new(LogSink::init(&config.log_config())?);
        logging::install(Arc::clone(&sink), "info");
        Some(sink)
    } else {
        None
    };

    info!(
        port = config.port,
        threads = config.threads,
        sql_conns = config.sql_conns,
        actor_model = ?config.actor_model,
        log_async = config.log_async,
        "starting shoal"
    );

    // The pool opens every session up front; failure aborts startup.
    let sql = Arc::new(SqlPool::connect(&config.db, config.sql_conns)?);

    let users = Arc::new(UserStore::new());
    if let Some(mut session) = sql.borrow() {
        match users.load(session.conn_mut()) {
            Ok(count) => info!(users = count, "user table loaded"),
            Err(e) => error!(error = %e, "failed to load user table"),
        }
    }

    let notifier = Arc::new(Notifier::new()?);
    let (completions, completion_rx) = CompletionSender::new(Arc::clone(&notifier));
    let pool = WorkerPool::new(
        config.actor_model,
        Arc::clone(&sql),
        Arc::clone(&users),
        completions,
        config.threads,
        MAX_PENDING_REQUESTS,
    )?;

    let mut server = Server::new(config, pool, notifier, completion_rx)?;
    server.run();

    // Orderly teardown: join the workers, close the SQL sessions, drain
    // the log queue.
    drop(server);
    sql.destroy();
    if let Some(sink) = sink {
        sink.shutdown();
    }
    Ok(())
}
