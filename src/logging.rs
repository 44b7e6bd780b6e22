//! Rolling file log sink and its `tracing` wiring.
//!
//! All crate code logs through the `tracing` macros. The subscriber
//! installed by [`install`] formats every event as
//! `YYYY-MM-DD HH:MM:SS.uuuuuu [LEVEL]: <message>` and hands the finished
//! line to a [`LogSink`]: a dated file (`YYYY_MM_DD_<name>`) that rolls
//! over on day change and every `split_lines` lines (same-day rollovers
//! get a `.N` suffix).
//!
//! In async mode one consumer thread drains a bounded queue; a producer
//! facing a full queue drops the line rather than block. An empty string
//! is the consumer's shutdown sentinel.

use std::fmt;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use chrono::{DateTime, Local, NaiveDate};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::queue::BlockQueue;

/// Sink settings, resolved by the config layer.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory the dated files live in; created if missing.
    pub dir: PathBuf,
    /// Base file name, prefixed with the date.
    pub basename: String,
    /// Lines per file before a same-day `.N` rollover. Zero disables
    /// splitting.
    pub split_lines: u64,
    /// Queue capacity; `>= 1` selects async mode with one consumer.
    pub queue_cap: usize,
    /// Swallow every line (logging turned off).
    pub disabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ServerLog"),
            basename: "server.log".to_string(),
            split_lines: 800_000,
            queue_cap: 0,
            disabled: false,
        }
    }
}

struct FileState {
    file: BufWriter<File>,
    today: NaiveDate,
    lines: u64,
}

struct SinkShared {
    dir: PathBuf,
    basename: String,
    split_lines: u64,
    state: Mutex<FileState>,
}

impl SinkShared {
    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one pre-formatted line, rolling the file first if the date
    /// changed or the split threshold was reached.
    fn write_now(&self, line: &str) {
        let mut state = self.lock();
        let today = Local::now().date_naive();
        if state.today != today {
            let _ = state.file.flush();
            if let Ok(file) = open_log_file(&self.dir, &self.basename, today, None) {
                state.file = file;
                state.today = today;
                state.lines = 0;
            }
        } else if self.split_lines > 0 && state.lines > 0 && state.lines % self.split_lines == 0 {
            let _ = state.file.flush();
            let n = state.lines / self.split_lines;
            if let Ok(file) = open_log_file(&self.dir, &self.basename, today, Some(n)) {
                state.file = file;
            }
        }
        let _ = state.file.write_all(line.as_bytes());
        state.lines += 1;
    }

    fn flush(&self) {
        let _ = self.lock().file.flush();
    }
}

fn dated_name(basename: &str, date: NaiveDate, suffix: Option<u64>) -> String {
    use chrono::Datelike;
    let mut name = format!(
        "{}_{:02}_{:02}_{}",
        date.year(),
        date.month(),
        date.day(),
        basename
    );
    if let Some(n) = suffix {
        name.push_str(&format!(".{n}"));
    }
    name
}

fn open_log_file(
    dir: &Path,
    basename: &str,
    date: NaiveDate,
    suffix: Option<u64>,
) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(dated_name(basename, date, suffix)))?;
    Ok(BufWriter::new(file))
}

/// Timestamped, level-tagged line sink with day and size rollover.
pub struct LogSink {
    shared: Arc<SinkShared>,
    queue: Option<Arc<BlockQueue<String>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    disabled: bool,
}

impl LogSink {
    /// Open today's log file (creating the directory if needed) and, in
    /// async mode, spawn the consumer thread.
    pub fn init(cfg: &LogConfig) -> io::Result<Self> {
        std::fs::create_dir_all(&cfg.dir)?;
        let today = Local::now().date_naive();
        let file = open_log_file(&cfg.dir, &cfg.basename, today, None)?;
        let shared = Arc::new(SinkShared {
            dir: cfg.dir.clone(),
            basename: cfg.basename.clone(),
            split_lines: cfg.split_lines,
            state: Mutex::new(FileState {
                file,
                today,
                lines: 0,
            }),
        });

        let (queue, consumer) = if cfg.queue_cap >= 1 {
            let queue = Arc::new(BlockQueue::<String>::new(cfg.queue_cap));
            let consumer = {
                let queue = Arc::clone(&queue);
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name("log-writer".to_string())
                    .spawn(move || {
                        while let Some(line) = queue.pop() {
                            if line.is_empty() {
                                break;
                            }
                            shared.write_now(&line);
                        }
                        shared.flush();
                    })?
            };
            (Some(queue), Some(consumer))
        } else {
            (None, None)
        };

        Ok(Self {
            shared,
            queue,
            consumer: Mutex::new(consumer),
            disabled: cfg.disabled,
        })
    }

    /// Record one finished line. Async mode enqueues and drops the line
    /// when the queue is full; sync mode writes inline under the sink
    /// mutex.
    pub fn write_line(&self, line: &str) {
        if self.disabled || line.is_empty() {
            return;
        }
        match &self.queue {
            Some(queue) => {
                let _ = queue.push(line.to_string());
            }
            None => self.shared.write_now(line),
        }
    }

    /// Flush buffered bytes to the file (no fsync).
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Stop the consumer (sentinel + join) and flush.
    pub fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            if !queue.push(String::new()) {
                // Queue full: closing still wakes and stops the consumer.
                queue.close();
            }
            if let Some(handle) = self.lock_consumer().take() {
                let _ = handle.join();
            }
        }
        self.flush();
    }

    fn lock_consumer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `YYYY-MM-DD HH:MM:SS.uuuuuu [LEVEL]: ` prefix for one event.
fn line_prefix(now: DateTime<Local>, level: &tracing::Level) -> String {
    format!("{} [{}]: ", now.format("%Y-%m-%d %H:%M:%S%.6f"), level)
}

/// Event formatter producing the sink's line layout.
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        writer.write_str(&line_prefix(Local::now(), event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// `io::Write` adapter handed to the fmt layer: buffers one event and
/// pushes the finished line into the sink when dropped.
struct LineWriter {
    sink: Arc<LogSink>,
    buf: Vec<u8>,
}

impl io::Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.sink.write_line(&String::from_utf8_lossy(&self.buf));
        }
    }
}

/// Install the global subscriber: env-filterable level, the sink's line
/// format, the sink as writer. `RUST_LOG` wins over `default_filter`.
pub fn install(sink: Arc<LogSink>, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(LineFormat)
        .with_writer(move || LineWriter {
            sink: Arc::clone(&sink),
            buf: Vec::with_capacity(256),
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_dir::TempDir;

    fn test_cfg(dir: &TempDir, queue_cap: usize, split_lines: u64) -> LogConfig {
        LogConfig {
            dir: dir.path().to_path_buf(),
            basename: "test.log".to_string(),
            split_lines,
            queue_cap,
            disabled: false,
        }
    }

    fn today_name(suffix: Option<u64>) -> String {
        dated_name("test.log", Local::now().date_naive(), suffix)
    }

    #[test]
    fn test_dated_name_format() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();
        assert_eq!(dated_name("server.log", date, None), "2026_03_07_server.log");
        assert_eq!(
            dated_name("server.log", date, Some(2)),
            "2026_03_07_server.log.2"
        );
    }

    #[test]
    fn test_line_prefix_layout() {
        let now = Local::now();
        let prefix = line_prefix(now, &tracing::Level::WARN);
        assert!(prefix.ends_with("[WARN]: "), "got {prefix:?}");
        // Fixed-width microsecond timestamp before the level tag.
        let ts = prefix.split(" [").next().unwrap();
        assert_eq!(ts.len(), "2026-01-01 00:00:00.000000".len());
    }

    #[test]
    fn test_sync_write_creates_dated_file() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::init(&test_cfg(&dir, 0, 0)).unwrap();
        sink.write_line("hello\n");
        sink.flush();

        let contents = std::fs::read_to_string(dir.path().join(today_name(None))).unwrap();
        assert_eq!(contents, "hello\n");
    }

    #[test]
    fn test_split_lines_rollover_suffix() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::init(&test_cfg(&dir, 0, 2)).unwrap();
        for i in 0..5 {
            sink.write_line(&format!("line{i}\n"));
        }
        sink.flush();
        // Rolled files keep their own buffered writers; reopen to check.
        drop(sink);

        let base = std::fs::read_to_string(dir.path().join(today_name(None))).unwrap();
        assert_eq!(base, "line0\nline1\n");
        let first = std::fs::read_to_string(dir.path().join(today_name(Some(1)))).unwrap();
        assert_eq!(first, "line2\nline3\n");
        assert!(dir.path().join(today_name(Some(2))).exists());
    }

    #[test]
    fn test_async_shutdown_drains_queue() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::init(&test_cfg(&dir, 64, 0)).unwrap();
        for i in 0..10 {
            sink.write_line(&format!("async{i}\n"));
        }
        sink.shutdown();

        let contents = std::fs::read_to_string(dir.path().join(today_name(None))).unwrap();
        for i in 0..10 {
            assert!(contents.contains(&format!("async{i}")));
        }
    }

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_cfg(&dir, 0, 0);
        cfg.disabled = true;
        let sink = LogSink::init(&cfg).unwrap();
        sink.write_line("dropped\n");
        sink.flush();

        let contents = std::fs::read_to_string(dir.path().join(today_name(None))).unwrap();
        assert!(contents.is_empty());
    }
}
