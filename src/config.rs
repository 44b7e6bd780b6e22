//! Configuration: command-line flags and an optional `KEY=VALUE` file.
//!
//! The file is line-oriented: `#` starts a comment, surrounding
//! whitespace is trimmed, unknown keys are reported, and a value that is
//! not an integer is skipped. Command-line flags take precedence over
//! file values when both are given.

use std::fmt;
use std::path::PathBuf;

use clap::Parser;

use crate::db::DbConfig;
use crate::logging::LogConfig;
use crate::runtime::TriggerMode;
use crate::workers::ActorModel;

/// Command-line arguments. Every option defaults to "unset" so file
/// values shine through; the resolved defaults live in [`Config`].
#[derive(Parser, Debug, Default)]
#[command(name = "shoal")]
#[command(about = "A small high-concurrency HTTP/1.1 server", long_about = None)]
#[command(version)]
pub struct CliArgs {
    /// Listen port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Log write mode: 0 = synchronous, 1 = asynchronous
    #[arg(short = 'l', long = "log-write")]
    log_write: Option<i64>,

    /// Trigger combo: 0=LT+LT, 1=LT+ET, 2=ET+LT, 3=ET+ET (listen, conn)
    #[arg(short = 'm', long = "trig-mode")]
    trig_mode: Option<i64>,

    /// SO_LINGER on the listen socket: 0 = off, 1 = on
    #[arg(short = 'o', long = "opt-linger")]
    opt_linger: Option<i64>,

    /// SQL connection pool size
    #[arg(short = 's', long = "sql-num")]
    sql_num: Option<i64>,

    /// Worker thread count
    #[arg(short = 't', long = "thread-num")]
    thread_num: Option<i64>,

    /// Disable logging: 0 = enabled, 1 = disabled
    #[arg(short = 'c', long = "close-log")]
    close_log: Option<i64>,

    /// Concurrency shape: 0 = Proactor, 1 = Reactor
    #[arg(short = 'a', long = "actor-model")]
    actor_model: Option<i64>,

    /// KEY=VALUE configuration file; flags override its values
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Database host
    #[arg(long = "db-host")]
    db_host: Option<String>,

    /// Database port
    #[arg(long = "db-port")]
    db_port: Option<u16>,

    /// Database user
    #[arg(long = "db-user")]
    db_user: Option<String>,

    /// Database password
    #[arg(long = "db-password")]
    db_password: Option<String>,

    /// Database name
    #[arg(long = "db-name")]
    db_name: Option<String>,
}

/// Values read from the configuration file, before merging.
#[derive(Debug, Default)]
struct FileValues {
    port: Option<i64>,
    log_write: Option<i64>,
    trig_mode: Option<i64>,
    listen_trig_mode: Option<i64>,
    conn_trig_mode: Option<i64>,
    opt_linger: Option<i64>,
    sql_num: Option<i64>,
    thread_num: Option<i64>,
    close_log: Option<i64>,
    actor_model: Option<i64>,
    db_host: Option<String>,
    db_port: Option<i64>,
    db_user: Option<String>,
    db_password: Option<String>,
    db_name: Option<String>,
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_async: bool,
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    pub opt_linger: bool,
    pub sql_conns: usize,
    pub threads: usize,
    pub log_enabled: bool,
    pub actor_model: ActorModel,
    pub db: DbConfig,
}

impl Config {
    /// Parse the command line (and the file it may point at) into a
    /// validated configuration. Help and version exit here.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = match CliArgs::try_parse() {
            Ok(cli) => cli,
            Err(e) if e.use_stderr() => {
                let _ = e.print();
                std::process::exit(1);
            }
            Err(e) => {
                let _ = e.print();
                std::process::exit(0);
            }
        };
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
                parse_file_values(&text)
            }
            None => FileValues::default(),
        };
        resolve(cli, file)
    }

    /// Sink settings implied by the log flags.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            queue_cap: if self.log_async { 800 } else { 0 },
            disabled: !self.log_enabled,
            ..LogConfig::default()
        }
    }
}

/// Expand a trigger combo value into (listen, connection) modes.
fn trigger_combo(combo: i64) -> Option<(TriggerMode, TriggerMode)> {
    match combo {
        0 => Some((TriggerMode::Level, TriggerMode::Level)),
        1 => Some((TriggerMode::Level, TriggerMode::Edge)),
        2 => Some((TriggerMode::Edge, TriggerMode::Level)),
        3 => Some((TriggerMode::Edge, TriggerMode::Edge)),
        _ => None,
    }
}

fn single_trigger(value: i64) -> Option<TriggerMode> {
    match value {
        0 => Some(TriggerMode::Level),
        1 => Some(TriggerMode::Edge),
        _ => None,
    }
}

fn as_flag(key: &'static str, value: i64) -> Result<bool, ConfigError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

fn resolve(cli: CliArgs, file: FileValues) -> Result<Config, ConfigError> {
    // Trigger modes: the combo sets both halves, explicit file keys
    // override their half, and `-m` on the command line overrides both.
    let combo = file.trig_mode.unwrap_or(0);
    let (mut listen_trigger, mut conn_trigger) =
        trigger_combo(combo).ok_or(ConfigError::InvalidValue {
            key: "TRIGMode",
            value: combo,
        })?;
    if let Some(v) = file.listen_trig_mode {
        listen_trigger = single_trigger(v).ok_or(ConfigError::InvalidValue {
            key: "LISTENTrigmode",
            value: v,
        })?;
    }
    if let Some(v) = file.conn_trig_mode {
        conn_trigger = single_trigger(v).ok_or(ConfigError::InvalidValue {
            key: "CONNTrigmode",
            value: v,
        })?;
    }
    if let Some(v) = cli.trig_mode {
        (listen_trigger, conn_trigger) = trigger_combo(v).ok_or(ConfigError::InvalidValue {
            key: "TRIGMode",
            value: v,
        })?;
    }

    let port = match cli.port {
        Some(p) => p,
        None => {
            let p = file.port.unwrap_or(9006);
            u16::try_from(p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or(ConfigError::InvalidValue {
                    key: "PORT",
                    value: p,
                })?
        }
    };

    let log_write = cli.log_write.or(file.log_write).unwrap_or(0);
    let opt_linger = cli.opt_linger.or(file.opt_linger).unwrap_or(0);
    let close_log = cli.close_log.or(file.close_log).unwrap_or(0);
    let actor_model = cli.actor_model.or(file.actor_model).unwrap_or(0);

    let sql_conns = cli.sql_num.or(file.sql_num).unwrap_or(8);
    if sql_conns < 1 {
        return Err(ConfigError::InvalidValue {
            key: "sql_num",
            value: sql_conns,
        });
    }
    let threads = cli.thread_num.or(file.thread_num).unwrap_or(8);
    if threads < 1 {
        return Err(ConfigError::InvalidValue {
            key: "thread_num",
            value: threads,
        });
    }

    let db_port = match cli.db_port {
        Some(p) => p,
        None => {
            let p = file.db_port.unwrap_or(3306);
            u16::try_from(p).map_err(|_| ConfigError::InvalidValue {
                key: "db_port",
                value: p,
            })?
        }
    };

    Ok(Config {
        port,
        log_async: as_flag("LOGWrite", log_write)?,
        listen_trigger,
        conn_trigger,
        opt_linger: as_flag("OPT_LINGER", opt_linger)?,
        sql_conns: sql_conns as usize,
        threads: threads as usize,
        log_enabled: !as_flag("close_log", close_log)?,
        actor_model: if as_flag("actor_model", actor_model)? {
            ActorModel::Reactor
        } else {
            ActorModel::Proactor
        },
        db: DbConfig {
            host: cli
                .db_host
                .or(file.db_host)
                .unwrap_or_else(|| "localhost".to_string()),
            port: db_port,
            user: cli
                .db_user
                .or(file.db_user)
                .unwrap_or_else(|| "root".to_string()),
            password: cli
                .db_password
                .or(file.db_password)
                .unwrap_or_else(|| "root".to_string()),
            database: cli
                .db_name
                .or(file.db_name)
                .unwrap_or_else(|| "webdb".to_string()),
        },
    })
}

/// Parse `KEY=VALUE` lines. Unknown keys and unparsable integers are
/// reported to stderr (logging is not up yet) and skipped.
fn parse_file_values(text: &str) -> FileValues {
    let mut values = FileValues::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        let mut set_int = |slot: &mut Option<i64>| match value.parse::<i64>() {
            Ok(n) => *slot = Some(n),
            Err(_) => eprintln!("[config] skipping non-integer value: {key}={value}"),
        };
        match key {
            "PORT" => set_int(&mut values.port),
            "LOGWrite" => set_int(&mut values.log_write),
            "TRIGMode" => set_int(&mut values.trig_mode),
            "LISTENTrigmode" => set_int(&mut values.listen_trig_mode),
            "CONNTrigmode" => set_int(&mut values.conn_trig_mode),
            "OPT_LINGER" => set_int(&mut values.opt_linger),
            "sql_num" => set_int(&mut values.sql_num),
            "thread_num" => set_int(&mut values.thread_num),
            "close_log" => set_int(&mut values.close_log),
            "actor_model" => set_int(&mut values.actor_model),
            "db_host" => values.db_host = Some(value.to_string()),
            "db_port" => set_int(&mut values.db_port),
            "db_user" => values.db_user = Some(value.to_string()),
            "db_password" => values.db_password = Some(value.to_string()),
            "db_name" => values.db_name = Some(value.to_string()),
            _ => eprintln!("[config] unknown key: {key}"),
        }
    }
    values
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    InvalidValue { key: &'static str, value: i64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_file(text: &str) -> Result<Config, ConfigError> {
        resolve(CliArgs::default(), parse_file_values(text))
    }

    #[test]
    fn test_defaults() {
        let config = resolve(CliArgs::default(), FileValues::default()).unwrap();
        assert_eq!(config.port, 9006);
        assert!(!config.log_async);
        assert_eq!(config.listen_trigger, TriggerMode::Level);
        assert_eq!(config.conn_trigger, TriggerMode::Level);
        assert!(!config.opt_linger);
        assert_eq!(config.sql_conns, 8);
        assert_eq!(config.threads, 8);
        assert!(config.log_enabled);
        assert_eq!(config.actor_model, ActorModel::Proactor);
        assert_eq!(config.db.host, "localhost");
        assert_eq!(config.db.port, 3306);
    }

    #[test]
    fn test_file_parsing_with_comments_and_whitespace() {
        let config = resolve_file(
            "# server settings\n\
             PORT = 7070\n\
             \n\
             thread_num=4\n\
             actor_model = 1\n",
        )
        .unwrap();
        assert_eq!(config.port, 7070);
        assert_eq!(config.threads, 4);
        assert_eq!(config.actor_model, ActorModel::Reactor);
    }

    #[test]
    fn test_file_invalid_integer_skipped() {
        let config = resolve_file("PORT=oops\nthread_num=2\n").unwrap();
        // The bad PORT falls back to the default.
        assert_eq!(config.port, 9006);
        assert_eq!(config.threads, 2);
    }

    #[test]
    fn test_unknown_key_ignored() {
        let config = resolve_file("NOT_A_KEY=1\nPORT=9100\n").unwrap();
        assert_eq!(config.port, 9100);
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::try_parse_from(["shoal", "-p", "8000", "-t", "2"]).unwrap();
        let file = parse_file_values("PORT=7000\nthread_num=16\nsql_num=3\n");
        let config = resolve(cli, file).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.threads, 2);
        // Values only in the file still apply.
        assert_eq!(config.sql_conns, 3);
    }

    #[test]
    fn test_trigger_combos() {
        for (combo, listen, conn) in [
            (0, TriggerMode::Level, TriggerMode::Level),
            (1, TriggerMode::Level, TriggerMode::Edge),
            (2, TriggerMode::Edge, TriggerMode::Level),
            (3, TriggerMode::Edge, TriggerMode::Edge),
        ] {
            let combo_arg = combo.to_string();
            let cli = CliArgs::try_parse_from(["shoal", "-m", combo_arg.as_str()]).unwrap();
            let config = resolve(cli, FileValues::default()).unwrap();
            assert_eq!(config.listen_trigger, listen, "combo {combo}");
            assert_eq!(config.conn_trigger, conn, "combo {combo}");
        }
    }

    #[test]
    fn test_explicit_trig_keys_override_combo_halves() {
        let config = resolve_file("TRIGMode=0\nCONNTrigmode=1\n").unwrap();
        assert_eq!(config.listen_trigger, TriggerMode::Level);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
    }

    #[test]
    fn test_cli_trig_mode_overrides_file_keys() {
        let cli = CliArgs::try_parse_from(["shoal", "-m", "3"]).unwrap();
        let file = parse_file_values("LISTENTrigmode=0\nCONNTrigmode=0\n");
        let config = resolve(cli, file).unwrap();
        assert_eq!(config.listen_trigger, TriggerMode::Edge);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(resolve_file("TRIGMode=4\n").is_err());
        assert!(resolve_file("sql_num=0\n").is_err());
        assert!(resolve_file("thread_num=-1\n").is_err());
        assert!(resolve_file("actor_model=2\n").is_err());
        assert!(resolve_file("PORT=70000\n").is_err());
    }

    #[test]
    fn test_log_config_follows_flags() {
        let sync = resolve_file("LOGWrite=0\n").unwrap().log_config();
        assert_eq!(sync.queue_cap, 0);
        assert!(!sync.disabled);

        let async_cfg = resolve_file("LOGWrite=1\n").unwrap().log_config();
        assert_eq!(async_cfg.queue_cap, 800);

        let off = resolve_file("close_log=1\n").unwrap().log_config();
        assert!(off.disabled);
    }

    #[test]
    fn test_short_flags_parse() {
        let cli = CliArgs::try_parse_from([
            "shoal", "-p", "9010", "-l", "1", "-m", "1", "-o", "1", "-s", "4", "-t", "6",
            "-c", "0", "-a", "1",
        ])
        .unwrap();
        let config = resolve(cli, FileValues::default()).unwrap();
        assert_eq!(config.port, 9010);
        assert!(config.log_async);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
        assert!(config.opt_linger);
        assert_eq!(config.sql_conns, 4);
        assert_eq!(config.threads, 6);
        assert!(config.log_enabled);
        assert_eq!(config.actor_model, ActorModel::Reactor);
    }
}
