//! Logging wrapper for the block pool, following the host node's own
//! `log` + `log4rs` setup: a console appender, an optional rolling file
//! appender, and a module-prefix filter so dependency noise doesn't drown
//! the pool's own records.

use std::ops::Deref;

use lazy_static::lazy_static;
use log::{LevelFilter, Record};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::filter::{threshold::ThresholdFilter, Filter, Response};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Logging verbosity levels, decoupled from `log::LevelFilter` so the
/// config file doesn't need to know about the `log` crate's naming.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

fn convert_log_level(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warning => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Logging config, analogous to the host node's `LoggingConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub log_to_stdout: bool,
    pub stdout_log_level: LogLevel,
    pub log_to_file: bool,
    pub file_log_level: LogLevel,
    pub log_file_path: String,
    pub log_file_append: bool,
    pub log_max_size: Option<u64>,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            log_to_stdout: true,
            stdout_log_level: LogLevel::Info,
            log_to_file: false,
            file_log_level: LogLevel::Debug,
            log_file_path: String::from("blockpool.log"),
            log_file_append: true,
            log_max_size: Some(16 * 1024 * 1024),
        }
    }
}

lazy_static! {
    static ref WAS_INIT: Mutex<bool> = Mutex::new(false);
}

const LOGGING_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l})} {M} - {m}{n}";

/// Only lets records from this crate through, so third-party crate chatter
/// at the same level doesn't crowd out the pool's own logging.
#[derive(Debug)]
struct PoolFilter;

impl Filter for PoolFilter {
    fn filter(&self, record: &Record<'_>) -> Response {
        match record.module_path() {
            Some(path) if path.starts_with("blockpool") => Response::Neutral,
            _ => Response::Reject,
        }
    }
}

/// Initialize the logger. Safe to call more than once; only the first call
/// takes effect, matching the host node's `WAS_INIT` guard (tests that spin
/// up multiple pools in one process shouldn't double-register appenders).
pub fn init(config: &LoggingConfig) {
    let mut was_init = WAS_INIT.lock();
    if *was_init.deref() {
        return;
    }

    let level_stdout = convert_log_level(config.stdout_log_level);
    let level_file = convert_log_level(config.file_log_level);
    let level_minimum = level_stdout.max(level_file);

    let mut root = Root::builder();
    let mut appenders: Vec<Appender> = vec![];

    if config.log_to_stdout {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOGGING_PATTERN)))
            .build();
        appenders.push(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level_stdout)))
                .filter(Box::new(PoolFilter))
                .build("stdout", Box::new(stdout)),
        );
        root = root.appender("stdout");
    }

    if config.log_to_file {
        let file: Box<dyn Append> = if let Some(size) = config.log_max_size {
            let roller = FixedWindowRoller::builder()
                .build(&format!("{}.{{}}.gz", config.log_file_path), 32)
                .expect("valid fixed-window roller pattern");
            let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(size)), Box::new(roller));
            Box::new(
                RollingFileAppender::builder()
                    .append(config.log_file_append)
                    .encoder(Box::new(PatternEncoder::new(LOGGING_PATTERN)))
                    .build(&config.log_file_path, Box::new(policy))
                    .expect("valid log file path"),
            )
        } else {
            Box::new(
                FileAppender::builder()
                    .append(config.log_file_append)
                    .encoder(Box::new(PatternEncoder::new(LOGGING_PATTERN)))
                    .build(&config.log_file_path)
                    .expect("valid log file path"),
            )
        };
        appenders.push(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(level_file)))
                .filter(Box::new(PoolFilter))
                .build("file", file),
        );
        root = root.appender("file");
    }

    let log_config = Config::builder()
        .appenders(appenders)
        .build(root.build(level_minimum))
        .expect("valid log4rs config");

    let _ = log4rs::init_config(log_config);
    *was_init = true;
}

/// Minimal stdout-only setup for tests.
pub fn init_test_logger() {
    let mut cfg = LoggingConfig::default();
    cfg.log_to_file = false;
    cfg.stdout_log_level = LogLevel::Debug;
    init(&cfg);
}
