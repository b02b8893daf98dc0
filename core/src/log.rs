//! Logger initialization and the injectable [`Logger`] handle.
//!
//! Components never log through a package-level logger of their own. Each one
//! receives a [`Logger`] at construction and logs through the macros exported
//! at the crate root (`prosper_core::info!(logger, ...)` and friends). A
//! [`Logger::global`] handle forwards to whatever `log` backend the process
//! installed with [`init_logger`]; tests use [`Logger::capture`] or
//! [`Logger::discard`] instead.

mod appender;
mod consts;
mod logger;

pub use consts::*;
pub use log::Level;
pub use logger::LogError;

use appender::AppenderSpec;
use log::{LevelFilter, Log, Metadata, Record};
use log4rs::config::{Config, Root};
use logger::LevelSpec;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Installs the process-wide log4rs backend.
///
/// `filters` is a level spec such as `info, prosper_stratum=debug`; the
/// `RUST_LOG` environment variable is applied first and `filters` overrides it.
/// When `log_dir` is set, a rolling log file and a warnings-only error file are
/// written there as well.
pub fn init_logger(log_dir: Option<&str>, filters: &str) -> Result<(), LogError> {
    let mut spec = LevelSpec::new();
    spec.parse_env(DEFAULT_LOGGER_ENV).parse_expression(filters);
    for rejected in spec.rejected() {
        eprintln!("Ignoring invalid logging spec '{}'", rejected);
    }

    let mut appenders = vec![AppenderSpec::console(consts::CONSOLE_APPENDER, None)];
    if let Some(log_dir) = log_dir {
        appenders.push(AppenderSpec::roller(consts::LOG_FILE_APPENDER, None, log_dir, LOG_FILE_NAME)?);
        appenders.push(AppenderSpec::roller(consts::ERR_LOG_FILE_APPENDER, Some(LevelFilter::Warn), log_dir, ERR_LOG_FILE_NAME)?);
    }
    let names = appenders.iter().map(|x| x.name).collect::<Vec<_>>();

    let config = Config::builder()
        .appenders(appenders.iter_mut().filter_map(|x| x.appender()))
        .loggers(spec.take_targets().iter().map(|x| x.logger(&names)))
        .build(Root::builder().appenders(names.iter().copied()).build(spec.root_level()))
        .map_err(|err| LogError::InitError(err.to_string()))?;

    log4rs::init_config(config).map_err(|err| LogError::InitError(err.to_string()))?;
    Ok(())
}

/// Same as [`init_logger`] without log files, ignoring the error raised when a
/// logger is already installed. Handy in tests.
pub fn try_init_logger(filters: &str) {
    let _ = init_logger(None, filters);
}

/// A log target bound to a sink.
#[derive(Clone)]
pub struct Logger {
    target: Arc<str>,
    sink: Arc<dyn Log>,
}

impl Logger {
    /// Forwards to the process-wide `log` backend.
    pub fn global(target: &str) -> Self {
        Self { target: target.into(), sink: Arc::new(GlobalSink) }
    }

    /// Drops everything.
    pub fn discard() -> Self {
        Self { target: "discard".into(), sink: Arc::new(NullSink) }
    }

    /// Records every line in memory, at any level.
    pub fn capture(target: &str) -> (Self, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::default());
        (Self { target: target.into(), sink: sink.clone() }, sink)
    }

    /// Same sink, different target.
    pub fn with_target(&self, target: &str) -> Self {
        Self { target: target.into(), sink: self.sink.clone() }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn enabled(&self, level: Level) -> bool {
        self.sink.enabled(&Metadata::builder().level(level).target(&self.target).build())
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            self.sink.log(&Record::builder().level(level).target(&self.target).args(args).build());
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("target", &self.target).finish()
    }
}

struct GlobalSink;

impl Log for GlobalSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        log::logger().log(record)
    }

    fn flush(&self) {
        log::logger().flush()
    }
}

struct NullSink;

impl Log for NullSink {
    fn enabled(&self, _: &Metadata) -> bool {
        false
    }

    fn log(&self, _: &Record) {}

    fn flush(&self) {}
}

/// In-memory sink returned by [`Logger::capture`].
#[derive(Default)]
pub struct CaptureSink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl CaptureSink {
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().clone()
    }

    /// True if some line at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines.lock().iter().any(|(l, line)| *l == level && line.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.lock().clear()
    }
}

impl Log for CaptureSink {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.lines.lock().push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

#[macro_export]
macro_rules! trace {
    ($logger:expr, $($arg:tt)+) => ( $logger.log($crate::log::Level::Trace, format_args!($($arg)+)) )
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => ( $logger.log($crate::log::Level::Debug, format_args!($($arg)+)) )
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => ( $logger.log($crate::log::Level::Info, format_args!($($arg)+)) )
}

#[macro_export]
macro_rules! warn {
    ($logger:expr, $($arg:tt)+) => ( $logger.log($crate::log::Level::Warn, format_args!($($arg)+)) )
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)+) => ( $logger.log($crate::log::Level::Error, format_args!($($arg)+)) )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_logger_records_lines() {
        let (logger, sink) = Logger::capture("test");
        crate::info!(logger, "hello {}", 42);
        crate::warn!(logger.with_target("other"), "careful");

        assert_eq!(sink.lines(), vec![(Level::Info, "hello 42".to_string()), (Level::Warn, "careful".to_string())]);
        assert!(sink.contains(Level::Warn, "care"));
        assert!(!sink.contains(Level::Error, "care"));
    }

    #[test]
    fn test_discard_logger_is_disabled() {
        let logger = Logger::discard();
        assert!(!logger.enabled(Level::Error));
        crate::error!(logger, "nobody hears this");
    }
}
