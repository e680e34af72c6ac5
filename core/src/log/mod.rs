//!
//! Logger initialisation on top of log4rs.
//!
//! Library crates log through the `log` facade; binaries and tests call
//! [`init_logger`] or [`try_init_logger`] once to install a backend.
//!

mod appender;
pub mod consts;
mod logger;

use appender::AppenderSpec;
use consts::{CONSOLE_APPENDER, DEFAULT_LOGGER_ENV, ERR_LOG_FILE_APPENDER, ERR_LOG_FILE_NAME, LOG_FILE_APPENDER, LOG_FILE_NAME};
use log::LevelFilter;
use log4rs::config::{Config, Root};
use std::path::Path;
use thiserror::Error;

pub use logger::FilterSpec;

#[derive(Clone, Debug, Error)]
pub enum LogError {
    #[error("Logger spec parsing error: {0}")]
    ParseLoggerSpecError(String),

    #[error("log path is not valid unicode: {0}")]
    InvalidPath(String),

    #[error("log appender error: {0}")]
    Appender(String),

    #[error("logger configuration error: {0}")]
    Config(String),
}

fn build_config(log_dir: Option<&Path>, filters: &str) -> Result<Config, LogError> {
    let mut spec = FilterSpec::new().with_root_level(LevelFilter::Info);
    spec.merge_env(DEFAULT_LOGGER_ENV).merge_expression(filters);

    let mut appenders = vec![AppenderSpec::console(CONSOLE_APPENDER)];
    if let Some(dir) = log_dir {
        appenders.push(AppenderSpec::rolling_file(LOG_FILE_APPENDER, None, dir, LOG_FILE_NAME)?);
        appenders.push(AppenderSpec::rolling_file(ERR_LOG_FILE_APPENDER, Some(LevelFilter::Warn), dir, ERR_LOG_FILE_NAME)?);
    }
    let names = appenders.iter().map(|a| a.name).collect::<Vec<_>>();

    Config::builder()
        .appenders(appenders.into_iter().map(AppenderSpec::into_appender))
        .loggers(spec.loggers())
        .build(Root::builder().appenders(names).build(spec.root_level()))
        .map_err(|err| LogError::Config(err.to_string()))
}

/// Installs the console logger and, when `log_dir` is given, the rolling
/// log files. `filters` is layered on top of `RUST_LOG`.
pub fn init_logger(log_dir: Option<&str>, filters: &str) -> Result<(), LogError> {
    let config = build_config(log_dir.map(Path::new), filters)?;
    log4rs::init_config(config).map(|_| ()).map_err(|err| LogError::Config(err.to_string()))
}

/// Console-only logger for tests; silently does nothing if a logger is already installed.
pub fn try_init_logger(filters: &str) {
    if let Ok(config) = build_config(None, filters) {
        let _ = log4rs::init_config(config);
    }
}
