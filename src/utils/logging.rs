//! Logging setup on top of `env_logger`.

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Trace => write!(f, "TRACE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Include timestamps in logs
    pub include_timestamp: bool,
    /// Include module path in logs
    pub include_module_path: bool,
    /// Extra `RUST_LOG` style directives, applied after `level`.
    pub filters: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_timestamp: true,
            include_module_path: true,
            filters: None,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }
}

/// Installs the global logger. Returns false when a logger was already set,
/// which leaves the existing one in place.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.level.into());
    if let Some(filters) = &config.filters {
        builder.parse_filters(filters);
    }
    let include_module_path = config.include_module_path;
    let include_timestamp = config.include_timestamp;
    builder.format(move |buf, record| {
        if include_timestamp {
            let ts = buf.timestamp_seconds();
            write!(buf, "[{}] ", ts)?;
        }
        write!(buf, "[{}] ", record.level())?;
        if let (true, Some(module)) = (include_module_path, record.module_path()) {
            write!(buf, "[{}] ", module)?;
        }
        writeln!(buf, "{}", record.args())
    });
    match builder.try_init() {
        Ok(()) => {
            log::debug!("Logger initialized with level {}", config.level);
            true
        }
        Err(_) => false,
    }
}
