//! Logging backend for the standard `log` facade
//!
//! Configure once at startup, then use the standard macros
//! (`log::info!`, `log::debug!`, …) anywhere in the crate. The formatter
//! writes one plain line per record: UTC timestamp, level, target, message.
//! Warnings and errors go to stderr, everything else to stdout.

use std::io::Write;
use std::sync::Once;

use serde::{Deserialize, Serialize};

static INIT: Once = Once::new();

/// Log verbosity levels, ordered from quietest to noisiest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Maximum level that gets emitted
    pub level: LogLevel,
    /// Prefix every line with the crate-wide service name
    pub service: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: LogLevel::Info, service: None }
    }
}

impl LoggingConfig {
    /// Verbose preset used when the `verbose_log` option is set
    pub fn verbose() -> Self {
        Self { level: LogLevel::Debug, service: None }
    }
}

/// Install the logger. Safe to call multiple times; only the first call wins.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    INIT.call_once(|| {
        let logger = LineLogger { service: config.service.clone() };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(config.level.to_filter());
        }
    });
    Ok(())
}

struct LineLogger {
    service: Option<String>,
}

impl log::Log for LineLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let line = match &self.service {
            Some(svc) => format!(
                "{} {:5} {} [{}] {}\n",
                ts,
                record.level(),
                svc,
                record.target(),
                record.args()
            ),
            None => {
                format!("{} {:5} [{}] {}\n", ts, record.level(), record.target(), record.args())
            }
        };
        if record.level() <= log::Level::Warn {
            let _ = std::io::stderr().write_all(line.as_bytes());
        } else {
            let _ = std::io::stdout().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&LoggingConfig::verbose()).is_ok());
    }

    #[test]
    fn verbose_preset_enables_debug() {
        assert_eq!(LoggingConfig::verbose().level, LogLevel::Debug);
    }
}
