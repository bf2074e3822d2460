//! Device-scoped logging on top of `tracing`.
//!
//! Each session owns a [`DeviceLogger`] with its label and its own runtime
//! log level, so two devices can log at different verbosity. Messages that
//! pass the device level are forwarded to `tracing` with a `device` field.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Severity scale used by device configuration (lower is more severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    /// Converts a configuration value, if it is in range.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Emergency),
            1 => Some(Self::Alert),
            2 => Some(Self::Critical),
            3 => Some(Self::Error),
            4 => Some(Self::Warning),
            5 => Some(Self::Notice),
            6 => Some(Self::Info),
            7 => Some(Self::Debug),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "EMERGENCY",
            Self::Alert => "ALERT",
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Notice => "NOTICE",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(Self::Emergency),
            "alert" => Ok(Self::Alert),
            "critical" => Ok(Self::Critical),
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "notice" => Ok(Self::Notice),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Label and runtime log level of one device session.
#[derive(Debug)]
pub struct DeviceLogger {
    label: String,
    level: AtomicU8,
}

impl DeviceLogger {
    /// Creates a logger for `label` at the given level.
    pub fn new(label: impl Into<String>, level: LogLevel) -> Self {
        Self {
            label: label.into(),
            level: AtomicU8::new(level as u8),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed)).unwrap_or(LogLevel::Debug)
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Returns true if a message of `level` passes this device's filter.
    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level as u8 <= self.level.load(Ordering::Relaxed)
    }
}

impl Default for DeviceLogger {
    fn default() -> Self {
        Self::new("evcap", LogLevel::Warning)
    }
}

/// Logs through a [`DeviceLogger`] when its level allows it.
///
/// `device_log!(logger, Notice, offset = i, "data not aligned")`
macro_rules! device_log {
    (@emit Emergency, $($arg:tt)+) => { ::tracing::error!($($arg)+) };
    (@emit Alert, $($arg:tt)+) => { ::tracing::error!($($arg)+) };
    (@emit Critical, $($arg:tt)+) => { ::tracing::error!($($arg)+) };
    (@emit Error, $($arg:tt)+) => { ::tracing::error!($($arg)+) };
    (@emit Warning, $($arg:tt)+) => { ::tracing::warn!($($arg)+) };
    (@emit Notice, $($arg:tt)+) => { ::tracing::info!($($arg)+) };
    (@emit Info, $($arg:tt)+) => { ::tracing::info!($($arg)+) };
    (@emit Debug, $($arg:tt)+) => { ::tracing::debug!($($arg)+) };
    ($logger:expr, $level:ident, $($arg:tt)+) => {{
        let logger: &$crate::logging::DeviceLogger = &$logger;
        if logger.enabled($crate::logging::LogLevel::$level) {
            device_log!(@emit $level, device = %logger.label(), $($arg)+);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        let logger = DeviceLogger::new("test", LogLevel::Notice);
        assert!(logger.enabled(LogLevel::Alert));
        assert!(logger.enabled(LogLevel::Notice));
        assert!(!logger.enabled(LogLevel::Info));

        logger.set_level(LogLevel::Debug);
        assert!(logger.enabled(LogLevel::Debug));
        assert_eq!(logger.level(), LogLevel::Debug);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::from_str("warn").unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::from_str(" Debug ").unwrap(), LogLevel::Debug);
        assert!(LogLevel::from_str("verbose").is_err());
        assert_eq!(LogLevel::from_u8(8), None);
    }

    #[test]
    fn test_macro_respects_level() {
        let logger = DeviceLogger::new("test", LogLevel::Emergency);
        // Filtered out; must not panic or evaluate into anything observable.
        device_log!(logger, Debug, value = 3, "filtered message");
        device_log!(logger, Emergency, "emitted message");
    }
}
