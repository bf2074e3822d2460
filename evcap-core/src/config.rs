//! Host-side configuration addressed by `(module, parameter)` pairs.
//!
//! Every setting is an atomic so it can be changed while acquisition runs.
//! Device-specific modules (such as the serial DVS run control) are handled by
//! the session before falling back to [`SessionConfig::set`].

use crate::container::PacketSettings;
use crate::exchange::ExchangeSettings;
use crate::logging::{DeviceLogger, LogLevel};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Module identifiers.
pub mod module {
    /// Serial DVS device control (run, timestamp reset)
    pub const DVS: i8 = 0;
    /// Transfer (USB-style) transport
    pub const USB: i8 = -1;
    /// Serial transport
    pub const SERIAL: i8 = -2;
    /// Container exchange
    pub const DATAEXCHANGE: i8 = -3;
    /// Container commit policy
    pub const PACKETS: i8 = -4;
    /// Device log level
    pub const LOG: i8 = -5;
}

/// Parameters of [`module::DVS`].
pub mod dvs {
    pub const RUN: u8 = 0;
    pub const TIMESTAMP_RESET: u8 = 1;
}

/// Parameters of [`module::USB`].
pub mod usb {
    pub const BUFFER_NUMBER: u8 = 0;
    pub const BUFFER_SIZE: u8 = 1;
}

/// Parameters of [`module::SERIAL`].
pub mod serial {
    pub const READ_SIZE: u8 = 0;
}

/// Parameters of [`module::DATAEXCHANGE`].
pub mod dataexchange {
    pub const BUFFER_SIZE: u8 = 0;
    pub const BLOCKING: u8 = 1;
    pub const START_PRODUCERS: u8 = 2;
    pub const STOP_PRODUCERS: u8 = 3;
    pub const LOW_WATERMARK: u8 = 4;
    pub const HIGH_WATERMARK: u8 = 5;
}

/// Parameters of [`module::PACKETS`].
pub mod packets {
    pub const MAX_CONTAINER_PACKET_SIZE: u8 = 0;
    pub const MAX_CONTAINER_INTERVAL: u8 = 1;
}

/// Parameters of [`module::LOG`].
pub mod log {
    pub const LOG_LEVEL: u8 = 0;
}

/// Default number of transfers kept in flight.
pub const DEFAULT_BUFFER_NUMBER: u32 = 8;
/// Default size of one transfer in bytes.
pub const DEFAULT_TRANSFER_SIZE: u32 = 8192;
/// Default maximum size of one serial read in bytes.
pub const DEFAULT_READ_SIZE: u32 = 1024;

/// Errors returned by configuration calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported parameter {param} of module {module}")]
    Unsupported { module: i8, param: u8 },

    #[error("invalid value {value} for parameter {param} of module {module}")]
    InvalidValue { module: i8, param: u8, value: u32 },

    #[error("device command failed: {0}")]
    Device(String),
}

/// Transport sizing.
#[derive(Debug)]
pub struct TransportSettings {
    buffer_number: AtomicU32,
    buffer_size: AtomicU32,
    read_size: AtomicU32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            buffer_number: AtomicU32::new(DEFAULT_BUFFER_NUMBER),
            buffer_size: AtomicU32::new(DEFAULT_TRANSFER_SIZE),
            read_size: AtomicU32::new(DEFAULT_READ_SIZE),
        }
    }
}

impl TransportSettings {
    /// Transfers kept in flight, applied at session start.
    pub fn buffer_number(&self) -> u32 {
        self.buffer_number.load(Ordering::Relaxed)
    }

    /// Bytes per transfer, applied at session start.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Relaxed)
    }

    /// Upper bound for one serial read.
    pub fn read_size(&self) -> u32 {
        self.read_size.load(Ordering::Relaxed)
    }
}

fn flag(value: u32) -> bool {
    value != 0
}

/// All host settings of one device session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub exchange: Arc<ExchangeSettings>,
    pub packets: Arc<PacketSettings>,
    pub transport: Arc<TransportSettings>,
    pub log: Arc<DeviceLogger>,
}

impl SessionConfig {
    /// Default settings, logging under `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            exchange: Arc::new(ExchangeSettings::default()),
            packets: Arc::new(PacketSettings::default()),
            transport: Arc::new(TransportSettings::default()),
            log: Arc::new(DeviceLogger::new(label, LogLevel::Warning)),
        }
    }

    pub fn builder(label: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(label)
    }

    /// Sets one host parameter.
    pub fn set(&self, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
        let result = self.apply(module, param, value);
        if let Err(error) = &result {
            device_log!(self.log, Debug, %error, "configuration rejected");
        }
        result
    }

    fn apply(&self, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
        let invalid = ConfigError::InvalidValue {
            module,
            param,
            value,
        };

        match (module, param) {
            (module::USB, usb::BUFFER_NUMBER) if value == 0 => Err(invalid),
            (module::USB, usb::BUFFER_NUMBER) => {
                self.transport.buffer_number.store(value, Ordering::Relaxed);
                Ok(())
            }
            (module::USB, usb::BUFFER_SIZE) if value == 0 => Err(invalid),
            (module::USB, usb::BUFFER_SIZE) => {
                self.transport.buffer_size.store(value, Ordering::Relaxed);
                Ok(())
            }
            (module::SERIAL, serial::READ_SIZE) if (value as usize) < crate::parser::FRAME_SIZE => {
                Err(invalid)
            }
            (module::SERIAL, serial::READ_SIZE) => {
                self.transport.read_size.store(value, Ordering::Relaxed);
                Ok(())
            }
            (module::DATAEXCHANGE, dataexchange::BUFFER_SIZE) if value == 0 => Err(invalid),
            (module::DATAEXCHANGE, dataexchange::BUFFER_SIZE) => {
                self.exchange.set_buffer_size(value);
                Ok(())
            }
            (module::DATAEXCHANGE, dataexchange::BLOCKING) => {
                self.exchange.set_blocking(flag(value));
                Ok(())
            }
            (module::DATAEXCHANGE, dataexchange::START_PRODUCERS) => {
                self.exchange.set_start_producers(flag(value));
                Ok(())
            }
            (module::DATAEXCHANGE, dataexchange::STOP_PRODUCERS) => {
                self.exchange.set_stop_producers(flag(value));
                Ok(())
            }
            (module::DATAEXCHANGE, dataexchange::LOW_WATERMARK) => {
                self.exchange.set_low_watermark(value);
                Ok(())
            }
            (module::DATAEXCHANGE, dataexchange::HIGH_WATERMARK) => {
                self.exchange.set_high_watermark(value);
                Ok(())
            }
            (module::PACKETS, packets::MAX_CONTAINER_PACKET_SIZE) => {
                self.packets.set_max_packet_size(value);
                Ok(())
            }
            (module::PACKETS, packets::MAX_CONTAINER_INTERVAL) if value == 0 => Err(invalid),
            (module::PACKETS, packets::MAX_CONTAINER_INTERVAL) => {
                self.packets.set_max_interval(value);
                Ok(())
            }
            (module::LOG, log::LOG_LEVEL) => {
                let level = u8::try_from(value)
                    .ok()
                    .and_then(LogLevel::from_u8)
                    .ok_or(invalid)?;
                self.log.set_level(level);
                Ok(())
            }
            _ => Err(ConfigError::Unsupported { module, param }),
        }
    }

    /// Reads one host parameter.
    pub fn get(&self, module: i8, param: u8) -> Result<u32, ConfigError> {
        let value = match (module, param) {
            (module::USB, usb::BUFFER_NUMBER) => self.transport.buffer_number(),
            (module::USB, usb::BUFFER_SIZE) => self.transport.buffer_size(),
            (module::SERIAL, serial::READ_SIZE) => self.transport.read_size(),
            (module::DATAEXCHANGE, dataexchange::BUFFER_SIZE) => self.exchange.buffer_size(),
            (module::DATAEXCHANGE, dataexchange::BLOCKING) => u32::from(self.exchange.blocking()),
            (module::DATAEXCHANGE, dataexchange::START_PRODUCERS) => {
                u32::from(self.exchange.start_producers())
            }
            (module::DATAEXCHANGE, dataexchange::STOP_PRODUCERS) => {
                u32::from(self.exchange.stop_producers())
            }
            (module::DATAEXCHANGE, dataexchange::LOW_WATERMARK) => self.exchange.low_watermark(),
            (module::DATAEXCHANGE, dataexchange::HIGH_WATERMARK) => self.exchange.high_watermark(),
            (module::PACKETS, packets::MAX_CONTAINER_PACKET_SIZE) => self.packets.max_packet_size(),
            (module::PACKETS, packets::MAX_CONTAINER_INTERVAL) => self.packets.max_interval(),
            (module::LOG, log::LOG_LEVEL) => self.log.level() as u32,
            _ => {
                let error = ConfigError::Unsupported { module, param };
                device_log!(self.log, Debug, %error, "configuration query rejected");
                return Err(error);
            }
        };
        Ok(value)
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    label: String,
    log_level: LogLevel,
    settings: Vec<(i8, u8, u32)>,
}

impl SessionConfigBuilder {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            log_level: LogLevel::Warning,
            settings: Vec::new(),
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn exchange_size(mut self, size: u32) -> Self {
        self.settings
            .push((module::DATAEXCHANGE, dataexchange::BUFFER_SIZE, size));
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.settings
            .push((module::DATAEXCHANGE, dataexchange::BLOCKING, u32::from(blocking)));
        self
    }

    pub fn watermarks(mut self, low: u32, high: u32) -> Self {
        self.settings
            .push((module::DATAEXCHANGE, dataexchange::LOW_WATERMARK, low));
        self.settings
            .push((module::DATAEXCHANGE, dataexchange::HIGH_WATERMARK, high));
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.settings
            .push((module::PACKETS, packets::MAX_CONTAINER_PACKET_SIZE, size));
        self
    }

    pub fn max_interval(mut self, interval: u32) -> Self {
        self.settings
            .push((module::PACKETS, packets::MAX_CONTAINER_INTERVAL, interval));
        self
    }

    pub fn read_size(mut self, size: u32) -> Self {
        self.settings.push((module::SERIAL, serial::READ_SIZE, size));
        self
    }

    pub fn transfers(mut self, count: u32, size: u32) -> Self {
        self.settings.push((module::USB, usb::BUFFER_NUMBER, count));
        self.settings.push((module::USB, usb::BUFFER_SIZE, size));
        self
    }

    /// Validates every setting and builds the configuration.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig::new(self.label);
        config.log.set_level(self.log_level);
        for (module, param, value) in self.settings {
            config.set(module, param, value)?;
        }
        Ok(config)
    }
}
