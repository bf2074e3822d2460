//! Acquisition core for event-based vision sensors.
//!
//! Raw bytes from a device transport are decoded into typed events, the
//! sensor's narrow timestamp counter is expanded into a monotonic 64-bit time
//! base, and events are batched into [`Container`]s that are handed to a
//! consumer through a bounded [`DataExchange`].
//!
//! Two wire protocols are supported: packed 16-bit little-endian words
//! (DV Explorer class USB cameras, [`PackedDecoder`]) and 4-byte serial frames
//! (eDVS class devices, [`FrameDecoder`]).
//!
//! # Example
//!
//! ```no_run
//! use evcap_core::{
//!     DataExchange, FrameDecoder, Notifications, Producer, SessionConfig,
//! };
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let config = SessionConfig::new("eDVS replay");
//! let exchange = Arc::new(DataExchange::new(Arc::clone(&config.exchange)));
//! exchange.init(Notifications::new());
//!
//! let running = Arc::new(AtomicBool::new(true));
//! let mut producer = Producer::new(
//!     FrameDecoder::default(),
//!     Arc::clone(&config.packets),
//!     Arc::clone(&exchange),
//!     running,
//!     Arc::clone(&config.log),
//! );
//!
//! let mut file = std::fs::File::open("capture.edvs").unwrap();
//! producer.process_reader(&mut file, 1024).unwrap();
//! producer.flush();
//!
//! while let Some(container) = exchange.try_get() {
//!     println!("{} events", container.len());
//! }
//! ```

#[macro_use]
mod logging;

pub mod buffer;
pub mod config;
pub mod container;
pub mod decoder;
pub mod exchange;
pub mod parser;
pub mod session;
pub mod timestamps;
pub mod types;

pub use logging::{DeviceLogger, LogLevel};

pub use buffer::{BufferError, EventBuffer};
pub use config::{ConfigError, SessionConfig};
pub use container::{Container, ContainerGenerator, PacketSettings};
pub use decoder::{FrameDecoder, PackedDecoder, Producer, ProducerStats, ProtocolDecoder};
pub use exchange::{DataExchange, ExchangeSettings, Notifications, Rejected};
pub use session::{
    DeviceInfo, SerialPort, SerialSession, SessionError, TransferBackend, TransferHandler,
    TransferSession, TransferStatus,
};
pub use timestamps::TimestampTracker;
pub use types::{
    EventKind, Imu6Event, ImuOrientation, PolarityEvent, SensorGeometry, SpecialEvent,
    SpecialEventType,
};
