//! Core event types produced by the acquisition pipeline.
//!
//! Timestamps inside events are the 31-bit wrapped value in microseconds. The
//! overflow counter that completes them lives on the enclosing buffer, see
//! [`full_timestamp`].

/// Bit position of the overflow counter in a full 64-bit timestamp.
pub const TS_OVERFLOW_SHIFT: u32 = 31;

/// Combines an overflow counter and a wrapped timestamp into the full,
/// monotonically increasing 64-bit timestamp.
#[inline]
pub fn full_timestamp(ts_overflow: i32, timestamp: i32) -> i64 {
    (((ts_overflow as u64) << TS_OVERFLOW_SHIFT) | (timestamp as u32 as u64)) as i64
}

/// A decoded polarity (change detection) event.
///
/// Represents a brightness change detected at one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PolarityEvent {
    /// Timestamp in microseconds (wrapped, see [`full_timestamp`])
    pub timestamp: i32,
    /// X coordinate of the pixel
    pub x: u16,
    /// Y coordinate of the pixel
    pub y: u16,
    /// Event polarity: false = OFF (decrease), true = ON (increase in brightness)
    pub polarity: bool,
}

impl PolarityEvent {
    /// Creates a new polarity event.
    #[inline]
    pub fn new(x: u16, y: u16, polarity: bool, timestamp: i32) -> Self {
        Self {
            timestamp,
            x,
            y,
            polarity,
        }
    }
}

/// Kind of a special event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpecialEventType {
    /// The expanded 32-bit timestamp space wrapped around (informative only).
    TimestampWrap = 0,
    /// Device timestamps restarted from zero.
    TimestampReset = 1,
    /// Falling edge detected on the external input.
    ExternalInputFallingEdge = 2,
    /// Rising edge detected on the external input.
    ExternalInputRisingEdge = 3,
    /// Pulse detected on the external input.
    ExternalInputPulse = 4,
    /// Falling edge produced by the on-board signal generator.
    ExternalGeneratorFallingEdge = 16,
    /// Rising edge produced by the on-board signal generator.
    ExternalGeneratorRisingEdge = 17,
}

/// A special (non-pixel) event: external triggers and timestamp markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SpecialEvent {
    /// Timestamp in microseconds. Wrap and reset markers carry `i32::MAX`
    /// so that they sort after everything else in their container.
    pub timestamp: i32,
    /// Event kind
    pub kind: SpecialEventType,
}

impl SpecialEvent {
    /// Creates a new special event.
    #[inline]
    pub fn new(kind: SpecialEventType, timestamp: i32) -> Self {
        Self { timestamp, kind }
    }

    /// Creates a timestamp marker (wrap or reset) with the maximum timestamp.
    #[inline]
    pub fn marker(kind: SpecialEventType) -> Self {
        Self::new(kind, i32::MAX)
    }
}

/// One complete 6-axis IMU sample plus die temperature.
///
/// Accelerations are in g, angular rates in °/s and temperature in °C.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Imu6Event {
    /// Timestamp in microseconds
    pub timestamp: i32,
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub temperature: f32,
}

/// The event kinds a container can carry, one typed buffer each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Special,
    Polarity,
    Imu6,
}

impl EventKind {
    /// All kinds, in container slot order.
    pub const ALL: [EventKind; 3] = [EventKind::Special, EventKind::Polarity, EventKind::Imu6];

    /// Short lowercase name used in logs and output file names.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Special => "special",
            EventKind::Polarity => "polarity",
            EventKind::Imu6 => "imu6",
        }
    }
}

/// Sensor geometry and orientation reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorGeometry {
    /// Number of pixel columns as sent on the wire
    pub columns: u16,
    /// Number of pixel rows as sent on the wire
    pub rows: u16,
    /// Swap X and Y when emitting pixel events
    pub invert_xy: bool,
}

impl SensorGeometry {
    /// Creates a geometry without axis inversion.
    pub fn new(columns: u16, rows: u16) -> Self {
        Self {
            columns,
            rows,
            invert_xy: false,
        }
    }

    /// Output width, after the optional X/Y inversion.
    pub fn width(&self) -> u16 {
        if self.invert_xy {
            self.rows
        } else {
            self.columns
        }
    }

    /// Output height, after the optional X/Y inversion.
    pub fn height(&self) -> u16 {
        if self.invert_xy {
            self.columns
        } else {
            self.rows
        }
    }
}

/// Per-axis sign flips of the IMU, from the device orientation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImuOrientation {
    pub flip_x: bool,
    pub flip_y: bool,
    pub flip_z: bool,
}

impl ImuOrientation {
    /// Decodes the orientation register layout (X = bit 2, Y = bit 1, Z = bit 0).
    pub fn from_bits(bits: u32) -> Self {
        Self {
            flip_x: bits & 0x04 != 0,
            flip_y: bits & 0x02 != 0,
            flip_z: bits & 0x01 != 0,
        }
    }
}
