#![allow(clippy::unusual_byte_groupings)]
//! Low-level field extraction for the two supported wire protocols.
//!
//! The packed protocol sends 16-bit little-endian words, the serial protocol
//! sends fixed 4-byte frames. Everything here is a pure bit operation; the
//! stateful interpretation lives in [`crate::decoder`].

use byteorder::{BigEndian, ByteOrder, LittleEndian};

// ============================================================================
// Packed 16-bit words
// Bits: [15] timestamp flag | [14:12] code | [11:0] payload
// ============================================================================

/// Size of one packed word in bytes.
pub const WORD_SIZE: usize = 2;

/// Increment applied to the wrap accumulator per packed wrap count.
pub const PACKED_WRAP_ADD: i32 = 0x8000;

/// Number of IMU byte slots in one complete 6-axis sample.
pub const IMU_TOTAL_COUNT: u8 = 14;

/// Enabled-sensor bits of the IMU scale configuration word.
pub const IMU_TYPE_TEMP: u8 = 0x01;
pub const IMU_TYPE_GYRO: u8 = 0x02;
pub const IMU_TYPE_ACCEL: u8 = 0x04;

/// Reads one little-endian word from the start of `bytes`.
#[inline]
pub fn read_word(bytes: &[u8]) -> u16 {
    LittleEndian::read_u16(bytes)
}

/// Returns true for a raw timestamp word (top bit set).
#[inline]
pub fn is_timestamp(word: u16) -> bool {
    word & 0x8000 != 0
}

/// Extracts the 15-bit narrow counter from a timestamp word.
#[inline]
pub fn timestamp_value(word: u16) -> u16 {
    word & 0x7FFF
}

/// Extracts the 3-bit code of a non-timestamp word.
#[inline]
pub fn get_code(word: u16) -> u8 {
    ((word & 0x7000) >> 12) as u8
}

/// Extracts the 12-bit payload of a non-timestamp word.
#[inline]
pub fn get_payload(word: u16) -> u16 {
    word & 0x0FFF
}

/// Code field of a non-timestamp packed word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RawCode {
    /// Special event, payload selects which (0x0)
    Special = 0,
    /// Row address and start-of-frame marker (0x1)
    RowAddress = 1,
    /// 8-pixel group presence, OFF polarity (0x2)
    GroupOff = 2,
    /// 8-pixel group presence, ON polarity (0x3)
    GroupOn = 3,
    /// Column group selector (0x4)
    GroupSelect = 4,
    /// 8-bit miscellaneous channel (0x5)
    Misc8 = 5,
    /// Timestamp wrap with wrap count (0x7)
    TimestampWrap = 7,
}

impl RawCode {
    /// Attempts to parse a code from its 3-bit value.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Special),
            1 => Some(Self::RowAddress),
            2 => Some(Self::GroupOff),
            3 => Some(Self::GroupOn),
            4 => Some(Self::GroupSelect),
            5 => Some(Self::Misc8),
            7 => Some(Self::TimestampWrap),
            _ => None,
        }
    }
}

/// Payload values of the special code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCode {
    Reserved,
    TimestampReset,
    InputFallingEdge,
    InputRisingEdge,
    InputPulse,
    ImuStart6,
    ImuEnd,
    GeneratorFallingEdge,
    GeneratorRisingEdge,
}

impl SpecialCode {
    /// Attempts to parse a special event from its payload.
    #[inline]
    pub fn from_payload(data: u16) -> Option<Self> {
        match data {
            0 => Some(Self::Reserved),
            1 => Some(Self::TimestampReset),
            2 => Some(Self::InputFallingEdge),
            3 => Some(Self::InputRisingEdge),
            4 => Some(Self::InputPulse),
            5 => Some(Self::ImuStart6),
            7 => Some(Self::ImuEnd),
            16 => Some(Self::GeneratorFallingEdge),
            17 => Some(Self::GeneratorRisingEdge),
            _ => None,
        }
    }
}

// ROW_ADDRESS payload: [11] start of frame | [10] unused | [9:0] row

/// Extracts the row address from a ROW_ADDRESS payload.
#[inline]
pub fn row_address(data: u16) -> u16 {
    data & 0x03FF
}

/// Returns true if the ROW_ADDRESS payload carries the start-of-frame marker.
#[inline]
pub fn row_start_of_frame(data: u16) -> bool {
    data & 0x0800 != 0
}

// GROUP_OFF / GROUP_ON payload: [11:8] unused | [7:0] presence, MSB = first column

/// Presence mask of the first column of a group.
pub const GROUP_FIRST_MASK: u16 = 0x0080;

/// Number of pixels covered by one group word.
pub const GROUP_WIDTH: u16 = 8;

/// Extracts the polarity encoded in a group code.
#[inline]
pub fn group_polarity(code: u8) -> bool {
    code & 0x01 != 0
}

/// Returns true if the pixel at `offset` within the group is present.
#[inline]
pub fn group_has_pixel(data: u16, offset: u16) -> bool {
    data & (GROUP_FIRST_MASK >> offset) != 0
}

// GROUP_SELECT payload: [11:6] multi-group marker (zero for single) | [5:0] group

/// Returns true if a GROUP_SELECT payload addresses a single group.
#[inline]
pub fn is_single_group(data: u16) -> bool {
    data & 0x0FC0 == 0
}

/// Extracts the first column of the selected group.
#[inline]
pub fn group_base(data: u16) -> u16 {
    (data & 0x003F) * GROUP_WIDTH
}

// MISC8 payload: [11:8] misc code | [7:0] data

/// Extracts the misc channel code.
#[inline]
pub fn misc8_code(data: u16) -> u8 {
    ((data & 0x0F00) >> 8) as u8
}

/// Extracts the misc channel data byte.
#[inline]
pub fn misc8_data(data: u16) -> u8 {
    (data & 0x00FF) as u8
}

/// Misc code carrying one IMU sample byte.
pub const MISC8_IMU_DATA: u8 = 0;
/// Misc code carrying the IMU scale configuration.
pub const MISC8_IMU_SCALE: u8 = 3;

// IMU scale configuration: [7:5] enabled sensors | [3:2] accel range | [1:0] gyro range

/// Extracts the accelerometer full-scale range.
#[inline]
pub fn imu_accel_range(data: u16) -> u8 {
    ((data >> 2) & 0x03) as u8
}

/// Extracts the gyroscope full-scale range.
#[inline]
pub fn imu_gyro_range(data: u16) -> u8 {
    (data & 0x03) as u8
}

/// Extracts the enabled-sensor mask.
#[inline]
pub fn imu_type(data: u16) -> u8 {
    ((data >> 5) & 0x07) as u8
}

/// LSB per g for an accelerometer range (0 = ±2 g … 3 = ±16 g).
#[inline]
pub fn accel_scale(range: u8) -> f32 {
    65536.0 / (4u32 * (1u32 << range)) as f32
}

/// LSB per °/s for a gyroscope range (0 = ±2000 °/s … 4 = ±125 °/s).
#[inline]
pub fn gyro_scale(range: u8) -> f32 {
    let ascending = 4u8.saturating_sub(range);
    65536.0 / (250u32 * (1u32 << ascending)) as f32
}

/// Converts a raw temperature sample to °C.
#[inline]
pub fn imu_temperature(raw: i16) -> f32 {
    (raw as f32 / 512.0) + 23.0
}

// ============================================================================
// Serial 4-byte frames
// Bytes: [0] 1 | y(7) | [1] polarity | x(7) | [2] ts high | [3] ts low
// ============================================================================

/// Size of one serial frame in bytes.
pub const FRAME_SIZE: usize = 4;

/// Increment applied to the wrap accumulator per 16-bit counter rollover.
pub const FRAME_WRAP_ADD: i32 = 0x10000;

const HIGH_BIT_MASK: u8 = 0x80;
const LOW_BITS_MASK: u8 = 0x7F;

/// Returns true if `byte` carries the frame start (Y address) marker.
#[inline]
pub fn is_frame_start(byte: u8) -> bool {
    byte & HIGH_BIT_MASK == HIGH_BIT_MASK
}

/// Extracts the 7-bit Y address from the first frame byte.
#[inline]
pub fn frame_y(y_byte: u8) -> u8 {
    y_byte & LOW_BITS_MASK
}

/// Extracts the 7-bit X address from the second frame byte.
#[inline]
pub fn frame_x(x_byte: u8) -> u8 {
    x_byte & LOW_BITS_MASK
}

/// Extracts the polarity from the second frame byte.
#[inline]
pub fn frame_polarity(x_byte: u8) -> bool {
    x_byte & HIGH_BIT_MASK != 0
}

/// Extracts the 16-bit big-endian narrow timestamp from a whole frame.
#[inline]
pub fn frame_timestamp(frame: &[u8]) -> u16 {
    BigEndian::read_u16(&frame[2..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_word() {
        let word: u16 = 0b1_011_0000_0000_0101;
        assert!(is_timestamp(word));
        assert_eq!(timestamp_value(word), 0x3005);
        assert!(!is_timestamp(0x7FFF));
    }

    #[test]
    fn test_code_and_payload() {
        // code=3 (group ON), presence=0b1001_0000
        let word: u16 = 0b0_011_0000_1001_0000;
        assert_eq!(get_code(word), 3);
        assert_eq!(RawCode::from_u8(get_code(word)), Some(RawCode::GroupOn));
        assert_eq!(get_payload(word), 0x090);
        assert!(group_polarity(get_code(word)));
        assert!(group_has_pixel(get_payload(word), 0));
        assert!(!group_has_pixel(get_payload(word), 1));
        assert!(group_has_pixel(get_payload(word), 3));
        assert_eq!(RawCode::from_u8(6), None);
    }

    #[test]
    fn test_row_address() {
        // start of frame, row=300
        let data: u16 = 0b1001_0010_1100;
        assert_eq!(row_address(data), 300);
        assert!(row_start_of_frame(data));
        assert!(!row_start_of_frame(0x012C));
    }

    #[test]
    fn test_group_select() {
        assert!(is_single_group(0x0005));
        assert_eq!(group_base(0x0005), 40);
        assert!(!is_single_group(0x0045));
    }

    #[test]
    fn test_special_codes() {
        assert_eq!(SpecialCode::from_payload(1), Some(SpecialCode::TimestampReset));
        assert_eq!(SpecialCode::from_payload(17), Some(SpecialCode::GeneratorRisingEdge));
        assert_eq!(SpecialCode::from_payload(6), None);
    }

    #[test]
    fn test_misc8_and_imu_scale() {
        // misc code=3, accel+gyro+temp enabled, accel range 1, gyro range 2
        let data: u16 = 0x300 | 0b111_0_01_10;
        assert_eq!(misc8_code(data), MISC8_IMU_SCALE);
        assert_eq!(imu_type(data), IMU_TYPE_ACCEL | IMU_TYPE_GYRO | IMU_TYPE_TEMP);
        assert_eq!(imu_accel_range(data), 1);
        assert_eq!(imu_gyro_range(data), 2);
        assert_eq!(misc8_data(0x0AB), 0xAB);
    }

    #[test]
    fn test_scale_formulas() {
        assert_eq!(accel_scale(0), 16384.0);
        assert_eq!(accel_scale(3), 2048.0);
        assert!((gyro_scale(0) - 16.384).abs() < 1e-4);
        assert!((gyro_scale(4) - 262.144).abs() < 1e-3);
        assert_eq!(imu_temperature(0), 23.0);
        assert_eq!(imu_temperature(512), 24.0);
    }

    #[test]
    fn test_frame_fields() {
        let frame = [0x80 | 10, 0x80 | 20, 0x12, 0x34];
        assert!(is_frame_start(frame[0]));
        assert_eq!(frame_y(frame[0]), 10);
        assert_eq!(frame_x(frame[1]), 20);
        assert!(frame_polarity(frame[1]));
        assert_eq!(frame_timestamp(&frame), 0x1234);
        assert!(!is_frame_start(0x7F));
    }

    #[test]
    fn test_read_word_little_endian() {
        assert_eq!(read_word(&[0x34, 0x12]), 0x1234);
    }
}
