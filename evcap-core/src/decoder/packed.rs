//! Decoder for the packed 16-bit word protocol (DV Explorer class devices).
//!
//! Each little-endian word is either a raw timestamp (top bit set) or a coded
//! word selecting row addresses, column groups, pixel groups, special events,
//! IMU bytes or timestamp wraps. Pixel coordinates are sticky: row and group
//! words set state that later group-presence words refer to.

use super::{DecodeContext, ProtocolDecoder, Symbol, SymbolFlags};
use crate::logging::DeviceLogger;
use crate::parser::{self, RawCode, SpecialCode};
use crate::types::{Imu6Event, ImuOrientation, PolarityEvent, SensorGeometry, SpecialEventType};

/// Columns of the DV Explorer sensor.
pub const DV_EXPLORER_COLUMNS: u16 = 640;
/// Rows of the DV Explorer sensor.
pub const DV_EXPLORER_ROWS: u16 = 480;

/// Accelerometer range reported before the first scale word (±4 g).
const DEFAULT_ACCEL_RANGE: u8 = 1;
/// Gyroscope range reported before the first scale word (±500 °/s).
const DEFAULT_GYRO_RANGE: u8 = 2;

/// Scratch state for one IMU sample spread over many misc words.
#[derive(Debug, Clone)]
struct ImuAssembler {
    ignore: bool,
    count: u8,
    high_byte: u8,
    sensors: u8,
    accel_scale: f32,
    gyro_scale: f32,
    sample: Imu6Event,
}

impl Default for ImuAssembler {
    fn default() -> Self {
        Self {
            ignore: true,
            count: 0,
            high_byte: 0,
            sensors: 0,
            accel_scale: parser::accel_scale(DEFAULT_ACCEL_RANGE),
            gyro_scale: parser::gyro_scale(DEFAULT_GYRO_RANGE),
            sample: Imu6Event::default(),
        }
    }
}

impl ImuAssembler {
    fn start(&mut self) {
        self.ignore = false;
        self.count = 0;
        self.sensors = 0;
        self.sample = Imu6Event::default();
    }

    fn discard(&mut self) {
        self.ignore = true;
        self.count = 0;
        self.sample = Imu6Event::default();
    }

    /// Combines the stored high byte with `low` and applies the axis flip.
    fn axis(&self, low: u8, flip: bool) -> f32 {
        let raw = i16::from_be_bytes([self.high_byte, low]);
        let raw = if flip { raw.wrapping_neg() } else { raw };
        f32::from(raw)
    }

    fn scale(&mut self, data: u16, log: &DeviceLogger) {
        self.accel_scale = parser::accel_scale(parser::imu_accel_range(data));
        self.gyro_scale = parser::gyro_scale(parser::imu_gyro_range(data));
        self.sensors = parser::imu_type(data);

        self.count = if self.sensors & parser::IMU_TYPE_ACCEL != 0 {
            0
        } else if self.sensors & parser::IMU_TYPE_TEMP != 0 {
            6
        } else if self.sensors & parser::IMU_TYPE_GYRO != 0 {
            8
        } else {
            device_log!(log, Error, "IMU scale config: no IMU sensors enabled");
            parser::IMU_TOTAL_COUNT
        };
    }

    fn data(&mut self, byte: u8, orientation: ImuOrientation, log: &DeviceLogger) {
        match self.count {
            0 | 2 | 4 | 6 | 8 | 10 | 12 => self.high_byte = byte,
            1 => self.sample.accel_x = self.axis(byte, orientation.flip_x) / self.accel_scale,
            3 => self.sample.accel_y = self.axis(byte, orientation.flip_y) / self.accel_scale,
            5 => {
                self.sample.accel_z = self.axis(byte, orientation.flip_z) / self.accel_scale;

                if self.sensors & parser::IMU_TYPE_TEMP == 0 {
                    if self.sensors & parser::IMU_TYPE_GYRO != 0 {
                        self.count += 2;
                    } else {
                        self.count += 8;
                    }
                }
            }
            7 => {
                let raw = i16::from_be_bytes([self.high_byte, byte]);
                self.sample.temperature = parser::imu_temperature(raw);

                if self.sensors & parser::IMU_TYPE_GYRO == 0 {
                    self.count += 6;
                }
            }
            9 => self.sample.gyro_x = self.axis(byte, orientation.flip_x) / self.gyro_scale,
            11 => self.sample.gyro_y = self.axis(byte, orientation.flip_y) / self.gyro_scale,
            13 => self.sample.gyro_z = self.axis(byte, orientation.flip_z) / self.gyro_scale,
            count => {
                device_log!(log, Error, count, "invalid IMU update sequence");
            }
        }

        self.count = self.count.saturating_add(1);
    }
}

/// Packed word decoder.
#[derive(Debug, Clone)]
pub struct PackedDecoder {
    geometry: SensorGeometry,
    orientation: ImuOrientation,
    last_x: u16,
    last_y: u16,
    imu: ImuAssembler,
}

impl Default for PackedDecoder {
    fn default() -> Self {
        Self::new(
            SensorGeometry::new(DV_EXPLORER_COLUMNS, DV_EXPLORER_ROWS),
            ImuOrientation::default(),
        )
    }
}

impl PackedDecoder {
    pub fn new(geometry: SensorGeometry, orientation: ImuOrientation) -> Self {
        Self {
            geometry,
            orientation,
            last_x: 0,
            last_y: 0,
            imu: ImuAssembler::default(),
        }
    }

    /// Returns true while IMU data is being ignored.
    pub fn imu_suppressed(&self) -> bool {
        self.imu.ignore
    }

    fn special(&mut self, data: u16, ctx: &mut DecodeContext<'_>) -> SymbolFlags {
        let mut flags = SymbolFlags::default();

        match SpecialCode::from_payload(data) {
            Some(SpecialCode::Reserved) => {
                device_log!(ctx.log, Error, "caught special reserved event");
            }
            Some(SpecialCode::TimestampReset) => {
                ctx.tracker.reset();
                device_log!(ctx.log, Info, "timestamp reset event received");
                flags.reset = true;
            }
            Some(SpecialCode::InputFallingEdge) => {
                device_log!(ctx.log, Debug, "external input (falling edge) event received");
                ctx.push_special(SpecialEventType::ExternalInputFallingEdge);
            }
            Some(SpecialCode::InputRisingEdge) => {
                device_log!(ctx.log, Debug, "external input (rising edge) event received");
                ctx.push_special(SpecialEventType::ExternalInputRisingEdge);
            }
            Some(SpecialCode::InputPulse) => {
                device_log!(ctx.log, Debug, "external input (pulse) event received");
                ctx.push_special(SpecialEventType::ExternalInputPulse);
            }
            Some(SpecialCode::ImuStart6) => {
                device_log!(ctx.log, Debug, "IMU6 start event received");
                self.imu.start();
            }
            Some(SpecialCode::ImuEnd) => self.imu_end(ctx),
            Some(SpecialCode::GeneratorFallingEdge) => {
                device_log!(ctx.log, Debug, "external generator (falling edge) event received");
                ctx.push_special(SpecialEventType::ExternalGeneratorFallingEdge);
            }
            Some(SpecialCode::GeneratorRisingEdge) => {
                device_log!(ctx.log, Debug, "external generator (rising edge) event received");
                ctx.push_special(SpecialEventType::ExternalGeneratorRisingEdge);
            }
            None => {
                device_log!(ctx.log, Error, data, "caught special event that can't be handled");
            }
        }

        flags
    }

    fn imu_end(&mut self, ctx: &mut DecodeContext<'_>) {
        if self.imu.ignore {
            return;
        }
        device_log!(ctx.log, Debug, "IMU end event received");

        if self.imu.count != parser::IMU_TOTAL_COUNT {
            device_log!(
                ctx.log,
                Info,
                count = self.imu.count,
                "IMU end: failed to validate IMU sample count, discarding samples"
            );
            return;
        }

        let mut sample = self.imu.sample;
        sample.timestamp = ctx.tracker.current();
        if let Some(buffer) = ctx.imu6(1) {
            buffer.append(sample);
        }
    }

    fn row(&mut self, data: u16, ctx: &mut DecodeContext<'_>) {
        let row = parser::row_address(data);

        if parser::row_start_of_frame(data) {
            device_log!(ctx.log, Debug, "start of frame marker detected");
        }

        if row >= self.geometry.rows {
            device_log!(
                ctx.log,
                Alert,
                row,
                max = self.geometry.rows.saturating_sub(1),
                "row address out of range"
            );
            return;
        }

        self.last_y = row;
    }

    fn group(&mut self, code: u8, data: u16, ctx: &mut DecodeContext<'_>) {
        let polarity = parser::group_polarity(code);
        let timestamp = ctx.tracker.current();
        let (base_x, y, invert) = (self.last_x, self.last_y, self.geometry.invert_xy);

        let Some(buffer) = ctx.polarity(parser::GROUP_WIDTH as usize) else {
            return;
        };

        for offset in 0..parser::GROUP_WIDTH {
            if !parser::group_has_pixel(data, offset) {
                continue;
            }

            let x = base_x + offset;
            let event = if invert {
                PolarityEvent::new(y, x, polarity, timestamp)
            } else {
                PolarityEvent::new(x, y, polarity, timestamp)
            };
            buffer.append(event);
        }
    }

    fn group_select(&mut self, data: u16, ctx: &mut DecodeContext<'_>) {
        if parser::is_single_group(data) {
            self.last_x = parser::group_base(data);
        } else {
            device_log!(ctx.log, Alert, data, "multi-group address not supported");
        }
    }

    fn misc8(&mut self, data: u16, ctx: &mut DecodeContext<'_>) {
        match parser::misc8_code(data) {
            parser::MISC8_IMU_DATA => {
                if self.imu.ignore {
                    return;
                }
                let byte = parser::misc8_data(data);
                device_log!(ctx.log, Debug, byte, "IMU data event received");
                self.imu.data(byte, self.orientation, ctx.log);
            }
            parser::MISC8_IMU_SCALE => {
                if self.imu.ignore {
                    return;
                }
                device_log!(ctx.log, Debug, data, "IMU scale config event received");
                self.imu.scale(data, ctx.log);
            }
            code => {
                device_log!(ctx.log, Error, code, "caught misc8 event that can't be handled");
            }
        }
    }

    fn wrap(&mut self, data: u16, ctx: &mut DecodeContext<'_>) -> SymbolFlags {
        let advance = ctx.tracker.apply_wrap(data, parser::PACKED_WRAP_ADD);
        SymbolFlags {
            timestamp: !advance.big_wrap,
            reset: false,
            big_wrap: advance.big_wrap,
        }
    }
}

impl ProtocolDecoder for PackedDecoder {
    fn name(&self) -> &'static str {
        "packed"
    }

    fn geometry(&self) -> SensorGeometry {
        self.geometry
    }

    fn trim_chunk<'b>(&mut self, chunk: &'b [u8], log: &DeviceLogger) -> &'b [u8] {
        if chunk.len() % parser::WORD_SIZE != 0 {
            device_log!(
                log,
                Alert,
                len = chunk.len(),
                "received bytes are not a multiple of the word size"
            );
            &chunk[..chunk.len() - chunk.len() % parser::WORD_SIZE]
        } else {
            chunk
        }
    }

    fn decode_symbol(&mut self, input: &[u8], ctx: &mut DecodeContext<'_>) -> Symbol {
        if input.len() < parser::WORD_SIZE {
            return Symbol::Incomplete;
        }

        let word = parser::read_word(input);
        let mut flags = SymbolFlags::default();

        if parser::is_timestamp(word) {
            ctx.tracker.apply_counter(parser::timestamp_value(word));
            ctx.check_monotonic();
            flags.timestamp = true;
        } else {
            let code = parser::get_code(word);
            let data = parser::get_payload(word);

            match RawCode::from_u8(code) {
                Some(RawCode::Special) => flags = self.special(data, ctx),
                Some(RawCode::RowAddress) => self.row(data, ctx),
                Some(RawCode::GroupOff) | Some(RawCode::GroupOn) => self.group(code, data, ctx),
                Some(RawCode::GroupSelect) => self.group_select(data, ctx),
                Some(RawCode::Misc8) => self.misc8(data, ctx),
                Some(RawCode::TimestampWrap) => flags = self.wrap(data, ctx),
                None => {
                    device_log!(ctx.log, Error, code, "caught event that can't be handled");
                }
            }
        }

        Symbol::Consumed {
            len: parser::WORD_SIZE,
            flags,
        }
    }

    fn discard_composite(&mut self) {
        self.imu.discard();
    }
}
