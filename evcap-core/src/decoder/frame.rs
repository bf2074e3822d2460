//! Decoder for the serial 4-byte frame protocol (eDVS class devices).
//!
//! Frames are `[1|y(7), polarity|x(7), ts high, ts low]`. A frame must start
//! on a byte with its high bit set; anything else is skipped until one shows up.

use super::{DecodeContext, ProtocolDecoder, Symbol, SymbolFlags};
use crate::parser;
use crate::session::CommandSink;
use crate::types::{PolarityEvent, SensorGeometry};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pixel array size of the eDVS sensor, in both directions.
pub const EDVS_ARRAY_SIZE: u16 = 128;

/// Command that zeroes the device timestamp counter.
pub const TIMESTAMP_RESET_COMMAND: &[u8] = b"!ET0\n";

/// Serial frame decoder.
pub struct FrameDecoder {
    reset_request: Arc<AtomicBool>,
    commands: Option<Arc<dyn CommandSink>>,
}

impl fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("reset_pending", &self.reset_request.load(Ordering::Relaxed))
            .field("commands", &self.commands.is_some())
            .finish()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), None)
    }
}

impl FrameDecoder {
    /// Creates a decoder. Setting `reset_request` makes the next aligned frame
    /// perform a host-requested timestamp reset, sent through `commands`.
    pub fn new(reset_request: Arc<AtomicBool>, commands: Option<Arc<dyn CommandSink>>) -> Self {
        Self {
            reset_request,
            commands,
        }
    }

    /// Flag shared with configuration to request a timestamp reset.
    pub fn reset_request(&self) -> &Arc<AtomicBool> {
        &self.reset_request
    }

    fn host_reset(&mut self, ctx: &mut DecodeContext<'_>) -> SymbolFlags {
        if let Some(commands) = &self.commands {
            if let Err(error) = commands.write_command(TIMESTAMP_RESET_COMMAND) {
                device_log!(ctx.log, Debug, %error, "timestamp reset command failed, ignoring");
            }
        }

        ctx.tracker.reset();
        device_log!(ctx.log, Info, "timestamp reset requested by host");

        SymbolFlags {
            reset: true,
            ..SymbolFlags::default()
        }
    }

    fn pixel(frame: &[u8], ctx: &mut DecodeContext<'_>) {
        let x = parser::frame_x(frame[1]);
        let y = parser::frame_y(frame[0]);
        let polarity = parser::frame_polarity(frame[1]);

        let in_range = u16::from(x) < EDVS_ARRAY_SIZE && u16::from(y) < EDVS_ARRAY_SIZE;
        if !in_range {
            if u16::from(x) >= EDVS_ARRAY_SIZE {
                device_log!(ctx.log, Alert, x, max = EDVS_ARRAY_SIZE - 1, "X address out of range");
            }
            if u16::from(y) >= EDVS_ARRAY_SIZE {
                device_log!(ctx.log, Alert, y, max = EDVS_ARRAY_SIZE - 1, "Y address out of range");
            }
            return;
        }

        let timestamp = ctx.tracker.current();
        if let Some(buffer) = ctx.polarity(1) {
            buffer.append(PolarityEvent::new(
                u16::from(x),
                u16::from(y),
                polarity,
                timestamp,
            ));
        }
    }
}

impl ProtocolDecoder for FrameDecoder {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn geometry(&self) -> SensorGeometry {
        SensorGeometry::new(EDVS_ARRAY_SIZE, EDVS_ARRAY_SIZE)
    }

    fn decode_symbol(&mut self, input: &[u8], ctx: &mut DecodeContext<'_>) -> Symbol {
        if !parser::is_frame_start(input[0]) {
            device_log!(ctx.log, Notice, byte = input[0], "data not aligned, skipping byte");
            return Symbol::Skipped(1);
        }

        if input.len() < parser::FRAME_SIZE {
            return Symbol::Incomplete;
        }
        let frame = &input[..parser::FRAME_SIZE];

        if self.reset_request.swap(false, Ordering::AcqRel) {
            return Symbol::Consumed {
                len: parser::FRAME_SIZE,
                flags: self.host_reset(ctx),
            };
        }

        let advance = ctx
            .tracker
            .apply_sample(parser::frame_timestamp(frame), parser::FRAME_WRAP_ADD);

        if advance.big_wrap {
            return Symbol::Consumed {
                len: parser::FRAME_SIZE,
                flags: SymbolFlags {
                    big_wrap: true,
                    ..SymbolFlags::default()
                },
            };
        }

        ctx.check_monotonic();
        Self::pixel(frame, ctx);

        Symbol::Consumed {
            len: parser::FRAME_SIZE,
            flags: SymbolFlags {
                timestamp: true,
                ..SymbolFlags::default()
            },
        }
    }
}
