//! Stateful protocol decoding and the single-writer producer.
//!
//! A [`ProtocolDecoder`] interprets one wire symbol at a time, folding it into
//! the timestamp tracker and the generator's buffers. The [`Producer`] drives a
//! decoder over whole transport chunks, evaluates the commit policy after every
//! symbol and delivers the resulting containers to the exchange. It is a plain
//! synchronous function over a byte slice, so the same code runs behind an
//! acquisition thread or a transfer completion callback.

pub mod frame;
pub mod packed;

pub use frame::FrameDecoder;
pub use packed::PackedDecoder;

use crate::buffer::EventBuffer;
use crate::container::{CommitTrigger, Container, ContainerGenerator, PacketSettings};
use crate::exchange::{DataExchange, Rejected};
use crate::logging::DeviceLogger;
use crate::timestamps::TimestampTracker;
use crate::types::{Imu6Event, PolarityEvent, SensorGeometry, SpecialEvent, SpecialEventType};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sleep between polls of a non-blocking exchange during replay.
const REPLAY_POLL: Duration = Duration::from_micros(100);

/// Control effects of one decoded symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolFlags {
    /// The symbol moved the timestamp forward
    pub timestamp: bool,
    /// The device timestamps were reset
    pub reset: bool,
    /// The expanded timestamp space wrapped
    pub big_wrap: bool,
}

/// Outcome of decoding at the head of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// A whole symbol of `len` bytes was interpreted
    Consumed { len: usize, flags: SymbolFlags },
    /// `len` bytes were not part of any symbol and were skipped
    Skipped(usize),
    /// Not enough bytes left for a whole symbol
    Incomplete,
}

/// Mutable pipeline state a decoder writes into.
pub struct DecodeContext<'a> {
    pub tracker: &'a mut TimestampTracker,
    pub generator: &'a mut ContainerGenerator,
    pub log: &'a DeviceLogger,
}

impl DecodeContext<'_> {
    /// Polarity buffer with room for `additional` events, or `None` after
    /// logging an allocation failure.
    pub fn polarity(&mut self, additional: usize) -> Option<&mut EventBuffer<PolarityEvent>> {
        match self
            .generator
            .reserve_polarity(additional, self.tracker.overflow())
        {
            Ok(buffer) => Some(buffer),
            Err(error) => {
                device_log!(self.log, Critical, %error, "dropping polarity event");
                None
            }
        }
    }

    /// IMU buffer with room for `additional` events, or `None` after logging
    /// an allocation failure.
    pub fn imu6(&mut self, additional: usize) -> Option<&mut EventBuffer<Imu6Event>> {
        match self.generator.reserve_imu6(additional, self.tracker.overflow()) {
            Ok(buffer) => Some(buffer),
            Err(error) => {
                device_log!(self.log, Critical, %error, "dropping IMU6 event");
                None
            }
        }
    }

    /// Appends a special event stamped with the current time.
    pub fn push_special(&mut self, kind: SpecialEventType) {
        let event = SpecialEvent::new(kind, self.tracker.current());
        match self.generator.reserve_special(1, self.tracker.overflow()) {
            Ok(buffer) => buffer.append(event),
            Err(error) => {
                device_log!(self.log, Critical, %error, "dropping special event");
            }
        }
    }

    /// Logs a timestamp that moved backwards.
    pub fn check_monotonic(&self) {
        if !self.tracker.is_monotonic() {
            device_log!(
                self.log,
                Alert,
                last = self.tracker.last(),
                current = self.tracker.current(),
                "non-monotonic timestamp detected"
            );
        }
    }
}

/// One wire protocol.
pub trait ProtocolDecoder: Send {
    /// Short protocol name for logs.
    fn name(&self) -> &'static str;

    /// Sensor geometry of the device this decoder was built for.
    fn geometry(&self) -> SensorGeometry;

    /// Cuts a transport chunk down to what can be decoded.
    fn trim_chunk<'b>(&mut self, chunk: &'b [u8], _log: &DeviceLogger) -> &'b [u8] {
        chunk
    }

    /// Decodes the symbol at the start of `input`, which is never empty.
    fn decode_symbol(&mut self, input: &[u8], ctx: &mut DecodeContext<'_>) -> Symbol;

    /// Drops any partially assembled composite event and ignores composite
    /// data until the next bracket start.
    fn discard_composite(&mut self) {}
}

impl<D: ProtocolDecoder + ?Sized> ProtocolDecoder for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn geometry(&self) -> SensorGeometry {
        (**self).geometry()
    }

    fn trim_chunk<'b>(&mut self, chunk: &'b [u8], log: &DeviceLogger) -> &'b [u8] {
        (**self).trim_chunk(chunk, log)
    }

    fn decode_symbol(&mut self, input: &[u8], ctx: &mut DecodeContext<'_>) -> Symbol {
        (**self).decode_symbol(input, ctx)
    }

    fn discard_composite(&mut self) {
        (**self).discard_composite()
    }
}

/// Counters kept by a producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub bytes: u64,
    pub symbols: u64,
    pub skipped_bytes: u64,
    pub truncated_bytes: u64,
    pub containers_delivered: u64,
    pub containers_dropped: u64,
    pub empty_commits: u64,
    pub resets: u64,
    pub big_wraps: u64,
}

/// Stats snapshot readable without touching the producer.
///
/// Updated after every chunk and before any wait for exchange space.
pub type SharedStats = Arc<Mutex<ProducerStats>>;

/// Couples a decoder with the tracker, the generator and the exchange.
///
/// Exactly one producer feeds an exchange; its state is single-writer.
pub struct Producer<D> {
    decoder: D,
    tracker: TimestampTracker,
    generator: ContainerGenerator,
    exchange: Arc<DataExchange>,
    running: Arc<AtomicBool>,
    log: Arc<DeviceLogger>,
    stats: ProducerStats,
    published: SharedStats,
}

impl<D: ProtocolDecoder> Producer<D> {
    pub fn new(
        mut decoder: D,
        packets: Arc<PacketSettings>,
        exchange: Arc<DataExchange>,
        running: Arc<AtomicBool>,
        log: Arc<DeviceLogger>,
    ) -> Self {
        decoder.discard_composite();
        Self {
            decoder,
            tracker: TimestampTracker::new(),
            generator: ContainerGenerator::new(packets),
            exchange,
            running,
            log,
            stats: ProducerStats::default(),
            published: SharedStats::default(),
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn tracker(&self) -> &TimestampTracker {
        &self.tracker
    }

    pub fn generator(&self) -> &ContainerGenerator {
        &self.generator
    }

    pub fn exchange(&self) -> &Arc<DataExchange> {
        &self.exchange
    }

    pub fn running(&self) -> &Arc<AtomicBool> {
        &self.running
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    /// Handle to the published stats, for readers on other threads.
    pub fn shared_stats(&self) -> SharedStats {
        Arc::clone(&self.published)
    }

    fn publish_stats(&self) {
        *self.published.lock() = self.stats;
    }

    /// Prepares for a new acquisition run: disarms the time trigger and
    /// suppresses composite events until their next bracket start.
    pub fn start(&mut self) {
        self.generator.clear();
        self.decoder.discard_composite();
    }

    /// Frees uncommitted buffers and composite scratch state.
    pub fn stop(&mut self) {
        self.generator.clear();
        self.decoder.discard_composite();
        self.publish_stats();
    }

    /// Decodes one transport chunk to its last whole symbol.
    pub fn process(&mut self, chunk: &[u8]) {
        self.decode_chunk(chunk);
        self.publish_stats();
    }

    fn decode_chunk(&mut self, received: &[u8]) {
        self.stats.bytes += received.len() as u64;
        let chunk = self.decoder.trim_chunk(received, &self.log);
        self.stats.truncated_bytes += (received.len() - chunk.len()) as u64;

        let mut offset = 0;
        while offset < chunk.len() {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            let symbol = {
                let mut ctx = DecodeContext {
                    tracker: &mut self.tracker,
                    generator: &mut self.generator,
                    log: &self.log,
                };
                self.decoder.decode_symbol(&chunk[offset..], &mut ctx)
            };

            match symbol {
                Symbol::Consumed { len, flags } => {
                    offset += len;
                    self.stats.symbols += 1;
                    self.after_symbol(flags);
                }
                Symbol::Skipped(len) => {
                    offset += len;
                    self.stats.skipped_bytes += len as u64;
                }
                Symbol::Incomplete => {
                    let remaining = chunk.len() - offset;
                    self.stats.truncated_bytes += remaining as u64;
                    device_log!(
                        self.log,
                        Debug,
                        protocol = self.decoder.name(),
                        remaining,
                        "discarding trailing partial symbol"
                    );
                    break;
                }
            }
        }
    }

    /// Reads `reader` to the end in chunks of `chunk_size` bytes and decodes each.
    pub fn process_reader<R: Read>(
        &mut self,
        reader: &mut R,
        chunk_size: usize,
    ) -> std::io::Result<u64> {
        let mut buffer = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            total += bytes_read as u64;
            self.process(&buffer[..bytes_read]);
        }

        Ok(total)
    }

    /// Commits whatever is buffered, as at the end of a recording.
    pub fn flush(&mut self) {
        self.commit(CommitTrigger::Flush);
        self.publish_stats();
    }

    /// Decodes `chunks` and flushes, while a scoped consumer thread hands
    /// every delivered container to `consume`.
    ///
    /// With the consumer draining the exchange, a forced put for a reset
    /// never waits on a queue nobody empties.
    pub fn replay<'a, I, F>(&mut self, chunks: I, mut consume: F) -> io::Result<()>
    where
        I: IntoIterator<Item = &'a [u8]>,
        F: FnMut(Container) + Send,
    {
        let exchange = Arc::clone(&self.exchange);
        let feeding = AtomicBool::new(true);

        thread::scope(|scope| {
            let feeding = &feeding;
            let consumer = thread::Builder::new()
                .name(format!("{} replay", self.log.label()))
                .spawn_scoped(scope, move || loop {
                    if let Some(container) = exchange.get(feeding) {
                        consume(container);
                        continue;
                    }
                    if !feeding.load(Ordering::Acquire) && exchange.is_empty() {
                        break;
                    }
                    thread::sleep(REPLAY_POLL);
                })?;

            for chunk in chunks {
                self.process(chunk);
            }
            self.flush();
            feeding.store(false, Ordering::Release);

            if let Err(panic) = consumer.join() {
                std::panic::resume_unwind(panic);
            }
            Ok(())
        })
    }

    fn after_symbol(&mut self, flags: SymbolFlags) {
        if flags.reset {
            self.stats.resets += 1;
        }
        if flags.big_wrap {
            self.stats.big_wraps += 1;
        }
        if flags.timestamp && !flags.reset {
            self.generator.observe_timestamp(self.tracker.full());
        }

        if let Some(trigger) = self
            .generator
            .check(flags.reset, flags.big_wrap, self.tracker.full())
        {
            self.commit(trigger);
        }
    }

    fn commit(&mut self, trigger: CommitTrigger) {
        if trigger.is_forced() {
            self.decoder.discard_composite();
        }

        let commit =
            match self
                .generator
                .commit(trigger, self.tracker.full(), self.tracker.overflow())
            {
                Ok(commit) => commit,
                Err(error) => {
                    device_log!(self.log, Critical, %error, ?trigger, "failed to commit container");
                    return;
                }
            };

        match commit.data {
            Some(container) => match self.exchange.put(container) {
                Ok(()) => self.stats.containers_delivered += 1,
                Err(Rejected::Full(_)) => {
                    self.stats.containers_dropped += 1;
                    device_log!(self.log, Notice, "dropped container because the exchange is full");
                }
                Err(Rejected::Closed(_)) => {
                    self.stats.containers_dropped += 1;
                    device_log!(self.log, Debug, "dropped container because the exchange is closed");
                }
            },
            None => self.stats.empty_commits += 1,
        }

        if let Some(marker) = commit.reset_marker {
            // Readers of the shared stats must not wait on a blocked put.
            self.publish_stats();
            match self.exchange.put_force(marker, &self.running) {
                Ok(()) => self.stats.containers_delivered += 1,
                Err(_) => {
                    self.stats.containers_dropped += 1;
                    device_log!(
                        self.log,
                        Notice,
                        "timestamp reset container not delivered, session is stopping"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeSettings, Notifications};
    use crate::types::EventKind;

    /// One byte per symbol: 0xFF resets, 0xFE big-wraps, anything else is a
    /// pixel at x = byte, stamped with time = byte.
    struct ByteDecoder;

    impl ProtocolDecoder for ByteDecoder {
        fn name(&self) -> &'static str {
            "byte"
        }

        fn geometry(&self) -> SensorGeometry {
            SensorGeometry::new(256, 1)
        }

        fn decode_symbol(&mut self, input: &[u8], ctx: &mut DecodeContext<'_>) -> Symbol {
            let mut flags = SymbolFlags::default();
            match input[0] {
                0xFF => {
                    ctx.tracker.reset();
                    flags.reset = true;
                }
                0xFE => {
                    flags.big_wrap = ctx.tracker.apply_wrap(u16::MAX, 0x8000).big_wrap
                        | ctx.tracker.apply_wrap(2, 0x8000).big_wrap;
                }
                byte => {
                    ctx.tracker.apply_counter(u16::from(byte));
                    flags.timestamp = true;
                    let ts = ctx.tracker.current();
                    if let Some(buffer) = ctx.polarity(1) {
                        buffer.append(PolarityEvent::new(u16::from(byte), 0, true, ts));
                    }
                }
            }
            Symbol::Consumed { len: 1, flags }
        }
    }

    fn producer(max_size: u32, interval: u32, capacity: u32) -> Producer<ByteDecoder> {
        producer_with(ByteDecoder, max_size, interval, capacity)
    }

    fn producer_with<D: ProtocolDecoder>(
        decoder: D,
        max_size: u32,
        interval: u32,
        capacity: u32,
    ) -> Producer<D> {
        let packets = Arc::new(PacketSettings::default());
        packets.set_max_packet_size(max_size);
        packets.set_max_interval(interval);

        let settings = Arc::new(ExchangeSettings::default());
        settings.set_buffer_size(capacity);
        let exchange = Arc::new(DataExchange::new(settings));
        exchange.init(Notifications::new());

        Producer::new(
            decoder,
            packets,
            exchange,
            Arc::new(AtomicBool::new(true)),
            Arc::new(DeviceLogger::new("test", crate::logging::LogLevel::Debug)),
        )
    }

    #[test]
    fn test_size_commit_after_second_symbol() {
        let mut producer = producer(2, 10_000, 8);
        producer.process(&[1, 2, 3]);

        let exchange = Arc::clone(producer.exchange());
        assert_eq!(exchange.len(), 1);
        let container = exchange.try_get().unwrap();
        assert_eq!(container.event_count(EventKind::Polarity), 2);
        assert_eq!(producer.generator().pending(EventKind::Polarity), 1);
    }

    #[test]
    fn test_time_commit() {
        let mut producer = producer(0, 10, 8);
        // Deadline armed at 1 + 10 - 1 = 10; 11 crosses it.
        producer.process(&[1, 5, 10, 11]);

        let container = producer.exchange().try_get().unwrap();
        assert_eq!(container.event_count(EventKind::Polarity), 4);
        assert_eq!(producer.generator().deadline(), Some(20));
    }

    #[test]
    fn test_reset_yields_data_then_solo_container() {
        let mut producer = producer(100, 10_000, 8);
        producer.process(&[1, 2, 0xFF, 3]);

        let exchange = Arc::clone(producer.exchange());
        let data = exchange.try_get().unwrap();
        assert_eq!(data.event_count(EventKind::Polarity), 2);

        let marker = exchange.try_get().unwrap();
        assert!(marker.is_timestamp_reset());
        assert!(exchange.try_get().is_none());
        assert_eq!(producer.stats().resets, 1);
        assert_eq!(producer.tracker().current(), 3);
    }

    #[test]
    fn test_big_wrap_commits_with_marker() {
        let mut producer = producer(100, 10_000, 8);
        producer.process(&[7, 0xFE]);

        let container = producer.exchange().try_get().unwrap();
        assert_eq!(container.event_count(EventKind::Polarity), 1);
        assert_eq!(container.event_count(EventKind::Special), 1);
        assert_eq!(producer.tracker().overflow(), 1);
    }

    #[test]
    fn test_full_exchange_drops_ordinary_containers() {
        let mut producer = producer(1, 10_000, 1);
        producer.process(&[1, 2, 3]);
        assert_eq!(producer.exchange().len(), 1);
        assert_eq!(producer.stats().containers_dropped, 2);
    }

    #[test]
    fn test_stopped_producer_decodes_nothing() {
        let mut producer = producer(1, 10_000, 8);
        producer.running().store(false, Ordering::Relaxed);
        producer.process(&[1, 2, 3]);
        assert_eq!(producer.stats().symbols, 0);
    }

    #[test]
    fn test_odd_packed_chunk_counts_truncated_byte() {
        let mut producer = producer_with(PackedDecoder::default(), 100, 10_000, 8);
        producer.process(&[0x05, 0x80, 0x07]);

        let stats = producer.stats();
        assert_eq!(stats.bytes, 3);
        assert_eq!(stats.truncated_bytes, 1);
        assert_eq!(stats.symbols, 1);
        assert_eq!(producer.tracker().current(), 5);
    }

    #[test]
    fn test_shared_stats_follow_each_chunk() {
        let mut producer = producer(100, 10_000, 8);
        let shared = producer.shared_stats();

        producer.process(&[1, 2, 0xFF]);
        assert_eq!(shared.lock().symbols, 3);
        assert_eq!(shared.lock().resets, 1);
        assert_eq!(*shared.lock(), producer.stats());
    }

    #[test]
    fn test_replay_delivers_every_reset_through_a_full_exchange() {
        // One container per pixel into a single slot, with many resets in one chunk.
        let mut producer = producer(1, 10_000, 1);
        let chunk: Vec<u8> = (0..2000u32)
            .map(|i| if i % 10 == 9 { 0xFF } else { (i % 200) as u8 + 1 })
            .collect();

        let mut resets = 0;
        let mut containers = 0;
        producer
            .replay([chunk.as_slice()], |container| {
                containers += 1;
                if container.is_timestamp_reset() {
                    resets += 1;
                }
            })
            .unwrap();

        assert_eq!(resets, 200);
        let stats = producer.stats();
        assert_eq!(stats.resets, 200);
        assert_eq!(containers, stats.containers_delivered);
        assert!(producer.exchange().is_empty());
    }

    #[test]
    fn test_replay_with_non_blocking_exchange() {
        let mut producer = producer(1, 10_000, 1);
        producer.exchange().settings().set_blocking(false);

        let mut resets = 0;
        producer
            .replay([&[1u8, 0xFF, 2, 0xFF, 3][..]], |container| {
                if container.is_timestamp_reset() {
                    resets += 1;
                }
            })
            .unwrap();
        assert_eq!(resets, 2);
    }

    #[test]
    fn test_flush_commits_remainder() {
        let mut producer = producer(100, 10_000, 8);
        producer.process(&[1, 2]);
        assert!(producer.exchange().is_empty());

        producer.flush();
        assert_eq!(producer.exchange().try_get().unwrap().len(), 2);
    }
}
