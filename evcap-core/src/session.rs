//! Transport sessions that feed raw device bytes into a [`Producer`].
//!
//! Two shapes are supported:
//!
//! - [`SerialSession`] runs a dedicated acquisition thread that polls a
//!   [`SerialPort`] with short read timeouts and decodes 4-byte frames.
//! - [`TransferSession`] keeps a fixed number of asynchronous transfers in
//!   flight on a [`TransferBackend`]; every completion is decoded inside the
//!   backend's callback and the transfer is resubmitted.
//!
//! Either way exactly one producer runs per session and the consumer only
//! touches the [`DataExchange`].

use crate::config::{dvs, module, ConfigError, SessionConfig};
use crate::container::Container;
use crate::decoder::{FrameDecoder, ProtocolDecoder, Producer, ProducerStats, SharedStats};
use crate::exchange::{DataExchange, Notifications, NotifyFn};
use crate::parser::FRAME_SIZE;
use crate::types::SensorGeometry;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Timeout of one serial read.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Pause between cancellation passes while transfers drain.
const CANCEL_RETRY: Duration = Duration::from_millis(1);

/// Upper bound for transfers to drain after cancellation.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

const RUN_COMMAND: &[u8] = b"E+\n";
const HALT_COMMAND: &[u8] = b"E-\n";

/// Errors raised by session lifecycle calls.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("session is not running")]
    NotRunning,

    #[error("failed to send command {command:?}: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to submit transfers: {0}")]
    Submit(String),
}

/// Write path for device commands.
pub trait CommandSink: Send + Sync {
    fn write_command(&self, command: &[u8]) -> Result<(), SessionError>;
}

/// Byte-oriented serial connection.
pub trait SerialPort: Send + Sync + 'static {
    /// Reads up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Writes all of `data`.
    fn write(&self, data: &[u8]) -> io::Result<()>;
}

/// Serializes command writes, independent of the acquisition thread's reads.
pub struct SerialWriter<P> {
    port: Arc<P>,
    lock: Mutex<()>,
}

impl<P: SerialPort> SerialWriter<P> {
    pub fn new(port: Arc<P>) -> Self {
        Self {
            port,
            lock: Mutex::new(()),
        }
    }
}

impl<P: SerialPort> CommandSink for SerialWriter<P> {
    fn write_command(&self, command: &[u8]) -> Result<(), SessionError> {
        let _guard = self.lock.lock();
        self.port
            .write(command)
            .map_err(|source| SessionError::Command {
                command: String::from_utf8_lossy(command).trim_end().to_string(),
                source,
            })
    }
}

/// Snapshot describing an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub label: String,
    pub geometry: SensorGeometry,
    pub running: bool,
}

fn fire_shutdown(callback: &Option<NotifyFn>) {
    if let Some(callback) = callback {
        callback();
    }
}

/// Serial device session with its own acquisition thread.
pub struct SerialSession<P: SerialPort> {
    config: SessionConfig,
    port: Arc<P>,
    writer: Arc<SerialWriter<P>>,
    exchange: Arc<DataExchange>,
    running: Arc<AtomicBool>,
    device_running: AtomicBool,
    producer: Arc<Mutex<Producer<FrameDecoder>>>,
    stats: SharedStats,
    geometry: SensorGeometry,
    reset_request: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<P: SerialPort> SerialSession<P> {
    pub fn new(port: P, config: SessionConfig) -> Self {
        let port = Arc::new(port);
        let writer = Arc::new(SerialWriter::new(Arc::clone(&port)));
        let exchange = Arc::new(DataExchange::new(Arc::clone(&config.exchange)));
        let running = Arc::new(AtomicBool::new(false));
        let reset_request = Arc::new(AtomicBool::new(false));

        let commands: Arc<dyn CommandSink> = writer.clone();
        let decoder = FrameDecoder::new(Arc::clone(&reset_request), Some(commands));
        let geometry = decoder.geometry();
        let producer = Producer::new(
            decoder,
            Arc::clone(&config.packets),
            Arc::clone(&exchange),
            Arc::clone(&running),
            Arc::clone(&config.log),
        );

        Self {
            config,
            port,
            writer,
            exchange,
            running,
            device_running: AtomicBool::new(false),
            stats: producer.shared_stats(),
            geometry,
            producer: Arc::new(Mutex::new(producer)),
            reset_request,
            thread: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<DataExchange> {
        &self.exchange
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Producer counters as of the last decoded chunk.
    pub fn stats(&self) -> ProducerStats {
        *self.stats.lock()
    }

    /// Starts acquisition.
    ///
    /// `on_shutdown` runs once, from the acquisition thread, if the port fails.
    pub fn start(
        &mut self,
        notify: Notifications,
        on_shutdown: Option<NotifyFn>,
    ) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }
        // Collect a thread that ended on a transport failure.
        self.join_thread();

        self.exchange.init(notify);
        self.producer.lock().start();
        self.running.store(true, Ordering::Release);

        let read_size = (self.config.transport.read_size() as usize) & !(FRAME_SIZE - 1);
        let port = Arc::clone(&self.port);
        let producer = Arc::clone(&self.producer);
        let running = Arc::clone(&self.running);
        let log = Arc::clone(&self.config.log);

        let spawned = thread::Builder::new()
            .name(format!("{} acquisition", self.config.log.label()))
            .spawn(move || {
                let mut buffer = vec![0u8; read_size.max(FRAME_SIZE)];
                while running.load(Ordering::Acquire) {
                    match port.read(&mut buffer, SERIAL_READ_TIMEOUT) {
                        Ok(n) if n >= FRAME_SIZE => producer.lock().process(&buffer[..n]),
                        Ok(_) => {}
                        Err(error)
                            if matches!(
                                error.kind(),
                                io::ErrorKind::TimedOut
                                    | io::ErrorKind::WouldBlock
                                    | io::ErrorKind::Interrupted
                            ) => {}
                        Err(error) => {
                            device_log!(log, Critical, %error, "serial read failed, shutting down");
                            if running.swap(false, Ordering::AcqRel) {
                                fire_shutdown(&on_shutdown);
                            }
                            break;
                        }
                    }
                }
                device_log!(log, Debug, "acquisition thread exiting");
            });

        match spawned {
            Ok(handle) => self.thread = Some(handle),
            Err(error) => {
                self.running.store(false, Ordering::Release);
                self.producer.lock().stop();
                self.exchange.close();
                device_log!(self.config.log, Critical, %error, "failed to start acquisition thread");
                return Err(SessionError::Spawn(error));
            }
        }

        if self.config.exchange.start_producers() {
            if let Err(error) = self.writer.write_command(RUN_COMMAND) {
                device_log!(self.config.log, Critical, %error, "failed to start device");
                // The acquisition run is torn down; the run command error is what the caller sees.
                let _ = self.stop();
                return Err(error);
            }
            self.device_running.store(true, Ordering::Release);
        }

        device_log!(self.config.log, Info, "acquisition started");
        Ok(())
    }

    /// Stops acquisition, joins the thread and frees queued containers.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if self.thread.is_none() {
            return Err(SessionError::NotRunning);
        }

        if self.config.exchange.stop_producers() && self.device_running.load(Ordering::Acquire) {
            match self.writer.write_command(HALT_COMMAND) {
                Ok(()) => self.device_running.store(false, Ordering::Release),
                Err(error) => device_log!(self.config.log, Error, %error, "failed to stop device"),
            }
        }

        self.running.store(false, Ordering::Release);
        self.join_thread();
        self.producer.lock().stop();
        let dropped = self.exchange.close();

        device_log!(self.config.log, Info, dropped, "acquisition stopped");
        Ok(())
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                device_log!(self.config.log, Error, "acquisition thread panicked");
            }
        }
    }

    /// Next container, blocking per the exchange settings.
    pub fn get(&self) -> Option<Container> {
        self.exchange.get(&self.running)
    }

    pub fn config_set(&self, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
        match (module, param) {
            (module::DVS, dvs::RUN) => {
                let (command, run) = if value != 0 {
                    (RUN_COMMAND, true)
                } else {
                    (HALT_COMMAND, false)
                };
                self.writer.write_command(command).map_err(|error| {
                    device_log!(self.config.log, Debug, %error, "run command rejected");
                    ConfigError::Device(error.to_string())
                })?;
                self.device_running.store(run, Ordering::Release);
                Ok(())
            }
            (module::DVS, dvs::TIMESTAMP_RESET) => {
                if value != 0 {
                    self.reset_request.store(true, Ordering::Release);
                }
                Ok(())
            }
            _ => self.config.set(module, param, value),
        }
    }

    pub fn config_get(&self, module: i8, param: u8) -> Result<u32, ConfigError> {
        match (module, param) {
            (module::DVS, dvs::RUN) => Ok(u32::from(self.device_running.load(Ordering::Acquire))),
            (module::DVS, dvs::TIMESTAMP_RESET) => Ok(0),
            _ => self.config.get(module, param),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            label: self.config.log.label().to_string(),
            geometry: self.geometry,
            running: self.is_running(),
        }
    }
}

impl<P: SerialPort> Drop for SerialSession<P> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

/// Final state of one asynchronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Stall,
    Error,
    Cancelled,
    NoDevice,
}

/// Receives transfer completions.
pub trait TransferHandler: Send + Sync {
    /// Called once per submitted transfer, from whichever thread the backend
    /// completes it on. `data` is the transferred part of the buffer.
    fn callback(&self, id: usize, status: TransferStatus, data: &[u8]);
}

/// Asynchronous transfer engine of a device.
pub trait TransferBackend: Send + Sync + 'static {
    /// Queues transfer `id` of `size` bytes; its completion is reported to
    /// `handler` exactly once.
    fn submit(
        &self,
        id: usize,
        size: usize,
        handler: Arc<dyn TransferHandler>,
    ) -> Result<(), SessionError>;

    /// Requests cancellation of transfer `id`. Cancelled transfers still
    /// complete; cancelling an idle id does nothing.
    fn cancel(&self, id: usize);
}

struct TransferShared<B, D> {
    me: Weak<TransferShared<B, D>>,
    backend: Arc<B>,
    producer: Mutex<Producer<D>>,
    running: Arc<AtomicBool>,
    active: AtomicUsize,
    transfer_size: AtomicUsize,
    on_shutdown: Mutex<Option<NotifyFn>>,
    config: SessionConfig,
}

impl<B, D> TransferShared<B, D>
where
    B: TransferBackend,
    D: ProtocolDecoder + 'static,
{
    fn submit(&self, id: usize) -> Result<(), SessionError> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| SessionError::Submit("session dropped".to_string()))?;
        let handler: Arc<dyn TransferHandler> = me;
        self.backend
            .submit(id, self.transfer_size.load(Ordering::Relaxed), handler)
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 && self.running.swap(false, Ordering::AcqRel) {
            device_log!(self.config.log, Critical, "all transfers ended, shutting down");
            let callback = self.on_shutdown.lock().clone();
            fire_shutdown(&callback);
        }
    }
}

impl<B, D> TransferHandler for TransferShared<B, D>
where
    B: TransferBackend,
    D: ProtocolDecoder + 'static,
{
    fn callback(&self, id: usize, status: TransferStatus, data: &[u8]) {
        let running = self.running.load(Ordering::Acquire);

        if status == TransferStatus::Completed && running {
            self.producer.lock().process(data);
        }

        match status {
            TransferStatus::Cancelled => {}
            TransferStatus::NoDevice => {
                device_log!(self.config.log, Critical, id, "device disconnected");
            }
            TransferStatus::Completed => {}
            other => {
                device_log!(self.config.log, Notice, id, status = ?other, "transfer failed, resubmitting");
            }
        }

        let resubmit = running
            && !matches!(status, TransferStatus::Cancelled | TransferStatus::NoDevice);
        if resubmit {
            match self.submit(id) {
                Ok(()) => return,
                Err(error) => {
                    device_log!(self.config.log, Critical, id, %error, "failed to resubmit transfer");
                }
            }
        }

        self.release();
    }
}

/// Device session driven by asynchronous transfer completions.
pub struct TransferSession<B, D>
where
    B: TransferBackend,
    D: ProtocolDecoder + 'static,
{
    shared: Arc<TransferShared<B, D>>,
    exchange: Arc<DataExchange>,
    stats: SharedStats,
    geometry: SensorGeometry,
    submitted: usize,
    started: bool,
}

impl<B, D> TransferSession<B, D>
where
    B: TransferBackend,
    D: ProtocolDecoder + 'static,
{
    pub fn new(backend: B, decoder: D, config: SessionConfig) -> Self {
        let exchange = Arc::new(DataExchange::new(Arc::clone(&config.exchange)));
        let running = Arc::new(AtomicBool::new(false));
        let geometry = decoder.geometry();
        let producer = Producer::new(
            decoder,
            Arc::clone(&config.packets),
            Arc::clone(&exchange),
            Arc::clone(&running),
            Arc::clone(&config.log),
        );
        let stats = producer.shared_stats();

        let shared = Arc::new_cyclic(|me| TransferShared {
            me: me.clone(),
            backend: Arc::new(backend),
            producer: Mutex::new(producer),
            running,
            active: AtomicUsize::new(0),
            transfer_size: AtomicUsize::new(0),
            on_shutdown: Mutex::new(None),
            config,
        });

        Self {
            shared,
            exchange,
            stats,
            geometry,
            submitted: 0,
            started: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.shared.backend
    }

    pub fn exchange(&self) -> &Arc<DataExchange> {
        &self.exchange
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Transfers currently owned by the backend.
    pub fn active_transfers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Producer counters as of the last completed transfer.
    pub fn stats(&self) -> ProducerStats {
        *self.stats.lock()
    }

    /// Submits the configured number of transfers.
    ///
    /// `on_shutdown` runs once, from a completion, when the last transfer
    /// ends while the session is still running.
    pub fn start(
        &mut self,
        notify: Notifications,
        on_shutdown: Option<NotifyFn>,
    ) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyRunning);
        }

        let shared = &self.shared;
        let count = shared.config.transport.buffer_number() as usize;
        shared
            .transfer_size
            .store(shared.config.transport.buffer_size() as usize, Ordering::Relaxed);
        *shared.on_shutdown.lock() = on_shutdown;

        self.exchange.init(notify);
        shared.producer.lock().start();
        shared.running.store(true, Ordering::Release);

        for id in 0..count {
            shared.active.fetch_add(1, Ordering::AcqRel);
            if let Err(error) = shared.submit(id) {
                shared.active.fetch_sub(1, Ordering::AcqRel);
                device_log!(shared.config.log, Critical, id, %error, "failed to submit transfer");
            }
        }
        self.submitted = count;

        if shared.active.load(Ordering::Acquire) == 0 {
            shared.running.store(false, Ordering::Release);
            shared.producer.lock().stop();
            self.exchange.close();
            return Err(SessionError::Submit(format!(
                "none of {count} transfers could be submitted"
            )));
        }

        self.started = true;
        device_log!(shared.config.log, Info, transfers = count, "acquisition started");
        Ok(())
    }

    /// Cancels every outstanding transfer and waits for them to drain.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if !self.started {
            return Err(SessionError::NotRunning);
        }
        self.started = false;

        let shared = &self.shared;
        shared.running.store(false, Ordering::Release);

        let deadline = Instant::now() + CANCEL_TIMEOUT;
        while shared.active.load(Ordering::Acquire) > 0 {
            for id in 0..self.submitted {
                shared.backend.cancel(id);
            }
            if Instant::now() >= deadline {
                device_log!(
                    shared.config.log,
                    Critical,
                    remaining = shared.active.load(Ordering::Acquire),
                    "transfers did not drain after cancellation"
                );
                break;
            }
            thread::sleep(CANCEL_RETRY);
        }

        shared.producer.lock().stop();
        let dropped = self.exchange.close();
        device_log!(shared.config.log, Info, dropped, "acquisition stopped");
        Ok(())
    }

    /// Next container, blocking per the exchange settings.
    pub fn get(&self) -> Option<Container> {
        self.exchange.get(&self.shared.running)
    }

    pub fn config_set(&self, module: i8, param: u8, value: u32) -> Result<(), ConfigError> {
        self.shared.config.set(module, param, value)
    }

    pub fn config_get(&self, module: i8, param: u8) -> Result<u32, ConfigError> {
        self.shared.config.get(module, param)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            label: self.shared.config.log.label().to_string(),
            geometry: self.geometry,
            running: self.is_running(),
        }
    }
}

impl<B, D> Drop for TransferSession<B, D>
where
    B: TransferBackend,
    D: ProtocolDecoder + 'static,
{
    fn drop(&mut self) {
        if self.started {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{dataexchange, packets};
    use crate::types::PolarityEvent;
    use std::collections::VecDeque;

    fn frame(x: u8, y: u8, polarity: bool, ts: u16) -> [u8; 4] {
        let [hi, lo] = ts.to_be_bytes();
        [0x80 | y, (u8::from(polarity) << 7) | x, hi, lo]
    }

    fn config(label: &str) -> SessionConfig {
        let config = SessionConfig::new(label);
        config
            .set(module::PACKETS, packets::MAX_CONTAINER_PACKET_SIZE, 2)
            .unwrap();
        config
    }

    fn wait_for(exchange: &DataExchange) -> Container {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(container) = exchange.try_get() {
                return container;
            }
            assert!(Instant::now() < deadline, "no container delivered");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[derive(Default)]
    struct MockPort {
        reads: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl MockPort {
        fn with_reads(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: Mutex::new(reads.into()),
                written: Mutex::default(),
            }
        }
    }

    impl SerialPort for MockPort {
        fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            let next = self.reads.lock().pop_front();
            match next {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(error)) => Err(error),
                None => {
                    thread::sleep(timeout);
                    Ok(0)
                }
            }
        }

        fn write(&self, data: &[u8]) -> io::Result<()> {
            self.written.lock().push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_serial_session_delivers_and_sends_run_commands() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&frame(1, 2, true, 10));
        bytes.extend_from_slice(&frame(3, 4, false, 20));
        let port = MockPort::with_reads(vec![Ok(bytes)]);

        let mut session = SerialSession::new(port, config("serial-test"));
        session.start(Notifications::new(), None).unwrap();
        assert!(matches!(
            session.start(Notifications::new(), None),
            Err(SessionError::AlreadyRunning)
        ));

        let container = wait_for(session.exchange());
        assert_eq!(
            container.polarity().unwrap().events(),
            &[
                PolarityEvent::new(1, 2, true, 10),
                PolarityEvent::new(3, 4, false, 20)
            ]
        );
        assert_eq!(session.config_get(module::DVS, dvs::RUN), Ok(1));

        session.stop().unwrap();
        assert!(!session.is_running());
        assert!(matches!(session.stop(), Err(SessionError::NotRunning)));
        assert_eq!(
            session.port.written.lock().as_slice(),
            &[RUN_COMMAND.to_vec(), HALT_COMMAND.to_vec()]
        );
    }

    #[test]
    fn test_serial_session_without_producer_commands() {
        let config = config("quiet");
        config
            .set(module::DATAEXCHANGE, dataexchange::START_PRODUCERS, 0)
            .unwrap();
        let mut session = SerialSession::new(MockPort::default(), config);

        session.start(Notifications::new(), None).unwrap();
        session.stop().unwrap();
        assert!(session.port.written.lock().is_empty());
    }

    #[test]
    fn test_serial_read_failure_shuts_down_once() {
        let port = MockPort::with_reads(vec![Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "unplugged",
        ))]);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shutdowns);

        let mut session = SerialSession::new(port, config("fatal"));
        session
            .start(
                Notifications::new(),
                Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while session.is_running() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(session.get().map(|c| c.len()), None);
        session.stop().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accessors_answer_while_reset_waits_for_space() {
        let config = config("backpressure");
        config.set(module::PACKETS, packets::MAX_CONTAINER_PACKET_SIZE, 1).unwrap();
        config
            .set(module::DATAEXCHANGE, dataexchange::BUFFER_SIZE, 1)
            .unwrap();
        let port = MockPort::with_reads(vec![Ok(frame(1, 1, true, 10).to_vec())]);

        let mut session = SerialSession::new(port, config);
        session.start(Notifications::new(), None).unwrap();

        // The first frame fills the only slot.
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.exchange().len() < 1 {
            assert!(Instant::now() < deadline, "first container never arrived");
            thread::sleep(Duration::from_millis(1));
        }

        // The next frame performs the host reset, whose marker must wait.
        session.config_set(module::DVS, dvs::TIMESTAMP_RESET, 1).unwrap();
        session
            .port
            .reads
            .lock()
            .push_back(Ok(frame(2, 2, true, 20).to_vec()));
        while !session.port.reads.lock().is_empty() || session.stats().resets == 0 {
            assert!(Instant::now() < deadline, "reset frame never decoded");
            thread::sleep(Duration::from_millis(1));
        }

        let (tx, rx) = std::sync::mpsc::channel();
        thread::scope(|scope| {
            let session = &session;
            scope.spawn(move || {
                let info = session.info();
                let stats = session.stats();
                let _ = tx.send((info, stats));
            });

            let (info, stats) = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("accessors blocked behind the producer");
            assert_eq!(info.geometry, SensorGeometry::new(128, 128));
            assert!(info.running);
            assert_eq!(stats.resets, 1);

            let data = session.get().unwrap();
            assert_eq!(data.event_count(crate::types::EventKind::Polarity), 1);
            assert!(session.get().unwrap().is_timestamp_reset());
        });

        session.stop().unwrap();
    }

    #[test]
    fn test_serial_config_device_module() {
        let session = SerialSession::new(MockPort::default(), config("config"));

        session.config_set(module::DVS, dvs::TIMESTAMP_RESET, 1).unwrap();
        assert!(session.reset_request.load(Ordering::SeqCst));
        assert_eq!(session.config_get(module::DVS, dvs::TIMESTAMP_RESET), Ok(0));

        session.config_set(module::DVS, dvs::RUN, 1).unwrap();
        session.config_set(module::DVS, dvs::RUN, 0).unwrap();
        assert_eq!(session.config_get(module::DVS, dvs::RUN), Ok(0));
        assert_eq!(session.port.written.lock().len(), 2);

        assert!(session.config_set(module::DVS, 7, 1).is_err());
        assert_eq!(session.info().geometry, SensorGeometry::new(128, 128));
    }

    #[derive(Default)]
    struct MockBackend {
        pending: Mutex<Vec<(usize, Arc<dyn TransferHandler>)>>,
        submissions: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl MockBackend {
        fn complete(&self, id: usize, status: TransferStatus, data: &[u8]) {
            let handler = {
                let mut pending = self.pending.lock();
                let index = pending
                    .iter()
                    .position(|(pending_id, _)| *pending_id == id)
                    .expect("transfer not pending");
                pending.remove(index).1
            };
            handler.callback(id, status, data);
        }
    }

    impl TransferBackend for MockBackend {
        fn submit(
            &self,
            id: usize,
            size: usize,
            handler: Arc<dyn TransferHandler>,
        ) -> Result<(), SessionError> {
            assert_eq!(size, 8192);
            self.submissions.fetch_add(1, Ordering::SeqCst);
            self.pending.lock().push((id, handler));
            Ok(())
        }

        fn cancel(&self, id: usize) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            let is_pending = self.pending.lock().iter().any(|(p, _)| *p == id);
            if is_pending {
                self.complete(id, TransferStatus::Cancelled, &[]);
            }
        }
    }

    fn transfer_session() -> TransferSession<MockBackend, FrameDecoder> {
        let config = config("transfer-test");
        config.set(module::USB, crate::config::usb::BUFFER_NUMBER, 2).unwrap();
        TransferSession::new(MockBackend::default(), FrameDecoder::default(), config)
    }

    #[test]
    fn test_transfer_session_lifecycle() {
        let mut session = transfer_session();
        session.start(Notifications::new(), None).unwrap();
        assert_eq!(session.active_transfers(), 2);

        let mut bytes = frame(5, 6, true, 100).to_vec();
        bytes.extend_from_slice(&frame(7, 8, true, 200));
        session.backend().complete(0, TransferStatus::Completed, &bytes);

        assert_eq!(session.backend().submissions.load(Ordering::SeqCst), 3);
        assert_eq!(session.active_transfers(), 2);

        let container = session.get().unwrap();
        assert_eq!(container.event_count(crate::types::EventKind::Polarity), 2);

        session.backend().complete(1, TransferStatus::TimedOut, &[]);
        assert_eq!(session.active_transfers(), 2);

        session.stop().unwrap();
        assert_eq!(session.active_transfers(), 0);
        assert!(session.backend().cancels.load(Ordering::SeqCst) >= 2);
        assert!(session.backend().pending.lock().is_empty());
    }

    #[test]
    fn test_transfer_device_loss_shuts_down_once() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shutdowns);

        let mut session = transfer_session();
        session
            .start(
                Notifications::new(),
                Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        session.backend().complete(0, TransferStatus::NoDevice, &[]);
        assert!(session.is_running());
        session.backend().complete(1, TransferStatus::NoDevice, &[]);

        assert!(!session.is_running());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        session.stop().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
