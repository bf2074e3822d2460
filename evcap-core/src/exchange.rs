//! Bounded container queue between the producer and the consumer.
//!
//! The producer hands over containers with [`DataExchange::put`], which never
//! blocks and rejects work when the queue is full, or with
//! [`DataExchange::put_force`] for containers that must not be lost. The
//! consumer retrieves them with [`DataExchange::get`]. Both blocking calls
//! observe a session running flag so a stopping session never hangs in them.

use crate::container::Container;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default queue capacity in containers.
pub const DEFAULT_BUFFER_SIZE: u32 = 64;

/// Interval at which blocked callers re-check their running flag.
const RUNNING_POLL: Duration = Duration::from_millis(1);

/// Callback type for queue notifications.
pub type NotifyFn = Arc<dyn Fn() + Send + Sync>;

/// Consumer-side notifications.
#[derive(Clone, Default)]
pub struct Notifications {
    on_grow: Option<NotifyFn>,
    on_shrink: Option<NotifyFn>,
    on_high_watermark: Option<NotifyFn>,
    on_low_watermark: Option<NotifyFn>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when the queue goes from empty to non-empty.
    pub fn on_grow(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_grow = Some(Arc::new(callback));
        self
    }

    /// Called when the queue goes from non-empty to empty.
    pub fn on_shrink(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shrink = Some(Arc::new(callback));
        self
    }

    /// Called when occupancy rises to the high watermark.
    pub fn on_high_watermark(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_high_watermark = Some(Arc::new(callback));
        self
    }

    /// Called when occupancy falls to the low watermark.
    pub fn on_low_watermark(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_low_watermark = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for Notifications {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifications")
            .field("on_grow", &self.on_grow.is_some())
            .field("on_shrink", &self.on_shrink.is_some())
            .field("on_high_watermark", &self.on_high_watermark.is_some())
            .field("on_low_watermark", &self.on_low_watermark.is_some())
            .finish()
    }
}

/// Runtime-adjustable exchange settings.
#[derive(Debug)]
pub struct ExchangeSettings {
    buffer_size: AtomicU32,
    blocking: AtomicBool,
    start_producers: AtomicBool,
    stop_producers: AtomicBool,
    low_watermark: AtomicU32,
    high_watermark: AtomicU32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            buffer_size: AtomicU32::new(DEFAULT_BUFFER_SIZE),
            blocking: AtomicBool::new(true),
            start_producers: AtomicBool::new(true),
            stop_producers: AtomicBool::new(true),
            low_watermark: AtomicU32::new(0),
            high_watermark: AtomicU32::new(0),
        }
    }
}

impl ExchangeSettings {
    /// Queue capacity, applied on the next [`DataExchange::init`].
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_buffer_size(&self, size: u32) {
        self.buffer_size.store(size, Ordering::Relaxed);
    }

    /// Whether [`DataExchange::get`] waits for data.
    pub fn blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// Whether starting the session also starts the device.
    pub fn start_producers(&self) -> bool {
        self.start_producers.load(Ordering::Relaxed)
    }

    pub fn set_start_producers(&self, start: bool) {
        self.start_producers.store(start, Ordering::Relaxed);
    }

    /// Whether stopping the session also stops the device.
    pub fn stop_producers(&self) -> bool {
        self.stop_producers.load(Ordering::Relaxed)
    }

    pub fn set_stop_producers(&self, stop: bool) {
        self.stop_producers.store(stop, Ordering::Relaxed);
    }

    /// Occupancy that fires the low watermark notification (0 = off).
    pub fn low_watermark(&self) -> u32 {
        self.low_watermark.load(Ordering::Relaxed)
    }

    pub fn set_low_watermark(&self, mark: u32) {
        self.low_watermark.store(mark, Ordering::Relaxed);
    }

    /// Occupancy that fires the high watermark notification (0 = off).
    pub fn high_watermark(&self) -> u32 {
        self.high_watermark.load(Ordering::Relaxed)
    }

    pub fn set_high_watermark(&self, mark: u32) {
        self.high_watermark.store(mark, Ordering::Relaxed);
    }
}

/// Container handed back by a rejected put.
#[derive(Debug)]
pub enum Rejected {
    /// The queue was at capacity.
    Full(Container),
    /// The queue was closed, or the running flag cleared while waiting.
    Closed(Container),
}

impl Rejected {
    pub fn into_inner(self) -> Container {
        match self {
            Rejected::Full(container) | Rejected::Closed(container) => container,
        }
    }
}

struct QueueState {
    queue: VecDeque<Container>,
    capacity: usize,
    closed: bool,
    notify: Notifications,
}

/// Notifications collected under the lock and fired after releasing it.
#[derive(Default)]
struct Fired {
    callbacks: Vec<NotifyFn>,
}

impl Fired {
    fn push(&mut self, callback: &Option<NotifyFn>) {
        if let Some(callback) = callback {
            self.callbacks.push(Arc::clone(callback));
        }
    }

    fn run(self) {
        for callback in self.callbacks {
            callback();
        }
    }
}

/// Bounded FIFO of containers shared by one producer and its consumers.
pub struct DataExchange {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    settings: Arc<ExchangeSettings>,
}

impl fmt::Debug for DataExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataExchange")
            .field("len", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl DataExchange {
    /// Creates a closed exchange; call [`Self::init`] before use.
    pub fn new(settings: Arc<ExchangeSettings>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                capacity: 0,
                closed: true,
                notify: Notifications::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    /// Opens the exchange with the configured capacity and notifications,
    /// discarding anything left from a previous run.
    pub fn init(&self, notify: Notifications) {
        let capacity = self.settings.buffer_size().max(1) as usize;
        let mut state = self.state.lock();
        state.queue = VecDeque::with_capacity(capacity);
        state.capacity = capacity;
        state.closed = false;
        state.notify = notify;
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn push_locked(&self, state: &mut QueueState, container: Container) -> Fired {
        let mut fired = Fired::default();
        state.queue.push_back(container);
        let len = state.queue.len();

        if len == 1 {
            fired.push(&state.notify.on_grow);
        }
        let high = self.settings.high_watermark() as usize;
        if high > 0 && len == high {
            fired.push(&state.notify.on_high_watermark);
        }

        self.not_empty.notify_one();
        fired
    }

    fn pop_locked(&self, state: &mut QueueState) -> Option<(Container, Fired)> {
        let container = state.queue.pop_front()?;
        let mut fired = Fired::default();
        let len = state.queue.len();

        if len == 0 {
            fired.push(&state.notify.on_shrink);
        }
        let low = self.settings.low_watermark() as usize;
        if low > 0 && len == low {
            fired.push(&state.notify.on_low_watermark);
        }

        self.not_full.notify_one();
        Some((container, fired))
    }

    /// Enqueues without blocking; hands the container back if the queue is
    /// full or closed.
    pub fn put(&self, container: Container) -> Result<(), Rejected> {
        let fired = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Rejected::Closed(container));
            }
            if state.queue.len() >= state.capacity {
                return Err(Rejected::Full(container));
            }
            self.push_locked(&mut state, container)
        };
        fired.run();
        Ok(())
    }

    /// Enqueues, waiting for room as long as `running` holds and the queue is open.
    pub fn put_force(&self, container: Container, running: &AtomicBool) -> Result<(), Rejected> {
        let fired = {
            let mut state = self.state.lock();
            loop {
                if state.closed || !running.load(Ordering::Acquire) {
                    return Err(Rejected::Closed(container));
                }
                if state.queue.len() < state.capacity {
                    break self.push_locked(&mut state, container);
                }
                self.not_full.wait_for(&mut state, RUNNING_POLL);
            }
        };
        fired.run();
        Ok(())
    }

    /// Dequeues without blocking.
    pub fn try_get(&self) -> Option<Container> {
        let (container, fired) = {
            let mut state = self.state.lock();
            self.pop_locked(&mut state)?
        };
        fired.run();
        Some(container)
    }

    /// Dequeues the next container.
    ///
    /// In blocking mode waits while `running` holds; queued containers are
    /// still returned after the flag clears. Returns `None` once the queue is
    /// empty and either closed or no longer running.
    pub fn get(&self, running: &AtomicBool) -> Option<Container> {
        if !self.settings.blocking() {
            return self.try_get();
        }

        let (container, fired) = {
            let mut state = self.state.lock();
            loop {
                if let Some(popped) = self.pop_locked(&mut state) {
                    break popped;
                }
                if state.closed || !running.load(Ordering::Acquire) {
                    return None;
                }
                self.not_empty.wait_for(&mut state, RUNNING_POLL);
            }
        };
        fired.run();
        Some(container)
    }

    /// Frees every queued container, returning how many were dropped.
    pub fn drain(&self) -> usize {
        let (dropped, fired) = {
            let mut state = self.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();

            let mut fired = Fired::default();
            if dropped > 0 {
                fired.push(&state.notify.on_shrink);
            }
            self.not_full.notify_all();
            (dropped, fired)
        };
        fired.run();
        dropped
    }

    /// Rejects further puts, frees the queue and releases every blocked caller.
    pub fn close(&self) -> usize {
        self.state.lock().closed = true;
        let dropped = self.drain();
        self.not_empty.notify_all();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{CommitTrigger, ContainerGenerator, PacketSettings};
    use crate::types::PolarityEvent;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn container(ts: i32) -> Container {
        let mut generator = ContainerGenerator::new(Arc::new(PacketSettings::default()));
        generator
            .reserve_polarity(1, 0)
            .unwrap()
            .append(PolarityEvent::new(0, 0, true, ts));
        generator
            .commit(CommitTrigger::Size, i64::from(ts), 0)
            .unwrap()
            .data
            .unwrap()
    }

    fn exchange(capacity: u32) -> DataExchange {
        let settings = Arc::new(ExchangeSettings::default());
        settings.set_buffer_size(capacity);
        let exchange = DataExchange::new(settings);
        exchange.init(Notifications::new());
        exchange
    }

    fn first_ts(container: &Container) -> i32 {
        container.polarity().unwrap().events()[0].timestamp
    }

    #[test]
    fn test_fifo_order() {
        let exchange = exchange(4);
        let running = AtomicBool::new(true);
        for ts in 0..3 {
            exchange.put(container(ts)).unwrap();
        }
        for ts in 0..3 {
            assert_eq!(first_ts(&exchange.get(&running).unwrap()), ts);
        }
    }

    #[test]
    fn test_put_rejects_when_full() {
        let exchange = exchange(1);
        exchange.put(container(1)).unwrap();
        let rejected = exchange.put(container(2)).unwrap_err();
        assert!(matches!(rejected, Rejected::Full(_)));
        assert_eq!(first_ts(&rejected.into_inner()), 2);
        assert_eq!(exchange.len(), 1);
    }

    #[test]
    fn test_closed_before_init() {
        let exchange = DataExchange::new(Arc::new(ExchangeSettings::default()));
        assert!(matches!(exchange.put(container(0)), Err(Rejected::Closed(_))));
    }

    #[test]
    fn test_get_returns_none_when_stopped() {
        let exchange = exchange(4);
        let running = AtomicBool::new(false);
        assert!(exchange.get(&running).is_none());
    }

    #[test]
    fn test_non_blocking_get() {
        let exchange = exchange(4);
        exchange.settings().set_blocking(false);
        let running = AtomicBool::new(true);
        assert!(exchange.get(&running).is_none());
    }

    #[test]
    fn test_put_force_waits_for_consumer() {
        let exchange = Arc::new(exchange(1));
        let running = Arc::new(AtomicBool::new(true));
        exchange.put(container(1)).unwrap();

        let consumer = {
            let exchange = Arc::clone(&exchange);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                exchange.get(&running)
            })
        };

        exchange.put_force(container(2), &running).unwrap();
        assert_eq!(first_ts(&consumer.join().unwrap().unwrap()), 1);
        assert_eq!(first_ts(&exchange.try_get().unwrap()), 2);
    }

    #[test]
    fn test_put_force_released_by_close() {
        let exchange = Arc::new(exchange(1));
        let running = Arc::new(AtomicBool::new(true));
        exchange.put(container(1)).unwrap();

        let closer = {
            let exchange = Arc::clone(&exchange);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                exchange.close()
            })
        };

        let result = exchange.put_force(container(2), &running);
        assert!(matches!(result, Err(Rejected::Closed(_))));
        assert_eq!(closer.join().unwrap(), 1);
        assert!(exchange.is_empty());
    }

    #[test]
    fn test_notifications() {
        let grow = Arc::new(AtomicUsize::new(0));
        let shrink = Arc::new(AtomicUsize::new(0));
        let high = Arc::new(AtomicUsize::new(0));
        let low = Arc::new(AtomicUsize::new(0));

        let settings = Arc::new(ExchangeSettings::default());
        settings.set_buffer_size(8);
        settings.set_high_watermark(3);
        settings.set_low_watermark(1);
        let exchange = DataExchange::new(settings);

        let counter = |count: &Arc<AtomicUsize>| {
            let count = Arc::clone(count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        exchange.init(
            Notifications::new()
                .on_grow(counter(&grow))
                .on_shrink(counter(&shrink))
                .on_high_watermark(counter(&high))
                .on_low_watermark(counter(&low)),
        );

        for ts in 0..3 {
            exchange.put(container(ts)).unwrap();
        }
        assert_eq!(grow.load(Ordering::SeqCst), 1);
        assert_eq!(high.load(Ordering::SeqCst), 1);

        while exchange.try_get().is_some() {}
        assert_eq!(low.load(Ordering::SeqCst), 1);
        assert_eq!(shrink.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_drains_and_rejects() {
        let exchange = exchange(4);
        exchange.put(container(1)).unwrap();
        exchange.put(container(2)).unwrap();

        assert_eq!(exchange.close(), 2);
        assert!(exchange.is_closed());
        assert!(matches!(exchange.put(container(3)), Err(Rejected::Closed(_))));

        exchange.init(Notifications::new());
        exchange.put(container(4)).unwrap();
        assert_eq!(exchange.len(), 1);
    }
}
