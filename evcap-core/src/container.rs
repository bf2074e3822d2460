//! Event containers and the commit policy that produces them.
//!
//! The [`ContainerGenerator`] owns one in-progress buffer per event kind. After
//! each decoded symbol the producer asks it whether a commit is due; a commit
//! moves every non-empty buffer into an immutable [`Container`].

use crate::buffer::{BufferError, EventBuffer};
use crate::types::{
    full_timestamp, EventKind, Imu6Event, PolarityEvent, SpecialEvent, SpecialEventType,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// Default number of events of one kind that triggers a commit.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 4096;

/// Default logical time span of one container, in µs.
pub const DEFAULT_MAX_INTERVAL: u32 = 10_000;

/// Upper bound for the capacity a fresh buffer is allocated with.
const MAX_INITIAL_CAPACITY: usize = 4096;

/// Runtime-adjustable commit thresholds.
#[derive(Debug)]
pub struct PacketSettings {
    max_packet_size: AtomicU32,
    max_interval: AtomicU32,
}

impl Default for PacketSettings {
    fn default() -> Self {
        Self {
            max_packet_size: AtomicU32::new(DEFAULT_MAX_PACKET_SIZE),
            max_interval: AtomicU32::new(DEFAULT_MAX_INTERVAL),
        }
    }
}

impl PacketSettings {
    /// Number of events of any one kind that forces a commit (0 = off).
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size.load(Ordering::Relaxed)
    }

    pub fn set_max_packet_size(&self, size: u32) {
        self.max_packet_size.store(size, Ordering::Relaxed);
    }

    /// Logical time span of one container in µs.
    pub fn max_interval(&self) -> u32 {
        self.max_interval.load(Ordering::Relaxed)
    }

    pub fn set_max_interval(&self, interval: u32) {
        self.max_interval.store(interval, Ordering::Relaxed);
    }
}

/// One committed batch of events sharing a logical time window.
///
/// A container always holds at least one non-empty buffer.
#[derive(Debug)]
pub struct Container {
    special: Option<EventBuffer<SpecialEvent>>,
    polarity: Option<EventBuffer<PolarityEvent>>,
    imu6: Option<EventBuffer<Imu6Event>>,
}

impl Container {
    pub fn special(&self) -> Option<&EventBuffer<SpecialEvent>> {
        self.special.as_ref()
    }

    pub fn polarity(&self) -> Option<&EventBuffer<PolarityEvent>> {
        self.polarity.as_ref()
    }

    pub fn imu6(&self) -> Option<&EventBuffer<Imu6Event>> {
        self.imu6.as_ref()
    }

    /// Number of events of one kind.
    pub fn event_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Special => self.special.as_ref().map_or(0, EventBuffer::position),
            EventKind::Polarity => self.polarity.as_ref().map_or(0, EventBuffer::position),
            EventKind::Imu6 => self.imu6.as_ref().map_or(0, EventBuffer::position),
        }
    }

    /// Total number of events across all kinds.
    pub fn len(&self) -> usize {
        EventKind::ALL.iter().map(|&kind| self.event_count(kind)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overflow counter in effect when the container's first event was produced.
    pub fn ts_overflow(&self) -> i32 {
        [
            self.special.as_ref().map(EventBuffer::ts_overflow),
            self.polarity.as_ref().map(EventBuffer::ts_overflow),
            self.imu6.as_ref().map(EventBuffer::ts_overflow),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(0)
    }

    /// Full timestamp range of the data events, ignoring wrap and reset markers.
    pub fn time_span(&self) -> Option<(i64, i64)> {
        let polarity = self.polarity.as_ref().map(|buffer| {
            let overflow = buffer.ts_overflow();
            buffer
                .iter()
                .map(move |event| full_timestamp(overflow, event.timestamp))
        });
        let imu6 = self.imu6.as_ref().map(|buffer| {
            let overflow = buffer.ts_overflow();
            buffer
                .iter()
                .map(move |event| full_timestamp(overflow, event.timestamp))
        });
        let special = self.special.as_ref().map(|buffer| {
            let overflow = buffer.ts_overflow();
            buffer
                .iter()
                .filter(|event| event.timestamp != i32::MAX)
                .map(move |event| full_timestamp(overflow, event.timestamp))
        });

        polarity
            .into_iter()
            .flatten()
            .chain(imu6.into_iter().flatten())
            .chain(special.into_iter().flatten())
            .fold(None, |span, ts| match span {
                None => Some((ts, ts)),
                Some((first, last)) => Some((first.min(ts), last.max(ts))),
            })
    }

    /// Returns true for the dedicated container that carries only a reset marker.
    pub fn is_timestamp_reset(&self) -> bool {
        self.polarity.is_none()
            && self.imu6.is_none()
            && self.special.as_ref().is_some_and(|buffer| {
                buffer.position() == 1
                    && buffer.events()[0].kind == SpecialEventType::TimestampReset
            })
    }

    /// Splits the container into its buffers.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        Option<EventBuffer<SpecialEvent>>,
        Option<EventBuffer<PolarityEvent>>,
        Option<EventBuffer<Imu6Event>>,
    ) {
        (self.special, self.polarity, self.imu6)
    }
}

/// Reason a commit happened, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    TimestampReset,
    TimestampBigWrap,
    Size,
    Time,
    /// End of input, commits whatever is buffered
    Flush,
}

impl CommitTrigger {
    /// Forced commits interrupt composite events in progress.
    pub fn is_forced(self) -> bool {
        matches!(self, Self::TimestampReset | Self::TimestampBigWrap)
    }
}

/// Output of one commit.
#[derive(Debug)]
pub struct Commit {
    pub trigger: CommitTrigger,
    /// Regular data container; `None` when every buffer was empty.
    pub data: Option<Container>,
    /// Solo container carrying the reset marker, only for reset commits.
    pub reset_marker: Option<Container>,
}

/// In-progress buffers plus the commit policy.
#[derive(Debug)]
pub struct ContainerGenerator {
    special: Option<EventBuffer<SpecialEvent>>,
    polarity: Option<EventBuffer<PolarityEvent>>,
    imu6: Option<EventBuffer<Imu6Event>>,
    /// Full timestamp after which the time trigger fires; `None` until the
    /// first timestamp after start or reset.
    deadline: Option<i64>,
    settings: std::sync::Arc<PacketSettings>,
}

fn reserve_slot<E>(
    slot: &mut Option<EventBuffer<E>>,
    additional: usize,
    initial_capacity: usize,
    ts_overflow: i32,
) -> Result<&mut EventBuffer<E>, BufferError> {
    let buffer = match slot.take() {
        Some(mut buffer) => {
            // An empty buffer kept across a commit takes the current overflow.
            buffer.relabel_if_empty(ts_overflow);
            buffer
        }
        None => EventBuffer::with_capacity(initial_capacity.max(additional), ts_overflow)?,
    };
    let buffer = slot.insert(buffer);
    buffer.ensure_capacity(additional)?;
    Ok(buffer)
}

fn take_filled<E>(slot: &mut Option<EventBuffer<E>>) -> Option<EventBuffer<E>> {
    if slot.as_ref().is_some_and(|buffer| !buffer.is_empty()) {
        slot.take()
    } else {
        None
    }
}

impl ContainerGenerator {
    pub fn new(settings: std::sync::Arc<PacketSettings>) -> Self {
        Self {
            special: None,
            polarity: None,
            imu6: None,
            deadline: None,
            settings,
        }
    }

    pub fn settings(&self) -> &PacketSettings {
        &self.settings
    }

    fn initial_capacity(&self) -> usize {
        match self.settings.max_packet_size() {
            0 => MAX_INITIAL_CAPACITY,
            size => (size as usize).min(MAX_INITIAL_CAPACITY),
        }
    }

    /// Returns the special buffer with room for `additional` events, allocating it if needed.
    pub fn reserve_special(
        &mut self,
        additional: usize,
        ts_overflow: i32,
    ) -> Result<&mut EventBuffer<SpecialEvent>, BufferError> {
        let initial = self.initial_capacity();
        reserve_slot(&mut self.special, additional, initial, ts_overflow)
    }

    /// Returns the polarity buffer with room for `additional` events, allocating it if needed.
    pub fn reserve_polarity(
        &mut self,
        additional: usize,
        ts_overflow: i32,
    ) -> Result<&mut EventBuffer<PolarityEvent>, BufferError> {
        let initial = self.initial_capacity();
        reserve_slot(&mut self.polarity, additional, initial, ts_overflow)
    }

    /// Returns the IMU buffer with room for `additional` events, allocating it if needed.
    pub fn reserve_imu6(
        &mut self,
        additional: usize,
        ts_overflow: i32,
    ) -> Result<&mut EventBuffer<Imu6Event>, BufferError> {
        let initial = self.initial_capacity();
        reserve_slot(&mut self.imu6, additional, initial, ts_overflow)
    }

    /// Number of uncommitted events of one kind.
    pub fn pending(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Special => self.special.as_ref().map_or(0, EventBuffer::position),
            EventKind::Polarity => self.polarity.as_ref().map_or(0, EventBuffer::position),
            EventKind::Imu6 => self.imu6.as_ref().map_or(0, EventBuffer::position),
        }
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    /// Arms the time trigger on the first timestamp after start or reset.
    pub fn observe_timestamp(&mut self, full: i64) {
        if self.deadline.is_none() {
            self.deadline = Some(full + i64::from(self.settings.max_interval()) - 1);
        }
    }

    /// Disarms the time trigger until the next timestamp.
    pub fn reset_deadline(&mut self) {
        self.deadline = None;
    }

    fn size_reached(&self) -> bool {
        let max = self.settings.max_packet_size() as usize;
        max > 0 && EventKind::ALL.iter().any(|&kind| self.pending(kind) >= max)
    }

    fn time_elapsed(&self, full: i64) -> bool {
        self.deadline.is_some_and(|deadline| full > deadline)
    }

    /// Returns the trigger that applies after a symbol, if any.
    pub fn check(&self, reset: bool, big_wrap: bool, full: i64) -> Option<CommitTrigger> {
        if reset {
            Some(CommitTrigger::TimestampReset)
        } else if big_wrap {
            Some(CommitTrigger::TimestampBigWrap)
        } else if self.size_reached() {
            Some(CommitTrigger::Size)
        } else if self.time_elapsed(full) {
            Some(CommitTrigger::Time)
        } else {
            None
        }
    }

    /// Commits the filled buffers.
    ///
    /// A big-wrap commit first appends a wrap marker. A reset commit also
    /// builds the solo reset container and disarms the time trigger. Any
    /// elapsed deadline is advanced by whole intervals past `full`.
    pub fn commit(
        &mut self,
        trigger: CommitTrigger,
        full: i64,
        ts_overflow: i32,
    ) -> Result<Commit, BufferError> {
        if trigger == CommitTrigger::TimestampBigWrap {
            self.reserve_special(1, ts_overflow)?
                .append(SpecialEvent::marker(SpecialEventType::TimestampWrap));
        }

        let special = take_filled(&mut self.special);
        let polarity = take_filled(&mut self.polarity);
        let imu6 = take_filled(&mut self.imu6);

        let data = if special.is_none() && polarity.is_none() && imu6.is_none() {
            None
        } else {
            Some(Container {
                special,
                polarity,
                imu6,
            })
        };

        if trigger == CommitTrigger::TimestampReset {
            self.deadline = None;
        } else if let Some(mut deadline) = self.deadline {
            if full > deadline {
                let interval = i64::from(self.settings.max_interval().max(1));
                let behind = full - deadline;
                deadline += (behind + interval - 1) / interval * interval;
            }
            self.deadline = Some(deadline);
        }

        let reset_marker = if trigger == CommitTrigger::TimestampReset {
            let mut buffer = EventBuffer::with_capacity(1, ts_overflow)?;
            buffer.append(SpecialEvent::marker(SpecialEventType::TimestampReset));
            Some(Container {
                special: Some(buffer),
                polarity: None,
                imu6: None,
            })
        } else {
            None
        };

        Ok(Commit {
            trigger,
            data,
            reset_marker,
        })
    }

    /// Frees all uncommitted buffers and disarms the time trigger.
    pub fn clear(&mut self) {
        self.special = None;
        self.polarity = None;
        self.imu6 = None;
        self.deadline = None;
    }
}
