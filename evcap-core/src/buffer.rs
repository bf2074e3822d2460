//! Growable typed event buffers.
//!
//! A buffer is filled by the container generator and then moved, whole, into a
//! committed container. Growth is explicit: callers reserve room for the events
//! of one symbol with [`EventBuffer::ensure_capacity`] before appending them, so
//! an allocation failure surfaces before any event is written.

use std::collections::TryReserveError;
use std::fmt;
use thiserror::Error;

/// Errors raised while growing a buffer.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("failed to grow {kind} buffer to {requested} events: {source}")]
    Allocation {
        kind: &'static str,
        requested: usize,
        #[source]
        source: TryReserveError,
    },
}

/// Owned, capacity-doubling sequence of one event type.
///
/// Every event in a buffer shares the overflow counter recorded at creation,
/// which together with the event's wrapped timestamp gives its full timestamp.
pub struct EventBuffer<E> {
    events: Vec<E>,
    ts_overflow: i32,
}

impl<E> EventBuffer<E> {
    /// Allocates a buffer for `capacity` events.
    pub fn with_capacity(capacity: usize, ts_overflow: i32) -> Result<Self, BufferError> {
        let mut events = Vec::new();
        events
            .try_reserve_exact(capacity)
            .map_err(|source| BufferError::Allocation {
                kind: std::any::type_name::<E>(),
                requested: capacity,
                source,
            })?;

        Ok(Self {
            events,
            ts_overflow,
        })
    }

    /// Number of valid events.
    #[inline]
    pub fn position(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Overflow counter shared by every event of the buffer.
    #[inline]
    pub fn ts_overflow(&self) -> i32 {
        self.ts_overflow
    }

    /// Relabels an empty buffer with the overflow counter now in effect.
    /// A buffer that already holds events keeps its label.
    #[inline]
    pub fn relabel_if_empty(&mut self, ts_overflow: i32) {
        if self.events.is_empty() {
            self.ts_overflow = ts_overflow;
        }
    }

    /// Makes room for `additional` more events.
    ///
    /// Grows to twice the current capacity, or to exactly the required size if
    /// doubling is not enough. Does nothing when the room already exists.
    pub fn ensure_capacity(&mut self, additional: usize) -> Result<(), BufferError> {
        let required = self.events.len() + additional;
        let capacity = self.events.capacity();

        if required <= capacity {
            return Ok(());
        }

        let target = required.max(capacity.saturating_mul(2));
        self.events
            .try_reserve_exact(target - self.events.len())
            .map_err(|source| BufferError::Allocation {
                kind: std::any::type_name::<E>(),
                requested: target,
                source,
            })
    }

    /// Appends one event. Room must have been reserved beforehand.
    #[inline]
    pub fn append(&mut self, event: E) {
        debug_assert!(self.events.len() < self.events.capacity());
        self.events.push(event);
    }

    /// Valid events, in arrival order.
    #[inline]
    pub fn events(&self) -> &[E] {
        &self.events
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.events.iter()
    }

    /// Consumes the buffer, returning its events.
    pub fn into_events(self) -> Vec<E> {
        self.events
    }
}

impl<E> fmt::Debug for EventBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("position", &self.position())
            .field("capacity", &self.capacity())
            .field("ts_overflow", &self.ts_overflow)
            .finish()
    }
}

impl<'a, E> IntoIterator for &'a EventBuffer<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PolarityEvent;

    #[test]
    fn test_append_and_position() {
        let mut buffer = EventBuffer::with_capacity(4, 0).unwrap();
        buffer.ensure_capacity(1).unwrap();
        buffer.append(PolarityEvent::new(1, 2, true, 10));

        assert_eq!(buffer.position(), 1);
        assert_eq!(buffer.events()[0].x, 1);
        assert!(buffer.position() <= buffer.capacity());
    }

    #[test]
    fn test_growth_doubles() {
        let mut buffer = EventBuffer::<PolarityEvent>::with_capacity(4, 0).unwrap();
        for i in 0..4 {
            buffer.ensure_capacity(1).unwrap();
            buffer.append(PolarityEvent::new(i, 0, false, 0));
        }

        buffer.ensure_capacity(1).unwrap();
        assert!(buffer.capacity() >= 8);
    }

    #[test]
    fn test_growth_exact_fit_when_doubling_is_short() {
        let mut buffer = EventBuffer::<PolarityEvent>::with_capacity(2, 0).unwrap();
        buffer.ensure_capacity(10).unwrap();
        assert!(buffer.capacity() >= 10);
        assert_eq!(buffer.position(), 0);
    }

    #[test]
    fn test_ensure_capacity_is_idempotent() {
        let mut buffer = EventBuffer::with_capacity(16, 3).unwrap();
        buffer.ensure_capacity(1).unwrap();
        buffer.append(PolarityEvent::new(0, 0, true, 1));

        let capacity = buffer.capacity();
        let data = buffer.events().as_ptr();

        buffer.ensure_capacity(8).unwrap();
        buffer.ensure_capacity(8).unwrap();

        assert_eq!(buffer.capacity(), capacity);
        assert_eq!(buffer.events().as_ptr(), data);
        assert_eq!(buffer.position(), 1);
        assert_eq!(buffer.ts_overflow(), 3);
    }

    #[test]
    fn test_relabel_only_while_empty() {
        let mut buffer = EventBuffer::with_capacity(4, 0).unwrap();
        buffer.relabel_if_empty(1);
        assert_eq!(buffer.ts_overflow(), 1);

        buffer.append(PolarityEvent::new(0, 0, true, 5));
        buffer.relabel_if_empty(2);
        assert_eq!(buffer.ts_overflow(), 1);
    }

    #[test]
    fn test_impossible_allocation_reports_error() {
        let mut buffer = EventBuffer::<PolarityEvent>::with_capacity(1, 0).unwrap();
        let result = buffer.ensure_capacity(usize::MAX / 2);
        assert!(matches!(result, Err(BufferError::Allocation { .. })));
        assert_eq!(buffer.position(), 0);
    }
}
