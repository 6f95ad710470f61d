//! Time-ordered event queue with cancellable handles.
//!
//! Events are keyed by `(due time, insertion sequence)`, so events due at the
//! same instant pop in the order they were scheduled. Cancellation removes the
//! entry from the queue immediately; a cancelled event can never be popped.
//! Cancelled slots are remembered only until the queue pops past them, after
//! which cancelling the handle again reports it as executed.

use std::collections::{BTreeMap, BTreeSet};

use crate::{EntityId, Event, EventId, EventPayload, SchedulingError, SimTime};

/// Handle returned when an event is scheduled, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle {
    time: SimTime,
    id: EventId,
}

impl EventHandle {
    /// Due time of the referenced event.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Identifier of the referenced event.
    pub fn id(&self) -> EventId {
        self.id
    }
}

/// Priority queue of pending events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<(SimTime, EventId), Event>,
    cancelled: BTreeSet<(SimTime, EventId)>,
    next_id: u64,
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event at an absolute time.
    pub fn push(
        &mut self,
        time: SimTime,
        source: EntityId,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> EventHandle {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.events.insert(
            (time, id),
            Event {
                id,
                time,
                source,
                targets,
                payload,
            },
        );
        EventHandle { time, id }
    }

    /// Remove a pending event.
    ///
    /// Fails without side effects when the handle is unknown, was already
    /// cancelled, or its event has already been popped.
    pub fn cancel(&mut self, handle: EventHandle) -> Result<(), SchedulingError> {
        if handle.id.0 >= self.next_id {
            return Err(SchedulingError::UnknownHandle(handle.id));
        }
        let key = (handle.time, handle.id);
        if self.cancelled.contains(&key) {
            return Err(SchedulingError::AlreadyCancelled(handle.id));
        }
        match self.events.remove(&key) {
            Some(_) => {
                self.cancelled.insert(key);
                Ok(())
            }
            None => Err(SchedulingError::AlreadyExecuted(handle.id)),
        }
    }

    /// Whether the handle refers to an event that is still queued.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.events.contains_key(&(handle.time, handle.id))
    }

    /// Due time of the earliest event.
    pub fn peek_time(&self) -> Option<SimTime> {
        self.events.keys().next().map(|(time, _)| *time)
    }

    /// Remove and return the earliest event.
    pub fn pop(&mut self) -> Option<Event> {
        let (key, event) = self.events.pop_first()?;
        // Slots before `key` can no longer be reached.
        self.cancelled = self.cancelled.split_off(&key);
        Some(event)
    }

    /// Drop every queued event, returning how many were discarded.
    pub fn discard_all(&mut self) -> usize {
        let count = self.events.len();
        self.events.clear();
        self.cancelled.clear();
        count
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(id: u64) -> EventPayload {
        EventPayload::Timer { timer_id: id }
    }

    fn timer_id(event: &Event) -> u64 {
        match event.payload {
            EventPayload::Timer { timer_id } => timer_id,
            _ => panic!("unexpected payload"),
        }
    }

    #[test]
    fn test_pop_order() {
        let mut queue = EventQueue::new();
        queue.push(SimTime::from_nanos(30), EntityId(0), vec![], timer(1));
        queue.push(SimTime::from_nanos(10), EntityId(0), vec![], timer(2));
        queue.push(SimTime::from_nanos(30), EntityId(0), vec![], timer(3));
        queue.push(SimTime::from_nanos(20), EntityId(0), vec![], timer(4));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| timer_id(&e)).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_cancel_pending() {
        let mut queue = EventQueue::new();
        let keep = queue.push(SimTime::from_nanos(5), EntityId(0), vec![], timer(1));
        let drop = queue.push(SimTime::from_nanos(5), EntityId(0), vec![], timer(2));

        assert!(queue.cancel(drop).is_ok());
        assert!(!queue.is_pending(drop));
        assert!(queue.is_pending(keep));
        assert_eq!(queue.len(), 1);
        assert_eq!(timer_id(&queue.pop().unwrap()), 1);
    }

    #[test]
    fn test_cancel_errors() {
        let mut queue = EventQueue::new();
        let handle = queue.push(SimTime::from_nanos(5), EntityId(0), vec![], timer(1));

        queue.cancel(handle).unwrap();
        assert_eq!(
            queue.cancel(handle),
            Err(SchedulingError::AlreadyCancelled(handle.id()))
        );

        let executed = queue.push(SimTime::from_nanos(6), EntityId(0), vec![], timer(2));
        queue.pop();
        assert_eq!(
            queue.cancel(executed),
            Err(SchedulingError::AlreadyExecuted(executed.id()))
        );

        let mut other = EventQueue::new();
        assert_eq!(
            other.cancel(handle),
            Err(SchedulingError::UnknownHandle(handle.id()))
        );
    }

    #[test]
    fn test_cancelled_slots_forgotten_once_passed() {
        let mut queue = EventQueue::new();
        let handles: Vec<EventHandle> = (0..100)
            .map(|i| queue.push(SimTime::from_nanos(i), EntityId(0), vec![], timer(i)))
            .collect();
        let last = queue.push(SimTime::from_nanos(1_000), EntityId(0), vec![], timer(999));
        for handle in &handles {
            queue.cancel(*handle).unwrap();
        }
        assert_eq!(queue.cancelled.len(), 100);
        assert_eq!(
            queue.cancel(handles[0]),
            Err(SchedulingError::AlreadyCancelled(handles[0].id()))
        );

        assert_eq!(timer_id(&queue.pop().unwrap()), 999);
        assert!(queue.cancelled.is_empty());
        assert_eq!(
            queue.cancel(last),
            Err(SchedulingError::AlreadyExecuted(last.id()))
        );
    }
}
