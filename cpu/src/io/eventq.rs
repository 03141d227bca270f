//! Device activity scheduled for a future (simulated) time.
//!
//! Each entry is keyed by the device and a device-chosen tag, so a
//! device can have several independent activities outstanding (a
//! console's receiver and transmitter, say) and can reschedule or
//! cancel each of them.
use std::time::Duration;

use tracing::{event, Level};

use base::collections::pq::KeyedReversePriorityQueue;

use crate::bus::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub device: DeviceId,
    pub tag: u32,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    items: KeyedReversePriorityQueue<EventKey, Duration>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    /// When the earliest entry is due.
    pub fn next_due(&self) -> Option<Duration> {
        self.items.peek().map(|(_, due)| *due)
    }

    /// Remove and return the earliest entry, if it is due at or
    /// before `now`.  Entries due at the same time come out in the
    /// order they were scheduled.
    pub fn pop_due(&mut self, now: Duration) -> Option<(EventKey, Duration)> {
        match self.items.peek() {
            Some((_, due)) if *due <= now => self.items.pop(),
            _ => None,
        }
    }

    /// Schedule an entry, replacing any existing entry with the same
    /// key.  Returns the time for which the replaced entry was due.
    pub fn schedule(&mut self, key: EventKey, due: Duration) -> Option<Duration> {
        let old = self.items.push(key, due);
        if let Some(prev) = old {
            if prev < due {
                event!(
                    Level::TRACE,
                    "{} activity {} pushed back from {:?} to {:?}",
                    key.device,
                    key.tag,
                    prev,
                    due
                );
            }
        }
        old
    }

    pub fn cancel(&mut self, key: &EventKey) -> Option<Duration> {
        self.items.remove(key)
    }

    /// Cancel everything scheduled for `device`.
    pub fn cancel_device(&mut self, device: DeviceId) {
        self.items.remove_matching(|key| key.device == device);
    }

    pub fn is_scheduled(&self, key: &EventKey) -> bool {
        self.items.contains(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
fn key(device: u16, tag: u32) -> EventKey {
    EventKey {
        device: DeviceId::new(device),
        tag,
    }
}

#[test]
fn test_eventq_empty() {
    let mut q = EventQueue::new();
    assert!(q.is_empty());
    assert_eq!(0, q.len());
    assert_eq!(q.next_due(), None);
    assert_eq!(q.pop_due(Duration::MAX), None);
}

#[test]
fn test_eventq_reschedule_replaces() {
    let mut q = EventQueue::new();
    assert_eq!(q.schedule(key(1, 0), Duration::from_micros(200)), None);
    assert_eq!(
        q.schedule(key(1, 0), Duration::from_micros(400)),
        Some(Duration::from_micros(200))
    );
    assert_eq!(q.len(), 1);
    assert_eq!(q.pop_due(Duration::from_micros(399)), None);
    assert_eq!(
        q.pop_due(Duration::from_micros(400)),
        Some((key(1, 0), Duration::from_micros(400)))
    );
    assert!(q.is_empty());
}

#[test]
fn test_eventq_ordering_and_cancellation() {
    let mut q = EventQueue::new();
    let t = Duration::from_millis(5);
    q.schedule(key(2, 0), t);
    q.schedule(key(1, 7), t);
    q.schedule(key(1, 8), Duration::from_millis(1));
    q.schedule(key(3, 0), Duration::from_millis(2));
    assert_eq!(q.cancel(&key(3, 0)), Some(Duration::from_millis(2)));
    assert!(!q.is_scheduled(&key(3, 0)));
    let now = Duration::from_millis(10);
    assert_eq!(q.pop_due(now).map(|(k, _)| k), Some(key(1, 8)));
    // Equal due times come out in scheduling order.
    assert_eq!(q.pop_due(now).map(|(k, _)| k), Some(key(2, 0)));
    q.cancel_device(DeviceId::new(1));
    assert_eq!(q.pop_due(now), None);
}
