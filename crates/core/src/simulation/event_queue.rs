//! Event queue over virtual time.
//!
//! Events fire by timestamp, then by enqueue order. Cancelled events stay in
//! the heap and are skipped when they surface.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, BinaryHeap, VecDeque},
    fmt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Deferred work executed when the event fires.
pub type EventAction = Box<dyn FnOnce()>;

pub struct Event {
    /// Virtual nanos
    pub timestamp: u64,
    pub id: EventId,
    /// Shown in traces and the event log
    pub label: &'static str,
    action: EventAction,
}

impl Event {
    /// Consumes the event and runs its action.
    pub fn fire(self) {
        (self.action)()
    }

    fn record(&self) -> EventRecord {
        EventRecord {
            timestamp: self.timestamp,
            id: self.id,
            label: self.label,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("timestamp", &self.timestamp)
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap
        match other.timestamp.cmp(&self.timestamp) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

/// Entry of the processed-event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp: u64,
    pub id: EventId,
    pub label: &'static str,
}

#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    /// Emit a TRACE line per fired event
    pub trace_events: bool,
    /// Maximum entries kept in the processed-event log (0 disables the log)
    pub event_log_capacity: usize,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            trace_events: false,
            event_log_capacity: 4096,
        }
    }
}

/// Priority queue of pending events plus the simulation clock.
///
/// Time only moves forward when an event is stepped or when the caller
/// explicitly advances it.
pub struct EventQueue {
    /// Current virtual time in nanoseconds
    now: u64,
    heap: BinaryHeap<Event>,
    /// Ids still in `heap` and not cancelled
    live: BTreeSet<EventId>,
    next_event_id: u64,
    event_log: VecDeque<EventRecord>,
    config: EventQueueConfig,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_config(EventQueueConfig::default())
    }

    pub fn with_config(config: EventQueueConfig) -> Self {
        Self {
            now: 0,
            heap: BinaryHeap::new(),
            live: BTreeSet::new(),
            next_event_id: 0,
            event_log: VecDeque::new(),
            config,
        }
    }

    /// Virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn pending_count(&self) -> usize {
        self.live.len()
    }

    /// Processed events, oldest first.
    pub fn event_log(&self) -> impl Iterator<Item = &EventRecord> {
        self.event_log.iter()
    }

    /// Timestamps in the past are clamped to now.
    pub fn schedule_at(
        &mut self,
        timestamp: u64,
        label: &'static str,
        action: EventAction,
    ) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.live.insert(id);
        self.heap.push(Event {
            timestamp: timestamp.max(self.now),
            id,
            label,
            action,
        });
        id
    }

    pub fn schedule_after(
        &mut self,
        delay: u64,
        label: &'static str,
        action: EventAction,
    ) -> EventId {
        let timestamp = self.now.saturating_add(delay);
        self.schedule_at(timestamp, label, action)
    }

    /// Returns false if `id` already fired or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.live.remove(&id)
    }

    fn discard_cancelled(&mut self) {
        while let Some(head) = self.heap.peek() {
            if self.live.contains(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_event_time(&mut self) -> Option<u64> {
        self.discard_cancelled();
        self.heap.peek().map(|e| e.timestamp)
    }

    /// Pops the next live event and moves the clock to it. The caller fires
    /// it, after releasing the queue.
    pub fn step(&mut self) -> Option<Event> {
        self.discard_cancelled();
        let event = self.heap.pop()?;
        self.live.remove(&event.id);

        if event.timestamp > self.now {
            self.now = event.timestamp;
        }

        if self.config.trace_events {
            tracing::trace!(
                timestamp = event.timestamp,
                id = event.id.0,
                label = event.label,
                "Processing event"
            );
        }

        if self.config.event_log_capacity > 0 {
            if self.event_log.len() == self.config.event_log_capacity {
                self.event_log.pop_front();
            }
            self.event_log.push_back(event.record());
        }
        Some(event)
    }

    /// Moves the clock forward to `target`; never backwards.
    pub fn advance_to(&mut self, target: u64) {
        self.now = self.now.max(target);
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("now", &self.now)
            .field("pending_count", &self.pending_count())
            .field("event_log_len", &self.event_log.len())
            .finish()
    }
}
