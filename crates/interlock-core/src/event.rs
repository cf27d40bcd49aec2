//! Typed interlocking events with per-kind ring buffers.
//!
//! Events are emitted while commands are applied and signals are updated,
//! then delivered in one batch during the post-tick phase. Each kind has its
//! own [`EventBuffer`], allocated on first emit.
//!
//! # Subscriber Types
//!
//! - **Passive listeners**: read-only; logging, displays, scoring.
//! - **Reactive handlers**: return [`Command`]s that are queued for the next
//!   tick, e.g. an automatic dispatcher re-requesting a route.
//!
//! A suppressed kind is never buffered.

use crate::command_queue::Command;
use crate::fixed::Ticks;
use crate::id::*;
use crate::signal::Aspect;
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An interlocking event. All events carry the tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // -- Routes --
    RouteCleared {
        signal: SignalId,
        train: TrainId,
        full: bool,
        tick: Ticks,
    },
    RouteQueued {
        signal: SignalId,
        train: TrainId,
        behind: TrainId,
        tick: Ticks,
    },
    RouteWithdrawn {
        signal: SignalId,
        train: TrainId,
        tick: Ticks,
    },
    AspectChanged {
        signal: SignalId,
        from: Aspect,
        to: Aspect,
        tick: Ticks,
    },

    // -- Sections --
    SectionReserved {
        section: SectionId,
        train: TrainId,
        tick: Ticks,
    },
    SectionReleased {
        section: SectionId,
        train: TrainId,
        tick: Ticks,
    },

    // -- Stations --
    TrainArrived {
        train: TrainId,
        station: String,
        tick: Ticks,
    },
    DepartureCleared {
        train: TrainId,
        tick: Ticks,
    },
    TrainDeparted {
        train: TrainId,
        tick: Ticks,
    },
    ConnectionMissed {
        train: TrainId,
        awaited: String,
        tick: Ticks,
    },

    // -- Pools --
    StorageClaimed {
        pool: PoolId,
        storage: StorageId,
        train: TrainId,
        tick: Ticks,
    },
    TrainStored {
        pool: PoolId,
        storage: StorageId,
        train: TrainId,
        tick: Ticks,
    },
    TurntableRotating {
        pool: PoolId,
        train: TrainId,
        ready_at: Ticks,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for suppression and subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RouteCleared,
    RouteQueued,
    RouteWithdrawn,
    AspectChanged,
    SectionReserved,
    SectionReleased,
    TrainArrived,
    DepartureCleared,
    TrainDeparted,
    ConnectionMissed,
    StorageClaimed,
    TrainStored,
    TurntableRotating,
}

const EVENT_KIND_COUNT: usize = 13;

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RouteCleared { .. } => EventKind::RouteCleared,
            Event::RouteQueued { .. } => EventKind::RouteQueued,
            Event::RouteWithdrawn { .. } => EventKind::RouteWithdrawn,
            Event::AspectChanged { .. } => EventKind::AspectChanged,
            Event::SectionReserved { .. } => EventKind::SectionReserved,
            Event::SectionReleased { .. } => EventKind::SectionReleased,
            Event::TrainArrived { .. } => EventKind::TrainArrived,
            Event::DepartureCleared { .. } => EventKind::DepartureCleared,
            Event::TrainDeparted { .. } => EventKind::TrainDeparted,
            Event::ConnectionMissed { .. } => EventKind::ConnectionMissed,
            Event::StorageClaimed { .. } => EventKind::StorageClaimed,
            Event::TrainStored { .. } => EventKind::TrainStored,
            Event::TurntableRotating { .. } => EventKind::TurntableRotating,
        }
    }

    pub fn tick(&self) -> Ticks {
        match self {
            Event::RouteCleared { tick, .. }
            | Event::RouteQueued { tick, .. }
            | Event::RouteWithdrawn { tick, .. }
            | Event::AspectChanged { tick, .. }
            | Event::SectionReserved { tick, .. }
            | Event::SectionReleased { tick, .. }
            | Event::TrainArrived { tick, .. }
            | Event::DepartureCleared { tick, .. }
            | Event::TrainDeparted { tick, .. }
            | Event::ConnectionMissed { tick, .. }
            | Event::StorageClaimed { tick, .. }
            | Event::TrainStored { tick, .. }
            | Event::TurntableRotating { tick, .. } => *tick,
        }
    }
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity ring buffer. When full, the oldest event is dropped.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<Event>,
    capacity: usize,
    total_written: u64,
}

impl EventBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events written since creation, dropped ones included.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn dropped_count(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity as u64)
    }

    /// Oldest first.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Event> {
        self.events.iter()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub type PassiveListener = Box<dyn FnMut(&Event)>;

/// Receives an event and returns commands to queue for the next tick.
pub type ReactiveHandler = Box<dyn FnMut(&Event) -> Vec<Command>>;

enum Subscriber {
    Passive(PassiveListener),
    Reactive(ReactiveHandler),
}

/// Priority level for event subscribers. Lower priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriberPriority {
    Pre = 0,
    Normal = 1,
    Post = 2,
}

pub type EventFilter = Box<dyn Fn(&Event) -> bool>;

struct SubscriberEntry {
    subscriber: Subscriber,
    priority: SubscriberPriority,
    filter: Option<EventFilter>,
    insertion_order: u64,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// One ring buffer per event kind, subscriber lists and suppression flags.
pub struct EventBus {
    buffers: [Option<EventBuffer>; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    subscribers: [Vec<SubscriberEntry>; EVENT_KIND_COUNT],
    /// Commands returned by reactive handlers, taken by the next pre-tick.
    pending_commands: Vec<Command>,
    default_capacity: usize,
    next_insertion_order: u64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffers", &self.buffers)
            .field("suppressed", &self.suppressed)
            .field("pending_commands", &self.pending_commands)
            .field("default_capacity", &self.default_capacity)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buffers: Default::default(),
            suppressed: [false; EVENT_KIND_COUNT],
            subscribers: std::array::from_fn(|_| Vec::new()),
            pending_commands: Vec::new(),
            default_capacity,
            next_insertion_order: 0,
        }
    }

    /// Stop buffering a kind and drop anything already buffered for it.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.buffers[kind.index()] = None;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    pub fn emit(&mut self, event: Event) {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return;
        }
        let capacity = self.default_capacity;
        self.buffers[idx]
            .get_or_insert_with(|| EventBuffer::new(capacity))
            .push(event);
    }

    pub fn on_passive(&mut self, kind: EventKind, listener: PassiveListener) {
        self.on_passive_filtered(kind, SubscriberPriority::Normal, None, listener);
    }

    pub fn on_reactive(&mut self, kind: EventKind, handler: ReactiveHandler) {
        self.on_reactive_filtered(kind, SubscriberPriority::Normal, None, handler);
    }

    pub fn on_passive_filtered(
        &mut self,
        kind: EventKind,
        priority: SubscriberPriority,
        filter: Option<EventFilter>,
        listener: PassiveListener,
    ) {
        self.subscribe(kind, priority, filter, Subscriber::Passive(listener));
    }

    pub fn on_reactive_filtered(
        &mut self,
        kind: EventKind,
        priority: SubscriberPriority,
        filter: Option<EventFilter>,
        handler: ReactiveHandler,
    ) {
        self.subscribe(kind, priority, filter, Subscriber::Reactive(handler));
    }

    fn subscribe(
        &mut self,
        kind: EventKind,
        priority: SubscriberPriority,
        filter: Option<EventFilter>,
        subscriber: Subscriber,
    ) {
        let insertion_order = self.next_insertion_order;
        self.next_insertion_order += 1;
        let list = &mut self.subscribers[kind.index()];
        list.push(SubscriberEntry {
            subscriber,
            priority,
            filter,
            insertion_order,
        });
        list.sort_by_key(|e| (e.priority, e.insertion_order));
    }

    /// Deliver every buffered event, kind by kind, to subscribers in
    /// `(priority, registration)` order, then clear the buffers.
    pub fn deliver(&mut self) {
        for idx in 0..EVENT_KIND_COUNT {
            let Some(buffer) = self.buffers[idx].as_mut() else {
                continue;
            };
            if buffer.is_empty() {
                continue;
            }
            let events: Vec<Event> = buffer.events.drain(..).collect();

            for entry in &mut self.subscribers[idx] {
                for event in &events {
                    if let Some(filter) = &entry.filter
                        && !filter(event)
                    {
                        continue;
                    }
                    match &mut entry.subscriber {
                        Subscriber::Passive(listener) => listener(event),
                        Subscriber::Reactive(handler) => {
                            self.pending_commands.extend(handler(event));
                        }
                    }
                }
            }
        }
    }

    /// Take the commands collected from reactive handlers.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.pending_commands)
    }

    pub fn buffer(&self, kind: EventKind) -> Option<&EventBuffer> {
        self.buffers[kind.index()].as_ref()
    }

    pub fn buffered_count(&self, kind: EventKind) -> usize {
        self.buffer(kind).map_or(0, EventBuffer::len)
    }

    pub fn total_emitted(&self, kind: EventKind) -> u64 {
        self.buffer(kind).map_or(0, EventBuffer::total_written)
    }

    /// Clear buffers and pending commands. Subscribers and suppression stay.
    pub fn clear_all(&mut self) {
        for buffer in self.buffers.iter_mut().flatten() {
            buffer.clear();
        }
        self.pending_commands.clear();
    }

    pub fn pending_command_count(&self) -> usize {
        self.pending_commands.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
