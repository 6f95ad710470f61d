//! # nsim-common
//!
//! Common types and traits for the nsim network simulation kernel.
//!
//! This crate provides core simulation primitives including:
//! - Time representation ([`SimTime`])
//! - Cartesian positions and velocities ([`Vector`])
//! - Entity and topology identification ([`EntityId`], [`NodeId`], [`DeviceId`], [`ChannelId`])
//! - Event system ([`Event`], [`EventPayload`], [`EventQueue`], [`EventHandle`])
//! - Simulation context ([`SimContext`])
//! - Entity traits ([`Entity`]) and the [`EntityRegistry`]
//! - Wire units ([`Datagram`], [`Frame`], [`MacAddress`])
//! - Observable trace events ([`TraceEvent`])

pub mod packet;
pub mod queue;
pub mod trace;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub use packet::{Datagram, Frame, FrameId, MacAddress, DEFAULT_TTL, UDP_IPV4_HEADER_BYTES};
pub use queue::{EventHandle, EventQueue};
pub use trace::{AppRole, DeliveryAnomaly, TraceEvent, TraceKind};

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised when scheduling or cancelling events.
///
/// These are recoverable: the caller decides whether the simulation continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    /// The handle was never issued by this queue.
    #[error("unknown event handle {0:?}")]
    UnknownHandle(EventId),

    /// The event already ran (or was discarded past the stop time).
    #[error("event {0:?} has already executed")]
    AlreadyExecuted(EventId),

    /// The event was cancelled earlier.
    #[error("event {0:?} was already cancelled")]
    AlreadyCancelled(EventId),

    /// An absolute schedule time lies before the current clock.
    #[error("cannot schedule at {requested} before current time {now}")]
    InPast {
        /// Requested due time.
        requested: SimTime,
        /// Clock value at the time of the request.
        now: SimTime,
    },
}

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("Entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Scheduling failure surfaced from an event handler.
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// Event handler error.
    #[error("Event handler error in entity {entity:?}: {message}")]
    HandlerError {
        /// Entity that had the error.
        entity: EntityId,
        /// Error message.
        message: String,
    },
}

// ============================================================================
// Time Types
// ============================================================================

/// Simulation time in nanoseconds since simulation start.
///
/// Also used for durations. Integer resolution keeps replays free of
/// floating point drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Largest representable time.
    pub const MAX: SimTime = SimTime(u64::MAX);

    /// Smallest non-zero duration.
    pub const EPSILON: SimTime = SimTime(1);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float). Negative or NaN inputs map to zero.
    pub fn from_secs(s: f64) -> Self {
        if s.is_nan() || s <= 0.0 {
            return SimTime::ZERO;
        }
        SimTime((s * 1_000_000_000.0).round() as u64)
    }

    /// Get as nanoseconds.
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as microseconds.
    pub const fn as_micros(&self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Add duration to time.
    pub fn add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Subtract duration from time.
    pub fn sub(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_sub(duration.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let frac = self.0 % 1_000_000_000;
        if frac == 0 {
            return write!(f, "{}s", secs);
        }
        let digits = format!("{:09}", frac);
        write!(f, "{}.{}s", secs, digits.trim_end_matches('0'))
    }
}

// ============================================================================
// Spatial Types
// ============================================================================

/// Cartesian vector in metres (positions) or metres per second (velocities).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector {
    /// X component.
    pub x: f64,
    /// Y component.
    pub y: f64,
    /// Z component.
    #[serde(default)]
    pub z: f64,
}

impl Vector {
    /// The origin / zero velocity.
    pub const ZERO: Vector = Vector { x: 0.0, y: 0.0, z: 0.0 };

    /// Create a new vector.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Vector { x, y, z }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &Vector) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Vector length.
    pub fn length(&self) -> f64 {
        self.distance_to(&Vector::ZERO)
    }

    /// Multiply every component by `factor`.
    pub fn scale(&self, factor: f64) -> Vector {
        Vector::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

impl std::ops::Add for Vector {
    type Output = Vector;

    fn add(self, rhs: Self) -> Self::Output {
        Vector::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

// ============================================================================
// Entity Types
// ============================================================================

/// Unique identifier for an entity in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create a new entity ID.
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }
}

macro_rules! topology_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Position of this id in creation order.
            pub fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

topology_id!(
    /// Simulated host. Allocated densely in creation order, never reused.
    NodeId,
    "n"
);
topology_id!(
    /// Network interface attached to exactly one node and one channel.
    DeviceId,
    "d"
);
topology_id!(
    /// Shared medium connecting devices.
    ChannelId,
    "c"
);

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event. Doubles as the insertion sequence number
/// used to break ties between events due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// A simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// Time when the event occurs.
    pub time: SimTime,
    /// Entity that created the event.
    pub source: EntityId,
    /// Target entities for the event.
    pub targets: Vec<EntityId>,
    /// Event payload.
    pub payload: EventPayload,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

/// An application hands a datagram to its node's protocol stack.
#[derive(Debug, Clone)]
pub struct SendDatagramEvent {
    /// Outgoing datagram. The stack fills in the source address.
    pub datagram: Datagram,
}

/// A protocol stack asks a channel to carry a frame.
#[derive(Debug, Clone)]
pub struct TransmitEvent {
    /// Sending device.
    pub device: DeviceId,
    /// Frame to carry.
    pub frame: Frame,
}

/// A channel hands a frame to a receiving device's node.
#[derive(Debug, Clone)]
pub struct FrameArrivalEvent {
    /// Receiving device.
    pub device: DeviceId,
    /// Frame identifier assigned by the channel.
    pub frame_id: FrameId,
    /// The frame itself.
    pub frame: Frame,
}

/// A protocol stack delivers a datagram to a bound application.
#[derive(Debug, Clone)]
pub struct DatagramReceivedEvent {
    /// Delivered datagram.
    pub datagram: Datagram,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Application → Stack ===========
    /// Application sends a datagram.
    SendDatagram(SendDatagramEvent),

    // =========== Stack → Channel ===========
    /// Device starts a transmission.
    Transmit(TransmitEvent),

    // =========== Channel → Stack ===========
    /// Frame arrives at a device.
    FrameArrival(FrameArrivalEvent),

    // =========== Stack → Application ===========
    /// Datagram delivered to a listening port.
    DatagramReceived(DatagramReceivedEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },
}

impl EventPayload {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            EventPayload::SendDatagram(_) => "send_datagram",
            EventPayload::Transmit(_) => "transmit",
            EventPayload::FrameArrival(_) => "frame_arrival",
            EventPayload::DatagramReceived(_) => "datagram_received",
            EventPayload::Timer { .. } => "timer",
        }
    }
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Explicitly owned simulation state passed to entities during event handling.
///
/// Holds the clock, the event queue, the random source and buffered trace
/// events. Independent contexts never share state, so several simulations
/// can run side by side in one process.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    queue: EventQueue,
    source_entity: EntityId,
    trace: Vec<TraceEvent>,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            queue: EventQueue::new(),
            source_entity: EntityId(0),
            trace: Vec::new(),
        }
    }

    /// Get the current simulation time.
    ///
    /// Constant for the whole duration of one event handler.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Entity currently handling an event.
    pub fn source(&self) -> EntityId {
        self.source_entity
    }

    /// Set the source entity (used by event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay.
    pub fn post_event(
        &mut self,
        delay: SimTime,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> EventHandle {
        let time = self.time + delay;
        self.queue.push(time, self.source_entity, targets, payload)
    }

    /// Post an event at an absolute time, which must not lie in the past.
    pub fn post_at(
        &mut self,
        time: SimTime,
        targets: Vec<EntityId>,
        payload: EventPayload,
    ) -> Result<EventHandle, SchedulingError> {
        if time < self.time {
            return Err(SchedulingError::InPast {
                requested: time,
                now: self.time,
            });
        }
        Ok(self.queue.push(time, self.source_entity, targets, payload))
    }

    /// Post an event at the current instant, ordered after everything
    /// already queued for it. Used for hand-offs between layers so the
    /// receiving side never runs inside the sender's handler.
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) -> EventHandle {
        self.post_event(SimTime::ZERO, targets, payload)
    }

    /// Cancel a pending event.
    pub fn cancel(&mut self, handle: EventHandle) -> Result<(), SchedulingError> {
        self.queue.cancel(handle)
    }

    /// Whether the handle still refers to a pending event.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.queue.is_pending(handle)
    }

    /// Pop the next event if it is due no later than `stop_time`, advancing
    /// the clock to its due time (used by event loop).
    pub fn next_event(&mut self, stop_time: SimTime) -> Option<Event> {
        match self.queue.peek_time() {
            Some(time) if time <= stop_time => {
                let event = self.queue.pop()?;
                self.time = event.time;
                Some(event)
            }
            _ => None,
        }
    }

    /// Number of events still queued.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Due time of the earliest queued event.
    pub fn next_event_time(&self) -> Option<SimTime> {
        self.queue.peek_time()
    }

    /// Discard all queued events (used by event loop past the stop time).
    pub fn discard_pending(&mut self) -> usize {
        self.queue.discard_all()
    }

    /// Record an observable trace event stamped with the current time.
    pub fn emit(&mut self, kind: TraceKind) {
        self.trace.push(TraceEvent {
            time: self.time,
            kind,
        });
    }

    /// Take all buffered trace events (used by event loop).
    pub fn take_trace(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.trace)
    }
}

// ============================================================================
// Entity Trait
// ============================================================================

/// Base trait for all simulation entities.
pub trait Entity: Send {
    /// Get the entity's unique ID.
    fn entity_id(&self) -> EntityId;

    /// Handle an event.
    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError>;
}

// ============================================================================
// Entity Registry
// ============================================================================

/// Registry for managing simulation entities.
pub struct EntityRegistry {
    entities: HashMap<EntityId, Box<dyn Entity>>,
}

impl EntityRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        EntityRegistry {
            entities: HashMap::new(),
        }
    }

    /// Register an entity.
    pub fn register(&mut self, entity: Box<dyn Entity>) {
        let id = entity.entity_id();
        self.entities.insert(id, entity);
    }

    /// Get an entity by ID.
    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities.get(&id).map(|e| e.as_ref())
    }

    /// Get a mutable reference to an entity by ID.
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Box<dyn Entity>> {
        self.entities.get_mut(&id)
    }

    /// Dispatch an event to its target entities.
    pub fn dispatch_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        for target in &event.targets {
            if let Some(entity) = self.entities.get_mut(target) {
                ctx.set_source(*target);
                entity.handle_event(event, ctx)?;
            } else {
                tracing::error!(
                    target_entity = target.0,
                    payload = event.payload.label(),
                    "entity not found while dispatching"
                );
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
    }

    /// Get all entity IDs.
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Get the number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
