//! # linklab-common
//!
//! Common types and traits for the linklab link simulator.
//!
//! This crate provides the core simulation primitives:
//! - Time representation ([`SimTime`])
//! - Cartesian node positions ([`Position`])
//! - Entity identification ([`EntityId`])
//! - Event system ([`Event`], [`EventPayload`])
//! - Simulation context ([`SimContext`])
//! - Entity trait and registry ([`Entity`], [`EntityRegistry`])

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Entity not found.
    #[error("entity not found: {0:?}")]
    EntityNotFound(EntityId),

    /// Simulation time overflow.
    #[error("simulation time overflow")]
    TimeOverflow,

    /// Event handler error.
    #[error("event handler error in entity {entity:?}: {message}")]
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

/// Simulation time in microseconds since simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from microseconds.
    pub fn from_micros(us: u64) -> Self {
        SimTime(us)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1000)
    }

    /// Create from seconds (float).
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1_000_000.0) as u64)
    }

    /// Get as microseconds.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Checked addition of a duration.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Position
// ============================================================================

/// Cartesian position of a stationary node, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
    /// Z coordinate (height above the ground plane) in meters.
    pub z: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }

    /// Euclidean distance to another position in meters.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
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

// ============================================================================
// Datagram
// ============================================================================

/// One application-layer datagram travelling between the endpoints.
///
/// Only the bookkeeping the statistics layer needs is carried; payload
/// content is irrelevant to the experiment and is represented by its length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datagram {
    /// Monotonic sequence number assigned by the sending application.
    pub seq: u64,
    /// Application payload length in bytes.
    pub payload_len: usize,
    /// Source network address.
    pub src: Ipv4Addr,
    /// Destination network address.
    pub dst: Ipv4Addr,
    /// Destination UDP port.
    pub dst_port: u16,
}

// ============================================================================
// Event Types
// ============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest time first); ties broken by
        // insertion order so runs with the same seed replay identically.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

/// Application hands a datagram to its radio for transmission.
#[derive(Debug, Clone)]
pub struct DatagramSendEvent {
    /// The datagram to transmit.
    pub datagram: Datagram,
}

/// Radio begins transmitting a frame; directed to the channel entity.
#[derive(Debug, Clone)]
pub struct TransmitFrameEvent {
    /// Radio that is transmitting.
    pub radio_id: EntityId,
    /// The datagram carried by the frame.
    pub datagram: Datagram,
    /// Transmit power at the antenna, including transmit gain, in dBm.
    pub tx_power_dbm: f64,
}

/// Channel delivers a frame to a receiving radio.
#[derive(Debug, Clone)]
pub struct ReceiveFrameEvent {
    /// Radio that transmitted the frame.
    pub source_radio_id: EntityId,
    /// The datagram carried by the frame.
    pub datagram: Datagram,
    /// Signal level at the receiver, including receive gain, in dBm.
    pub rx_power_dbm: f64,
    /// Data rate the channel selected for this frame, in Mbit/s.
    pub data_rate_mbps: f64,
}

/// Radio hands a received datagram up to its application.
#[derive(Debug, Clone)]
pub struct DatagramRxEvent {
    /// The received datagram.
    pub datagram: Datagram,
    /// Signal level the frame was received at, in dBm.
    pub rss_dbm: f64,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum EventPayload {
    // =========== Application → Radio ===========
    /// Application requests transmission of a datagram.
    DatagramSend(DatagramSendEvent),

    // =========== Radio → Channel → Radio ===========
    /// A radio started transmitting (directed to the channel entity).
    TransmitFrame(TransmitFrameEvent),
    /// A frame arrives at a receiving radio.
    ReceiveFrame(ReceiveFrameEvent),

    // =========== Radio → Application ===========
    /// A datagram reached the receiving application.
    DatagramRx(DatagramRxEvent),

    // =========== Scheduling ===========
    /// A delayed callback.
    Timer {
        /// User-defined timer ID.
        timer_id: u64,
    },

    // =========== Simulation Control ===========
    /// End the simulation.
    SimulationEnd,
}

// ============================================================================
// Simulation Context
// ============================================================================

/// Context passed to entities during event handling.
pub struct SimContext {
    time: SimTime,
    rng: ChaCha8Rng,
    pending_events: Vec<Event>,
    next_event_id: u64,
    source_entity: EntityId,
}

impl SimContext {
    /// Create a new simulation context.
    pub fn new(seed: u64) -> Self {
        SimContext {
            time: SimTime::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_events: Vec::new(),
            next_event_id: 0,
            source_entity: EntityId(0),
        }
    }

    /// Get the current simulation time.
    pub fn time(&self) -> SimTime {
        self.time
    }

    /// Get mutable access to the random number generator.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Set the current time (used by the event loop).
    pub fn set_time(&mut self, time: SimTime) {
        self.time = time;
    }

    /// Set the source entity (used by the event loop).
    pub fn set_source(&mut self, entity: EntityId) {
        self.source_entity = entity;
    }

    /// Post an event to occur after a delay.
    pub fn post_event(&mut self, delay: SimTime, targets: Vec<EntityId>, payload: EventPayload) {
        let event = Event {
            id: EventId(self.next_event_id),
            time: self.time + delay,
            source: self.source_entity,
            targets,
            payload,
        };
        self.next_event_id += 1;
        self.pending_events.push(event);
    }

    /// Post an event to occur immediately (at the current time).
    pub fn post_immediate(&mut self, targets: Vec<EntityId>, payload: EventPayload) {
        self.post_event(SimTime::ZERO, targets, payload);
    }

    /// Take all pending events (used by the event loop).
    pub fn take_pending_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending_events)
    }

    /// Allocate the next event ID (used by the event loop for external events).
    pub fn next_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
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
                tracing::error!(?target, payload = ?event.payload, "event targeted unknown entity");
                return Err(SimError::EntityNotFound(*target));
            }
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_time_conversions() {
        let time = SimTime::from_secs(1.5);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_micros(), 1_500_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 0.0001);
    }

    #[test]
    fn test_sim_time_arithmetic() {
        let t1 = SimTime::from_millis(100);
        let t2 = SimTime::from_millis(50);
        assert_eq!((t1 + t2).as_millis(), 150);
        assert_eq!((t1 - t2).as_millis(), 50);
        // Subtraction saturates at zero rather than wrapping.
        assert_eq!((t2 - t1), SimTime::ZERO);
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-12);

        let c = Position::new(3.0, 4.0, 12.0);
        assert!((a.distance_to(&c) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn test_event_ordering_is_earliest_first() {
        use std::collections::BinaryHeap;

        let mk = |id: u64, us: u64| Event {
            id: EventId(id),
            time: SimTime::from_micros(us),
            source: EntityId(0),
            targets: vec![],
            payload: EventPayload::Timer { timer_id: 0 },
        };

        let mut heap = BinaryHeap::new();
        heap.push(mk(0, 300));
        heap.push(mk(1, 100));
        heap.push(mk(2, 100));
        heap.push(mk(3, 200));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.id.0).collect();
        // Same timestamp resolves by insertion (event id) order.
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_context_post_event_advances_time() {
        let mut ctx = SimContext::new(7);
        ctx.set_time(SimTime::from_millis(10));
        ctx.post_event(
            SimTime::from_millis(5),
            vec![EntityId(1)],
            EventPayload::Timer { timer_id: 42 },
        );
        let events = ctx.take_pending_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, SimTime::from_millis(15));
        assert!(ctx.take_pending_events().is_empty());
    }

    #[test]
    fn test_rng_is_deterministic_for_seed() {
        use rand::Rng;
        let mut a = SimContext::new(42);
        let mut b = SimContext::new(42);
        let xs: Vec<u64> = (0..8).map(|_| a.rng().gen()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.rng().gen()).collect();
        assert_eq!(xs, ys);
    }
}
