//! # linklab-engine
//!
//! Two-node wireless link simulation engine.
//!
//! This crate provides everything needed to run one simulated communication
//! session between two stationary endpoints:
//! - PHY configuration, rate selection and airtime ([`phy`])
//! - Radio and channel entities routing frames through a propagation model
//! - Constant-rate UDP traffic applications ([`apps`])
//! - Scenario construction ([`build_scenario`])
//! - The event loop and per-flow statistics ([`EventLoop`], [`EngineStats`])
//!
//! The link layer is ad-hoc: there is no association or management traffic,
//! frames flow directly between the two endpoints, and each endpoint gets a
//! network address from a fixed subnet.
//!
//! A scenario is built fresh for every run and fully released when the event
//! loop is dropped, so consecutive runs share no state beyond their inputs.

pub mod apps;
pub mod phy;

pub use apps::{SinkStats, UdpClient, UdpServer, TIMER_CLIENT_SEND};
pub use phy::{
    frame_airtime, Band, Channel, ChannelSettings, Radio, RateEntry, RateTable, SignalObserver,
    SignalSlot, WifiPhyConfig,
};

use linklab_common::{
    EntityId, EntityRegistry, Event, EventId, EventPayload, Position, SimContext, SimError, SimTime,
};
use linklab_propagation::{ConstantSpeedDelay, PropagationLoss};
use std::collections::{BTreeMap, BinaryHeap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while building or running a scenario.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Simulation error.
    #[error("simulation error: {0}")]
    Sim(#[from] SimError),

    /// Invalid scenario configuration.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
}

// ============================================================================
// Scenario Configuration
// ============================================================================

/// Traffic configuration for the client/server pair.
#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Application payload size in bytes.
    pub packet_size_bytes: usize,
    /// Interval between datagrams.
    pub interval: SimTime,
    /// Client (source) start time.
    pub client_start: SimTime,
    /// Client (source) stop time.
    pub client_stop: SimTime,
    /// Server (sink) start time.
    pub server_start: SimTime,
    /// Server (sink) stop time.
    pub server_stop: SimTime,
    /// UDP port the sink listens on.
    pub server_port: u16,
}

/// Configuration for one two-node scenario.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Separation between the endpoints along the x axis, in meters.
    pub distance_m: f64,
    /// Z offset applied to both endpoints, in meters.
    pub z_offset_m: f64,
    /// Shared PHY configuration.
    pub phy: WifiPhyConfig,
    /// Traffic configuration.
    pub traffic: TrafficConfig,
    /// RNG seed for this run.
    pub seed: u64,
}

/// Information about one endpoint of a built scenario.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Endpoint role name.
    pub name: &'static str,
    /// Assigned network address.
    pub address: Ipv4Addr,
    /// Entity ID of the endpoint's radio.
    pub radio_entity_id: EntityId,
    /// Entity ID of the endpoint's application.
    pub app_entity_id: EntityId,
    /// Endpoint position.
    pub position: Position,
}

/// A fully constructed scenario, ready to run.
pub struct BuiltScenario {
    /// Entity registry with all entities.
    pub entities: EntityRegistry,
    /// Initial events to seed the simulation.
    pub initial_events: Vec<Event>,
    /// Information about each endpoint.
    pub node_infos: Vec<NodeInfo>,
    /// Counters shared with the sink application.
    pub sink_stats: Arc<SinkStats>,
}

/// Network base: endpoints get consecutive host addresses in this subnet.
const ADDRESS_BASE: [u8; 3] = [10, 1, 1];

/// Build a two-node scenario.
///
/// Node 0 (the source) sits at the origin, node 1 (the sink) at
/// `distance_m` along the x axis; both are raised by `z_offset_m`. The
/// injected observer is attached to the sink radio so it sees the signal
/// level of every received frame.
pub fn build_scenario(
    config: &ScenarioConfig,
    loss: Box<dyn PropagationLoss>,
    observer: Arc<dyn SignalObserver>,
) -> Result<BuiltScenario, EngineError> {
    if config.distance_m <= 0.0 {
        return Err(EngineError::InvalidScenario(format!(
            "node separation must be positive, got {} m",
            config.distance_m
        )));
    }
    if config.traffic.packet_size_bytes == 0 {
        return Err(EngineError::InvalidScenario("packet size must be non-zero".into()));
    }
    if config.traffic.interval == SimTime::ZERO {
        return Err(EngineError::InvalidScenario("send interval must be non-zero".into()));
    }
    if config.traffic.client_start >= config.traffic.client_stop {
        return Err(EngineError::InvalidScenario(format!(
            "client window is empty: start {} >= stop {}",
            config.traffic.client_start, config.traffic.client_stop
        )));
    }

    let channel_id = EntityId::new(0);
    let source_radio_id = EntityId::new(1);
    let sink_radio_id = EntityId::new(2);
    let client_id = EntityId::new(3);
    let server_id = EntityId::new(4);

    let [a, b, c] = ADDRESS_BASE;
    let source_addr = Ipv4Addr::new(a, b, c, 1);
    let sink_addr = Ipv4Addr::new(a, b, c, 2);

    let source_pos = Position::new(0.0, 0.0, config.z_offset_m);
    let sink_pos = Position::new(config.distance_m, 0.0, config.z_offset_m);

    let mut entities = EntityRegistry::new();

    entities.register(Box::new(Channel::new(
        channel_id,
        loss,
        ConstantSpeedDelay::default(),
        &config.phy,
        vec![(source_radio_id, source_pos), (sink_radio_id, sink_pos)],
    )));
    entities.register(Box::new(Radio::new(
        source_radio_id,
        channel_id,
        client_id,
        &config.phy,
        None,
    )));
    entities.register(Box::new(Radio::new(
        sink_radio_id,
        channel_id,
        server_id,
        &config.phy,
        Some(observer),
    )));
    entities.register(Box::new(UdpClient::new(
        client_id,
        source_radio_id,
        source_addr,
        sink_addr,
        config.traffic.server_port,
        config.traffic.packet_size_bytes,
        config.traffic.interval,
        config.traffic.client_stop,
    )));

    let sink_stats = Arc::new(SinkStats::new());
    entities.register(Box::new(UdpServer::new(
        server_id,
        config.traffic.server_port,
        config.traffic.server_start,
        config.traffic.server_stop,
        sink_stats.clone(),
    )));

    // First client send tick; event IDs are reassigned by the event loop.
    let initial_events = vec![Event {
        id: EventId(0),
        time: config.traffic.client_start,
        source: client_id,
        targets: vec![client_id],
        payload: EventPayload::Timer { timer_id: TIMER_CLIENT_SEND },
    }];

    let node_infos = vec![
        NodeInfo {
            name: "source",
            address: source_addr,
            radio_entity_id: source_radio_id,
            app_entity_id: client_id,
            position: source_pos,
        },
        NodeInfo {
            name: "sink",
            address: sink_addr,
            radio_entity_id: sink_radio_id,
            app_entity_id: server_id,
            position: sink_pos,
        },
    ];

    Ok(BuiltScenario {
        entities,
        initial_events,
        node_infos,
        sink_stats,
    })
}

// ============================================================================
// Flow Statistics
// ============================================================================

/// Identifier of one tracked traffic flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowId {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// Destination UDP port.
    pub dst_port: u16,
}

/// Statistics for one tracked flow.
#[derive(Debug, Clone, Default)]
pub struct FlowStats {
    /// Datagrams handed to the channel.
    pub tx_packets: u64,
    /// Bytes handed to the channel.
    pub tx_bytes: u64,
    /// Datagrams delivered to the receiving application.
    pub rx_packets: u64,
    /// Bytes delivered to the receiving application.
    pub rx_bytes: u64,
    /// Time of the first transmission.
    pub first_tx: Option<SimTime>,
    /// Time of the last delivery.
    pub last_rx: Option<SimTime>,
}

/// Statistics reported after a run.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Total events processed.
    pub total_events: u64,
    /// Datagrams accepted by the sink application.
    pub sink_received_packets: u64,
    /// Bytes accepted by the sink application.
    pub sink_rx_bytes: u64,
    /// Per-flow statistics, in deterministic flow order.
    pub flows: BTreeMap<FlowId, FlowStats>,
}

// ============================================================================
// Event Loop
// ============================================================================

/// The simulation event loop.
///
/// Owns all scenario state; dropping the loop releases it, so every run
/// starts from a clean construction.
pub struct EventLoop {
    event_queue: BinaryHeap<Event>,
    entities: EntityRegistry,
    context: SimContext,
    sink_stats: Arc<SinkStats>,
    flows: BTreeMap<FlowId, FlowStats>,
    total_events: u64,
}

impl EventLoop {
    /// Create an event loop for a built scenario.
    pub fn new(scenario: BuiltScenario, seed: u64) -> Self {
        let mut context = SimContext::new(seed);
        let mut event_queue = BinaryHeap::new();

        for mut event in scenario.initial_events {
            event.id = EventId(context.next_event_id());
            event_queue.push(event);
        }

        EventLoop {
            event_queue,
            entities: scenario.entities,
            context,
            sink_stats: scenario.sink_stats,
            flows: BTreeMap::new(),
            total_events: 0,
        }
    }

    /// Run the simulation until the given simulated time and report
    /// statistics.
    pub fn run(&mut self, until: SimTime) -> Result<EngineStats, EngineError> {
        self.event_queue.push(Event {
            id: EventId(u64::MAX),
            time: until,
            source: EntityId::new(0),
            targets: vec![],
            payload: EventPayload::SimulationEnd,
        });

        while let Some(event) = self.event_queue.pop() {
            if matches!(event.payload, EventPayload::SimulationEnd) {
                break;
            }

            self.context.set_time(event.time);
            self.entities.dispatch_event(&event, &mut self.context)?;

            for new_event in self.context.take_pending_events() {
                self.event_queue.push(new_event);
            }

            self.total_events += 1;
            self.update_flow_stats(&event);
        }

        debug!(
            total_events = self.total_events,
            sink_received = self.sink_stats.received(),
            "scenario run complete"
        );

        Ok(EngineStats {
            total_events: self.total_events,
            sink_received_packets: self.sink_stats.received(),
            sink_rx_bytes: self.sink_stats.rx_bytes(),
            flows: self.flows.clone(),
        })
    }

    /// Current simulated time.
    pub fn current_time(&self) -> SimTime {
        self.context.time()
    }

    fn update_flow_stats(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::TransmitFrame(tx) => {
                let flow = self.flows.entry(FlowId {
                    src: tx.datagram.src,
                    dst: tx.datagram.dst,
                    dst_port: tx.datagram.dst_port,
                });
                let stats = flow.or_default();
                stats.tx_packets += 1;
                stats.tx_bytes += tx.datagram.payload_len as u64;
                stats.first_tx.get_or_insert(event.time);
            }
            EventPayload::DatagramRx(rx) => {
                let flow = self.flows.entry(FlowId {
                    src: rx.datagram.src,
                    dst: rx.datagram.dst,
                    dst_port: rx.datagram.dst_port,
                });
                let stats = flow.or_default();
                stats.rx_packets += 1;
                stats.rx_bytes += rx.datagram.payload_len as u64;
                stats.last_rx = Some(event.time);
            }
            _ => {}
        }
    }
}
