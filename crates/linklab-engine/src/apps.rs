//! Traffic applications: a constant-rate UDP source and a counting sink.

use linklab_common::{
    Datagram, DatagramSendEvent, Entity, EntityId, Event, EventPayload, SimContext, SimError,
    SimTime,
};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Timer ID used by the client for its send tick.
pub const TIMER_CLIENT_SEND: u64 = 1;

// ============================================================================
// Sink Statistics
// ============================================================================

/// Counters shared between the sink application and the engine caller.
#[derive(Debug, Default)]
pub struct SinkStats {
    received: AtomicU64,
    rx_bytes: AtomicU64,
}

impl SinkStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one accepted datagram.
    pub fn record(&self, bytes: u64) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Datagrams accepted by the sink.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Bytes accepted by the sink.
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

// ============================================================================
// UDP Client
// ============================================================================

/// Constant-rate UDP source.
///
/// Emits one fixed-size datagram per interval from its start time until its
/// stop time, with an unbounded packet budget. Driven entirely by timer
/// events, so the send schedule is deterministic.
pub struct UdpClient {
    id: EntityId,
    radio: EntityId,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    dst_port: u16,
    packet_size: usize,
    interval: SimTime,
    stop: SimTime,
    next_seq: u64,
    sent: u64,
}

impl UdpClient {
    /// Create a client. The scenario builder schedules the first send tick at
    /// the client's start time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: EntityId,
        radio: EntityId,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        dst_port: u16,
        packet_size: usize,
        interval: SimTime,
        stop: SimTime,
    ) -> Self {
        UdpClient {
            id,
            radio,
            src,
            dst,
            dst_port,
            packet_size,
            interval,
            stop,
            next_seq: 0,
            sent: 0,
        }
    }
}

impl Entity for UdpClient {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::Timer { timer_id } if *timer_id == TIMER_CLIENT_SEND => {
                if ctx.time() >= self.stop {
                    debug!(sent = self.sent, "traffic source stopped");
                    return Ok(());
                }

                let datagram = Datagram {
                    seq: self.next_seq,
                    payload_len: self.packet_size,
                    src: self.src,
                    dst: self.dst,
                    dst_port: self.dst_port,
                };
                self.next_seq += 1;
                self.sent += 1;

                ctx.post_immediate(
                    vec![self.radio],
                    EventPayload::DatagramSend(DatagramSendEvent { datagram }),
                );
                ctx.post_event(
                    self.interval,
                    vec![self.id],
                    EventPayload::Timer { timer_id: TIMER_CLIENT_SEND },
                );
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// UDP Server
// ============================================================================

/// UDP sink counting the datagrams it accepts.
///
/// Accepts datagrams addressed to its port that arrive inside its active
/// window; counters live in a shared [`SinkStats`] so the caller can read
/// them after the run.
pub struct UdpServer {
    id: EntityId,
    port: u16,
    start: SimTime,
    stop: SimTime,
    stats: std::sync::Arc<SinkStats>,
}

impl UdpServer {
    /// Create a server listening on `port` during `[start, stop)`.
    pub fn new(
        id: EntityId,
        port: u16,
        start: SimTime,
        stop: SimTime,
        stats: std::sync::Arc<SinkStats>,
    ) -> Self {
        UdpServer {
            id,
            port,
            start,
            stop,
            stats,
        }
    }
}

impl Entity for UdpServer {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::DatagramRx(rx) = &event.payload {
            if rx.datagram.dst_port != self.port {
                return Ok(());
            }
            let now = ctx.time();
            if now < self.start || now >= self.stop {
                trace!(seq = rx.datagram.seq, "datagram outside sink window, ignored");
                return Ok(());
            }
            self.stats.record(rx.datagram.payload_len as u64);
            trace!(
                seq = rx.datagram.seq,
                rss_dbm = rx.rss_dbm,
                total = self.stats.received(),
                "datagram accepted"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linklab_common::DatagramRxEvent;
    use std::sync::Arc;

    fn rx_event(time_s: f64, port: u16) -> Event {
        Event {
            id: linklab_common::EventId(0),
            time: SimTime::from_secs(time_s),
            source: EntityId(1),
            targets: vec![EntityId(2)],
            payload: EventPayload::DatagramRx(DatagramRxEvent {
                datagram: Datagram {
                    seq: 0,
                    payload_len: 1450,
                    src: Ipv4Addr::new(10, 1, 1, 1),
                    dst: Ipv4Addr::new(10, 1, 1, 2),
                    dst_port: port,
                },
                rss_dbm: -60.0,
            }),
        }
    }

    #[test]
    fn server_counts_only_inside_window_and_port() {
        let stats = Arc::new(SinkStats::new());
        let mut server = UdpServer::new(
            EntityId(2),
            9,
            SimTime::from_secs(1.0),
            SimTime::from_secs(3.0),
            stats.clone(),
        );
        let mut ctx = SimContext::new(0);

        for (t, port) in [(0.5, 9), (1.5, 9), (2.9, 9), (3.0, 9), (2.0, 10)] {
            let event = rx_event(t, port);
            ctx.set_time(event.time);
            server.handle_event(&event, &mut ctx).unwrap();
        }

        assert_eq!(stats.received(), 2);
        assert_eq!(stats.rx_bytes(), 2 * 1450);
    }

    #[test]
    fn client_stops_sending_at_stop_time() {
        let mut client = UdpClient::new(
            EntityId(3),
            EntityId(1),
            Ipv4Addr::new(10, 1, 1, 1),
            Ipv4Addr::new(10, 1, 1, 2),
            9,
            1450,
            SimTime::from_millis(100),
            SimTime::from_secs(1.0),
        );
        let mut ctx = SimContext::new(0);

        let tick = |time: SimTime| Event {
            id: linklab_common::EventId(0),
            time,
            source: EntityId(3),
            targets: vec![EntityId(3)],
            payload: EventPayload::Timer { timer_id: TIMER_CLIENT_SEND },
        };

        // A tick inside the window emits a send plus the next tick.
        let event = tick(SimTime::from_millis(500));
        ctx.set_time(event.time);
        client.handle_event(&event, &mut ctx).unwrap();
        let posted = ctx.take_pending_events();
        assert_eq!(posted.len(), 2);

        // A tick at the stop time emits nothing.
        let event = tick(SimTime::from_secs(1.0));
        ctx.set_time(event.time);
        client.handle_event(&event, &mut ctx).unwrap();
        assert!(ctx.take_pending_events().is_empty());
    }
}
