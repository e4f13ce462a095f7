//! Wireless physical layer: channel configuration, rate selection, airtime,
//! and the radio and channel entities.

use linklab_common::{
    DatagramRxEvent, Entity, EntityId, Event, EventPayload, Position, ReceiveFrameEvent, SimContext,
    SimError, SimTime, TransmitFrameEvent,
};
use linklab_propagation::{ConstantSpeedDelay, PropagationLoss};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Fixed PHY framing overhead (preamble plus PLCP header) per frame, in
/// microseconds.
pub const PHY_PREAMBLE_US: u64 = 36;

// ============================================================================
// Channel Configuration
// ============================================================================

/// Frequency band of the configured channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// 2.4 GHz ISM band.
    Band2_4GHz,
    /// 5 GHz band.
    Band5GHz,
}

impl std::fmt::Display for Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Band::Band2_4GHz => write!(f, "2.4GHz"),
            Band::Band5GHz => write!(f, "5GHz"),
        }
    }
}

/// Channel width, band and center frequency.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Channel width in MHz.
    pub width_mhz: u32,
    /// Frequency band.
    pub band: Band,
    /// Center frequency in MHz.
    pub center_frequency_mhz: f64,
}

impl ChannelSettings {
    /// 40 MHz channel in the 5 GHz band (channel 38, 5190 MHz).
    pub fn ht40_5ghz() -> Self {
        ChannelSettings {
            width_mhz: 40,
            band: Band::Band5GHz,
            center_frequency_mhz: 5190.0,
        }
    }

    /// Center frequency in Hz.
    pub fn center_frequency_hz(&self) -> f64 {
        self.center_frequency_mhz * 1e6
    }
}

// ============================================================================
// Rate Table
// ============================================================================

/// One modulation/coding entry: a data rate and the minimum signal level at
/// which a receiver decodes it.
#[derive(Debug, Clone, Copy)]
pub struct RateEntry {
    /// Data rate in Mbit/s.
    pub data_rate_mbps: f64,
    /// Minimum decodable signal level in dBm.
    pub min_rx_power_dbm: f64,
}

/// Receiver sensitivity ladder, ordered from the most robust rate upward.
///
/// Rate selection is ideal: the channel picks the fastest rate the receiver
/// can decode at the computed signal level, so throughput degrades in steps
/// as the link weakens and collapses to zero below the bottom entry.
#[derive(Debug, Clone)]
pub struct RateTable {
    entries: Vec<RateEntry>,
}

impl RateTable {
    /// Default sensitivity ladder: single-stream 40 MHz rates.
    pub fn ht40_single_stream() -> Self {
        RateTable {
            entries: vec![
                RateEntry { data_rate_mbps: 13.5, min_rx_power_dbm: -82.0 },
                RateEntry { data_rate_mbps: 27.0, min_rx_power_dbm: -79.0 },
                RateEntry { data_rate_mbps: 40.5, min_rx_power_dbm: -77.0 },
                RateEntry { data_rate_mbps: 54.0, min_rx_power_dbm: -74.0 },
                RateEntry { data_rate_mbps: 81.0, min_rx_power_dbm: -70.0 },
                RateEntry { data_rate_mbps: 108.0, min_rx_power_dbm: -66.0 },
                RateEntry { data_rate_mbps: 121.5, min_rx_power_dbm: -65.0 },
                RateEntry { data_rate_mbps: 135.0, min_rx_power_dbm: -64.0 },
            ],
        }
    }

    /// Fastest decodable rate at the given signal level, or `None` when the
    /// signal is below the sensitivity floor.
    pub fn select(&self, rx_power_dbm: f64) -> Option<RateEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| rx_power_dbm >= e.min_rx_power_dbm)
            .copied()
    }

    /// The most robust entry in the ladder.
    pub fn base_rate(&self) -> RateEntry {
        self.entries[0]
    }

    /// Sensitivity floor: the weakest signal any rate decodes at.
    pub fn sensitivity_floor_dbm(&self) -> f64 {
        self.entries[0].min_rx_power_dbm
    }
}

/// Wi-Fi physical layer configuration shared by both endpoints.
#[derive(Debug, Clone)]
pub struct WifiPhyConfig {
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Transmit antenna gain in dBi.
    pub tx_gain_dbi: f64,
    /// Receive antenna gain in dBi.
    pub rx_gain_dbi: f64,
    /// Channel settings.
    pub channel: ChannelSettings,
    /// Receiver sensitivity ladder.
    pub rates: RateTable,
}

impl WifiPhyConfig {
    /// Create a configuration with the default HT40 rate ladder.
    pub fn new(tx_power_dbm: f64, tx_gain_dbi: f64, rx_gain_dbi: f64, channel: ChannelSettings) -> Self {
        WifiPhyConfig {
            tx_power_dbm,
            tx_gain_dbi,
            rx_gain_dbi,
            channel,
            rates: RateTable::ht40_single_stream(),
        }
    }
}

/// Time on air for a frame of `payload_len` bytes at `data_rate_mbps`.
///
/// Mbit/s is bits-per-microsecond, so the payload time in microseconds is
/// the bit count divided by the rate, plus the fixed preamble.
pub fn frame_airtime(payload_len: usize, data_rate_mbps: f64) -> SimTime {
    let bits = (payload_len * 8) as f64;
    let payload_us = (bits / data_rate_mbps).ceil() as u64;
    SimTime::from_micros(PHY_PREAMBLE_US + payload_us)
}

// ============================================================================
// Signal Observer
// ============================================================================

/// Capability to record one signal-strength sample per received frame.
pub trait SignalObserver: Send + Sync {
    /// Record the signal level of one received frame.
    fn record(&self, rss_dbm: f64);
}

/// Bounded single-slot "last observed value" store.
///
/// The sweep controller owns one of these, attaches it to the sink radio for
/// one scenario, and takes the slot exactly once after the run.
#[derive(Default)]
pub struct SignalSlot {
    last: Mutex<Option<f64>>,
}

impl SignalSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the most recently recorded sample, leaving the slot empty.
    pub fn take(&self) -> Option<f64> {
        self.last.lock().take()
    }
}

impl SignalObserver for SignalSlot {
    fn record(&self, rss_dbm: f64) {
        *self.last.lock() = Some(rss_dbm);
    }
}

// ============================================================================
// Radio Entity
// ============================================================================

/// Radio entity attached to one endpoint.
///
/// Forwards application datagrams to the channel for transmission and hands
/// received frames up to the attached application, reporting each received
/// frame's signal level to the injected observer.
pub struct Radio {
    id: EntityId,
    channel_entity: EntityId,
    attached_app: EntityId,
    tx_power_dbm: f64,
    tx_gain_dbi: f64,
    observer: Option<Arc<dyn SignalObserver>>,
}

impl Radio {
    /// Create a radio entity.
    pub fn new(
        id: EntityId,
        channel_entity: EntityId,
        attached_app: EntityId,
        phy: &WifiPhyConfig,
        observer: Option<Arc<dyn SignalObserver>>,
    ) -> Self {
        Radio {
            id,
            channel_entity,
            attached_app,
            tx_power_dbm: phy.tx_power_dbm,
            tx_gain_dbi: phy.tx_gain_dbi,
            observer,
        }
    }
}

impl Entity for Radio {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::DatagramSend(send) => {
                ctx.post_immediate(
                    vec![self.channel_entity],
                    EventPayload::TransmitFrame(TransmitFrameEvent {
                        radio_id: self.id,
                        datagram: send.datagram.clone(),
                        tx_power_dbm: self.tx_power_dbm + self.tx_gain_dbi,
                    }),
                );
            }
            EventPayload::ReceiveFrame(rx) => {
                if let Some(observer) = &self.observer {
                    observer.record(rx.rx_power_dbm);
                }
                trace!(
                    seq = rx.datagram.seq,
                    rss_dbm = rx.rx_power_dbm,
                    rate_mbps = rx.data_rate_mbps,
                    "frame received"
                );
                ctx.post_immediate(
                    vec![self.attached_app],
                    EventPayload::DatagramRx(DatagramRxEvent {
                        datagram: rx.datagram.clone(),
                        rss_dbm: rx.rx_power_dbm,
                    }),
                );
            }
            _ => {}
        }
        Ok(())
    }
}

// ============================================================================
// Channel Entity
// ============================================================================

/// The wireless channel between the two endpoints.
///
/// Owns the propagation loss and delay models and the endpoint positions.
/// For every transmitted frame it computes the receive power at the other
/// endpoint, selects the fastest decodable rate, serializes the medium, and
/// schedules frame delivery after airtime plus propagation delay. Frames
/// below the sensitivity floor still occupy the medium but are never
/// delivered.
pub struct Channel {
    id: EntityId,
    loss: Box<dyn PropagationLoss>,
    delay: ConstantSpeedDelay,
    rx_gain_dbi: f64,
    rates: RateTable,
    radios: Vec<(EntityId, Position)>,
    busy_until: SimTime,
    frames_dropped: u64,
}

impl Channel {
    /// Create a channel entity connecting the given radios.
    pub fn new(
        id: EntityId,
        loss: Box<dyn PropagationLoss>,
        delay: ConstantSpeedDelay,
        phy: &WifiPhyConfig,
        radios: Vec<(EntityId, Position)>,
    ) -> Self {
        Channel {
            id,
            loss,
            delay,
            rx_gain_dbi: phy.rx_gain_dbi,
            rates: phy.rates.clone(),
            radios,
            busy_until: SimTime::ZERO,
            frames_dropped: 0,
        }
    }

    fn position_of(&self, radio: EntityId) -> Option<Position> {
        self.radios
            .iter()
            .find(|(id, _)| *id == radio)
            .map(|(_, pos)| *pos)
    }
}

impl Entity for Channel {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        let tx = match &event.payload {
            EventPayload::TransmitFrame(tx) => tx,
            _ => return Ok(()),
        };

        let tx_pos = self
            .position_of(tx.radio_id)
            .ok_or_else(|| SimError::HandlerError {
                entity: self.id,
                message: format!("transmit from unknown radio {:?}", tx.radio_id),
            })?;

        let start = self.busy_until.max(ctx.time());
        for i in 0..self.radios.len() {
            let (rx_radio, rx_pos) = self.radios[i];
            if rx_radio == tx.radio_id {
                continue;
            }

            let signal_dbm =
                self.loss.rx_power_dbm(tx.tx_power_dbm, &tx_pos, &rx_pos, ctx.rng()) + self.rx_gain_dbi;

            match self.rates.select(signal_dbm) {
                Some(rate) => {
                    let airtime = frame_airtime(tx.datagram.payload_len, rate.data_rate_mbps);
                    self.busy_until = start + airtime;
                    let delivery = start + airtime + self.delay.delay(&tx_pos, &rx_pos);
                    ctx.post_event(
                        delivery - ctx.time(),
                        vec![rx_radio],
                        EventPayload::ReceiveFrame(ReceiveFrameEvent {
                            source_radio_id: tx.radio_id,
                            datagram: tx.datagram.clone(),
                            rx_power_dbm: signal_dbm,
                            data_rate_mbps: rate.data_rate_mbps,
                        }),
                    );
                }
                None => {
                    // The transmitter cannot know the frame is undecodable;
                    // it still occupies the air at the most robust rate.
                    let airtime =
                        frame_airtime(tx.datagram.payload_len, self.rates.base_rate().data_rate_mbps);
                    self.busy_until = start + airtime;
                    self.frames_dropped += 1;
                    trace!(
                        seq = tx.datagram.seq,
                        signal_dbm,
                        floor_dbm = self.rates.sensitivity_floor_dbm(),
                        "frame below sensitivity floor, dropped"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_selection_prefers_fastest_decodable() {
        let table = RateTable::ht40_single_stream();
        assert_eq!(table.select(-50.0).map(|r| r.data_rate_mbps), Some(135.0));
        assert_eq!(table.select(-64.5).map(|r| r.data_rate_mbps), Some(121.5));
        assert_eq!(table.select(-75.0).map(|r| r.data_rate_mbps), Some(40.5));
        assert_eq!(table.select(-81.0).map(|r| r.data_rate_mbps), Some(13.5));
        assert!(table.select(-85.0).is_none());
    }

    #[test]
    fn rate_selection_is_monotonic_in_signal() {
        let table = RateTable::ht40_single_stream();
        let mut previous = 0.0;
        for dbm in (-82..=-50).map(f64::from) {
            let rate = table.select(dbm).map(|r| r.data_rate_mbps).unwrap_or(0.0);
            assert!(rate >= previous, "rate decreased as signal improved at {dbm} dBm");
            previous = rate;
        }
    }

    #[test]
    fn airtime_includes_preamble() {
        // 1450 bytes at 135 Mbit/s: 11600 bits / 135 = 85.9 -> 86 us payload.
        let t = frame_airtime(1450, 135.0);
        assert_eq!(t.as_micros(), PHY_PREAMBLE_US + 86);

        // Slower rates take proportionally longer.
        let slow = frame_airtime(1450, 13.5);
        assert!(slow.as_micros() > t.as_micros());
    }

    #[test]
    fn signal_slot_keeps_last_sample_and_empties_on_take() {
        let slot = SignalSlot::new();
        assert_eq!(slot.take(), None);
        slot.record(-70.0);
        slot.record(-71.5);
        assert_eq!(slot.take(), Some(-71.5));
        assert_eq!(slot.take(), None);
    }
}
