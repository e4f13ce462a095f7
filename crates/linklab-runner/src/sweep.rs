//! The sweep controller.
//!
//! Drives the repeated-experiment loop: one scenario run per distance,
//! measurement extraction, result-file persistence and the termination
//! decision.

use crate::models::PropagationModel;
use crate::RunnerError;
use linklab_common::SimTime;
use linklab_engine::{
    build_scenario, ChannelSettings, EngineStats, EventLoop, ScenarioConfig, SignalObserver,
    SignalSlot, TrafficConfig, WifiPhyConfig,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// Experiment Constants
// ============================================================================

/// Initial node separation in meters.
pub const INITIAL_DISTANCE_M: f64 = 5.0;
/// Application payload size in bytes.
pub const PACKET_SIZE_BYTES: usize = 1450;
/// Nominal interval between datagrams in seconds (packet size / 75 Mbit/s).
pub const PACKET_INTERVAL_S: f64 = 0.0001547;
/// Traffic source start time within an iteration, in seconds.
pub const CLIENT_START_S: f64 = 2.0;
/// Sink start time within an iteration, in seconds.
pub const SERVER_START_S: f64 = 1.0;
/// Extra simulated time past the application stop times, in seconds.
pub const RUN_TAIL_S: f64 = 1.0;
/// Transmit power in dBm.
pub const TX_POWER_DBM: f64 = 10.0;
/// Transmit antenna gain in dBi.
pub const TX_GAIN_DBI: f64 = 1.0;
/// Receive antenna gain in dBi.
pub const RX_GAIN_DBI: f64 = 1.0;
/// UDP port the sink listens on.
pub const SERVER_PORT: u16 = 9;

// ============================================================================
// Sweep Configuration and State
// ============================================================================

/// Configuration of one sweep run.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Selected propagation model.
    pub model: PropagationModel,
    /// Distance increment per iteration, in meters.
    pub increment_m: f64,
    /// Nominal simulated duration per iteration, in seconds.
    pub duration_s: f64,
    /// RNG seed; iteration seeds are derived from it.
    pub seed: u64,
    /// Directory the result file is created in.
    pub output_dir: PathBuf,
    /// Optional distance bound. When set, the sweep also stops after the
    /// first row at or beyond this distance. Unset reproduces the unbounded
    /// behavior, which does not terminate for models whose throughput never
    /// reaches zero.
    pub max_distance_m: Option<f64>,
}

impl SweepConfig {
    /// Validate the configuration before any simulation work begins.
    pub fn validate(&self) -> Result<(), RunnerError> {
        if !(self.increment_m > 0.0) {
            return Err(RunnerError::Config(format!(
                "distance increment must be positive, got {}",
                self.increment_m
            )));
        }
        if !(self.duration_s > CLIENT_START_S) {
            return Err(RunnerError::Config(format!(
                "simulated duration must exceed the source start time of {CLIENT_START_S} s, got {}",
                self.duration_s
            )));
        }
        if let Some(max) = self.max_distance_m {
            if !(max > INITIAL_DISTANCE_M) {
                return Err(RunnerError::Config(format!(
                    "max distance must exceed the initial distance of {INITIAL_DISTANCE_M} m, got {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Mutable per-run state threaded through the sweep loop.
#[derive(Debug, Clone, Copy)]
pub struct SweepState {
    /// Current node separation in meters.
    pub distance_m: f64,
    /// Most recently observed RSS in dBm.
    pub rss_dbm: f64,
    /// Most recently measured server-side throughput in Mbit/s.
    pub throughput_mbps: f64,
}

/// Why the sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// An iteration measured exactly zero server-side throughput.
    ZeroThroughput,
    /// The configured maximum distance was reached.
    MaxDistance,
    /// The run was interrupted between iterations.
    Interrupted,
}

/// Summary of a completed sweep, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    /// Model display name.
    pub model: String,
    /// Path of the result file.
    pub result_file: PathBuf,
    /// Number of rows written.
    pub rows: u64,
    /// Distance of the last row, in meters.
    pub final_distance_m: f64,
    /// Throughput of the last row, in Mbit/s.
    pub final_throughput_mbps: f64,
    /// Why the sweep ended.
    pub termination: Termination,
}

// ============================================================================
// Measurement Reduction
// ============================================================================

/// Server-side throughput in Mbit/s from the sink's received-packet count.
pub fn server_throughput_mbps(received_packets: u64, packet_size_bytes: usize, duration_s: f64) -> f64 {
    received_packets as f64 * packet_size_bytes as f64 * 8.0 / (duration_s * 1e6)
}

/// One reduced per-flow observation, used for progress reporting only.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSample {
    /// Flow source address.
    pub source: Ipv4Addr,
    /// Flow destination address.
    pub destination: Ipv4Addr,
    /// Bytes transmitted by the source.
    pub tx_bytes: u64,
    /// Bytes received at the destination.
    pub rx_bytes: u64,
    /// Throughput over the observed first-transmit/last-receive span,
    /// in Mbit/s (binary megabits, matching the flow-level convention).
    pub throughput_mbps: f64,
}

/// Reduce every tracked flow to a [`FlowSample`].
pub fn reduce_flows(stats: &EngineStats) -> Vec<FlowSample> {
    stats
        .flows
        .iter()
        .map(|(id, flow)| {
            let span_s = match (flow.first_tx, flow.last_rx) {
                (Some(first), Some(last)) if last > first => {
                    last.as_secs_f64() - first.as_secs_f64()
                }
                _ => 0.0,
            };
            let throughput_mbps = if span_s > 0.0 {
                flow.rx_bytes as f64 * 8.0 / span_s / 1024.0 / 1024.0
            } else {
                0.0
            };
            FlowSample {
                source: id.src,
                destination: id.dst,
                tx_bytes: flow.tx_bytes,
                rx_bytes: flow.rx_bytes,
                throughput_mbps,
            }
        })
        .collect()
}

// ============================================================================
// Result File
// ============================================================================

/// Append-only writer for the per-model result file.
///
/// The header is written exactly once at creation; every data row is flushed
/// immediately so partial results survive an abrupt stop.
pub struct ResultWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl ResultWriter {
    /// Create the result file for a model and write the header.
    pub fn create(
        output_dir: &Path,
        model: PropagationModel,
        duration_s: f64,
    ) -> Result<Self, RunnerError> {
        let path = output_dir.join(format!("new_stats_{}.csv", model.name()));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "Simulation Time,Packet Interval")?;
        writeln!(writer, "model: {}", model.name())?;
        writeln!(writer, "{},{}", duration_s, PACKET_INTERVAL_S)?;
        writeln!(writer, "distance [m],rss [dBm],throughput [Mbps]")?;
        writer.flush()?;
        Ok(ResultWriter { writer, path })
    }

    /// Append one data row and flush it.
    pub fn append_row(&mut self, state: &SweepState) -> Result<(), RunnerError> {
        writeln!(
            self.writer,
            "{},{:.4},{:.4}",
            state.distance_m, state.rss_dbm, state.throughput_mbps
        )?;
        self.writer.flush()?;
        Ok(())
    }

    /// Path of the result file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Sweep Loop
// ============================================================================

/// Continuation predicate: the sweep goes on while the just-completed
/// iteration observed nonzero server-side throughput.
fn link_still_alive(state: &SweepState) -> bool {
    state.throughput_mbps != 0.0
}

/// Run one complete distance sweep for the configured model.
///
/// Returns after the first iteration whose server-side throughput is exactly
/// zero (that terminal row is still written), after the optional distance
/// bound is reached, or once `stop_flag` is raised between iterations.
pub fn run_sweep(
    config: &SweepConfig,
    stop_flag: Option<Arc<AtomicBool>>,
) -> Result<SweepSummary, RunnerError> {
    config.validate()?;

    let mut writer = ResultWriter::create(&config.output_dir, config.model, config.duration_s)?;
    info!(
        model = config.model.name(),
        result_file = %writer.path().display(),
        increment_m = config.increment_m,
        duration_s = config.duration_s,
        "starting distance sweep"
    );

    let mut state = SweepState {
        distance_m: INITIAL_DISTANCE_M,
        rss_dbm: 0.0,
        throughput_mbps: 0.0,
    };
    let mut rows = 0u64;
    let termination;

    loop {
        if let Some(flag) = &stop_flag {
            if flag.load(Ordering::Relaxed) {
                info!("stop requested, ending sweep");
                termination = Termination::Interrupted;
                break;
            }
        }

        // Fresh observer slot per iteration; read exactly once below.
        let slot = Arc::new(SignalSlot::new());
        let stats = run_iteration(config, state.distance_m, rows, slot.clone())?;

        state.throughput_mbps =
            server_throughput_mbps(stats.sink_received_packets, PACKET_SIZE_BYTES, config.duration_s);
        if let Some(rss_dbm) = slot.take() {
            state.rss_dbm = rss_dbm;
        }

        for sample in reduce_flows(&stats) {
            info!(
                source = %sample.source,
                destination = %sample.destination,
                tx_bytes = sample.tx_bytes,
                rx_bytes = sample.rx_bytes,
                flow_throughput_mbps = sample.throughput_mbps,
                rss_dbm = state.rss_dbm,
                "flow statistics"
            );
        }
        info!(
            distance_m = state.distance_m,
            rss_dbm = state.rss_dbm,
            throughput_mbps = state.throughput_mbps,
            "iteration complete"
        );

        writer.append_row(&state)?;
        rows += 1;

        if !link_still_alive(&state) {
            termination = Termination::ZeroThroughput;
            break;
        }
        if let Some(max) = config.max_distance_m {
            if state.distance_m >= max {
                info!(max_distance_m = max, "distance bound reached, ending sweep");
                termination = Termination::MaxDistance;
                break;
            }
        }

        state.distance_m += config.increment_m;
    }

    Ok(SweepSummary {
        model: config.model.name().to_string(),
        result_file: writer.path().to_path_buf(),
        rows,
        final_distance_m: state.distance_m,
        final_throughput_mbps: state.throughput_mbps,
        termination,
    })
}

/// Construct and run one scenario at the given distance.
///
/// Every iteration gets its own scenario, event loop and RNG stream, so no
/// simulation state leaks between iterations.
fn run_iteration(
    config: &SweepConfig,
    distance_m: f64,
    iteration: u64,
    observer: Arc<dyn SignalObserver>,
) -> Result<EngineStats, RunnerError> {
    let phy = WifiPhyConfig::new(TX_POWER_DBM, TX_GAIN_DBI, RX_GAIN_DBI, ChannelSettings::ht40_5ghz());
    let loss = config.model.build_loss(&phy.channel)?;

    let scenario_config = ScenarioConfig {
        distance_m,
        z_offset_m: config.model.action().z_offset_m(),
        phy,
        traffic: TrafficConfig {
            packet_size_bytes: PACKET_SIZE_BYTES,
            interval: SimTime::from_secs(PACKET_INTERVAL_S),
            client_start: SimTime::from_secs(CLIENT_START_S),
            client_stop: SimTime::from_secs(config.duration_s),
            server_start: SimTime::from_secs(SERVER_START_S),
            server_stop: SimTime::from_secs(config.duration_s),
            server_port: SERVER_PORT,
        },
        seed: config.seed.wrapping_add(iteration),
    };

    debug!(
        distance_m,
        model = config.model.name(),
        seed = scenario_config.seed,
        "constructing scenario"
    );
    let scenario = build_scenario(&scenario_config, loss, observer)?;
    let mut event_loop = EventLoop::new(scenario, scenario_config.seed);
    let horizon = SimTime::from_secs(config.duration_s + RUN_TAIL_S);
    let stats = event_loop.run(horizon)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use linklab_engine::{FlowId, FlowStats};
    use std::collections::BTreeMap;

    fn config(model: PropagationModel, increment_m: f64, dir: &Path) -> SweepConfig {
        SweepConfig {
            model,
            increment_m,
            duration_s: 3.0,
            seed: 1,
            output_dir: dir.to_path_buf(),
            max_distance_m: None,
        }
    }

    fn read_rows(path: &Path) -> (Vec<String>, Vec<(f64, f64, f64)>) {
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let header = lines[..4].to_vec();
        let rows = lines[4..]
            .iter()
            .map(|line| {
                let fields: Vec<f64> = line.split(',').map(|f| f.parse().unwrap()).collect();
                (fields[0], fields[1], fields[2])
            })
            .collect();
        (header, rows)
    }

    #[test]
    fn throughput_formula_is_exact() {
        let t = server_throughput_mbps(1000, 1450, 3.0);
        assert_eq!(t, 1000.0 * 1450.0 * 8.0 / (3.0 * 1e6));
        assert_eq!(server_throughput_mbps(0, 1450, 3.0), 0.0);
    }

    #[test]
    fn flow_reduction_uses_observed_span() {
        let mut flows = BTreeMap::new();
        flows.insert(
            FlowId {
                src: Ipv4Addr::new(10, 1, 1, 1),
                dst: Ipv4Addr::new(10, 1, 1, 2),
                dst_port: 9,
            },
            FlowStats {
                tx_packets: 100,
                tx_bytes: 145_000,
                rx_packets: 80,
                rx_bytes: 116_000,
                first_tx: Some(SimTime::from_secs(2.0)),
                last_rx: Some(SimTime::from_secs(3.0)),
            },
        );
        let stats = EngineStats {
            total_events: 0,
            sink_received_packets: 80,
            sink_rx_bytes: 116_000,
            flows,
        };

        let samples = reduce_flows(&stats);
        assert_eq!(samples.len(), 1);
        let expected = 116_000.0 * 8.0 / 1.0 / 1024.0 / 1024.0;
        assert!((samples[0].throughput_mbps - expected).abs() < 1e-12);

        // A flow that never delivered anything reduces to zero throughput.
        let mut dead = stats.clone();
        dead.flows.values_mut().for_each(|f| f.last_rx = None);
        assert_eq!(reduce_flows(&dead)[0].throughput_mbps, 0.0);
    }

    #[test]
    fn config_validation_rejects_bad_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(PropagationModel::Friis, 0.0, dir.path());
        assert!(c.validate().is_err());

        c = config(PropagationModel::Friis, 1.0, dir.path());
        c.duration_s = 1.5; // inside the source start offset
        assert!(c.validate().is_err());

        c = config(PropagationModel::Friis, 1.0, dir.path());
        c.max_distance_m = Some(2.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn result_file_has_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResultWriter::create(dir.path(), PropagationModel::Friis, 3.0).unwrap();
        writer
            .append_row(&SweepState { distance_m: 5.0, rss_dbm: -60.5, throughput_mbps: 74.9 })
            .unwrap();
        writer
            .append_row(&SweepState { distance_m: 6.0, rss_dbm: -62.0, throughput_mbps: 0.0 })
            .unwrap();

        let (header, rows) = read_rows(writer.path());
        assert_eq!(header[0], "Simulation Time,Packet Interval");
        assert_eq!(header[1], "model: FriisPropagationLossModel");
        assert_eq!(header[2], "3,0.0001547");
        assert_eq!(header[3], "distance [m],rss [dBm],throughput [Mbps]");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].2, 0.0);
    }

    #[test]
    fn friis_sweep_terminates_with_zero_throughput_row() {
        let dir = tempfile::tempdir().unwrap();
        let c = config(PropagationModel::Friis, 100.0, dir.path());
        let summary = run_sweep(&c, None).unwrap();

        assert_eq!(summary.termination, Termination::ZeroThroughput);
        assert_eq!(summary.final_throughput_mbps, 0.0);

        let (_, rows) = read_rows(&summary.result_file);
        assert_eq!(rows.len() as u64, summary.rows);
        assert!(rows.len() >= 2, "expected at least one live row before the terminal row");

        // Distance starts at the initial value and advances by the increment.
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.0, INITIAL_DISTANCE_M + i as f64 * 100.0);
        }
        // All rows but the last carry traffic; the last is the terminal row.
        for row in &rows[..rows.len() - 1] {
            assert!(row.2 > 0.0);
        }
        assert_eq!(rows.last().unwrap().2, 0.0);
    }

    #[test]
    fn fixed_rss_sweep_reports_constant_rss_until_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(PropagationModel::FixedRss, 1.0, dir.path());
        // FixedRss never drives throughput to zero; bound the sweep.
        c.max_distance_m = Some(8.0);
        let summary = run_sweep(&c, None).unwrap();

        assert_eq!(summary.termination, Termination::MaxDistance);
        let (_, rows) = read_rows(&summary.result_file);
        assert_eq!(rows.len(), 4); // distances 5, 6, 7, 8

        // RSS is the fixed constant plus receive gain, independent of distance.
        for row in &rows {
            assert!((row.1 - (crate::models::FIXED_RSS_DBM + RX_GAIN_DBI)).abs() < 1e-6);
            assert!(row.2 > 0.0);
        }
    }

    #[test]
    fn sweep_is_deterministic() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = run_sweep(&config(PropagationModel::ThreeLogDistance, 50.0, dir_a.path()), None)
            .unwrap();
        let b = run_sweep(&config(PropagationModel::ThreeLogDistance, 50.0, dir_b.path()), None)
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&a.result_file).unwrap(),
            std::fs::read_to_string(&b.result_file).unwrap()
        );
    }

    #[test]
    fn pre_raised_stop_flag_writes_no_rows() {
        let dir = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let summary =
            run_sweep(&config(PropagationModel::Friis, 100.0, dir.path()), Some(flag)).unwrap();
        assert_eq!(summary.termination, Termination::Interrupted);
        assert_eq!(summary.rows, 0);
        // Header is still in place.
        let (header, rows) = read_rows(&summary.result_file);
        assert_eq!(header.len(), 4);
        assert!(rows.is_empty());
    }
}
