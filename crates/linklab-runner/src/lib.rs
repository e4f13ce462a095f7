//! # linklab-runner library
//!
//! Library interface for the linklab distance-sweep experiment driver.
//!
//! The driver characterizes the usable range of a point-to-point wireless
//! link under a selectable propagation loss model: starting from a fixed
//! separation it runs one simulated communication session per distance,
//! measures received signal strength and server-side throughput, appends a
//! row to the per-model result file, and advances the distance until
//! throughput collapses to zero.

pub mod models;
pub mod sweep;

pub use models::{DispatchAction, PropagationModel, ANTENNA_HEIGHT_M, FIXED_RSS_DBM};
pub use sweep::{
    reduce_flows, run_sweep, server_throughput_mbps, FlowSample, ResultWriter, SweepConfig,
    SweepState, SweepSummary, Termination, INITIAL_DISTANCE_M, PACKET_INTERVAL_S,
    PACKET_SIZE_BYTES,
};

use thiserror::Error;

/// Errors that can occur while running a sweep.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration error; raised before any simulation work begins.
    #[error("configuration error: {0}")]
    Config(String),

    /// Propagation model construction error.
    #[error("propagation model error: {0}")]
    Propagation(#[from] linklab_propagation::PropagationError),

    /// Engine construction or run failure.
    #[error("engine error: {0}")]
    Engine(#[from] linklab_engine::EngineError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
