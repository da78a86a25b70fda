//! Relay and node stations for the half-duplex three-station relaying protocol

use std::time::Duration;

use relaying_core::{ChannelError, CodingError, HeaderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod data;
pub mod node;
pub mod relay;
pub mod runner;
pub mod simulated;
pub mod station;
pub mod stats;
pub mod transceiver;

pub use config::{ConfigError, Mode, RadioParams, Role, StationConfig};
pub use data::{DataSink, DataSource};
pub use node::Node;
pub use relay::{Relay, MAX_TIMEOUTS};
pub use runner::{run, ExitReason, Flow, Station};
pub use simulated::{Endpoint, MediumStats, SimulatedMedium, SimulatedTransceiver};
pub use station::StationCore;
pub use stats::{ChannelObserver, LogObserver, StatsObserver, StatsReport};
pub use transceiver::{station_channel, RecordingTransceiver, StationEvent, StationHandle, Transceiver};

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Frame too large for the medium")]
    PacketTooLarge,

    #[error("Radio transmission failed")]
    TransmissionFailed,

    #[error("Transceiver unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    #[error("network coding error: {0}")]
    Coding(#[from] CodingError),

    #[error("channel coding error: {0}")]
    Channel(#[from] ChannelError),

    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Conditions of the simulated shared medium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumConfig {
    pub mtu: usize,
    pub bandwidth_bps: u32,
    pub packet_loss: f32,
    pub bit_error_rate: f64,
    pub latency: Duration,
    pub latency_jitter: Duration,
    /// Loss on the node-to-node path; `None` means the nodes cannot hear each other.
    pub direct_link_loss: Option<f32>,
    pub seed: Option<u64>,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            mtu: relaying_core::channel::WIRE_DATA_LEN,
            bandwidth_bps: 512_000,
            packet_loss: 0.02,
            bit_error_rate: 0.0,
            latency: Duration::from_millis(1),
            latency_jitter: Duration::ZERO,
            direct_link_loss: None,
            seed: None,
        }
    }
}
