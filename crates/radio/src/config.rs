//! Station configuration, fixed for the lifetime of a run

use std::time::Duration;

use relaying_core::{ChannelCode, NodeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("network coding needs the relay to forward traffic, not terminate it")]
    CodingWithoutForwarding,

    #[error("burst size must be between 1 and {max}, got {got}")]
    BurstSize { got: usize, max: usize },

    #[error("timeout must be non-zero")]
    ZeroTimeout,

    #[error("statistics interval must be non-zero")]
    ZeroStatsInterval,

    #[error("configuration is for a {expected}, not a {actual}")]
    WrongRole { expected: &'static str, actual: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Relay,
    Node(NodeId),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Relay => "relay",
            Role::Node(_) => "node",
        }
    }
}

/// Traffic pattern of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Benchmark of the node-to-relay links: the relay polls and discards.
    PointToPoint { both_nodes: bool },
    /// Only A is polled; its data is forwarded to B.
    OneWay,
    /// A and B are polled in turn and their bursts forwarded unchanged.
    TwoWay,
    /// A and B are polled in turn and their frames XOR-combined.
    NetworkCoded,
}

impl Mode {
    /// Builds a mode from the three independent switches of the original
    /// control surface, refusing combinations that make no sense.
    pub fn from_flags(network_coding: bool, bidirectional: bool, point_to_point: bool) -> Result<Self, ConfigError> {
        match (network_coding, bidirectional, point_to_point) {
            (true, _, true) => Err(ConfigError::CodingWithoutForwarding),
            (true, _, false) => Ok(Mode::NetworkCoded),
            (false, both_nodes, true) => Ok(Mode::PointToPoint { both_nodes }),
            (false, true, false) => Ok(Mode::TwoWay),
            (false, false, false) => Ok(Mode::OneWay),
        }
    }

    pub fn network_coding(self) -> bool {
        matches!(self, Mode::NetworkCoded)
    }

    pub fn point_to_point(self) -> bool {
        matches!(self, Mode::PointToPoint { .. })
    }

    /// Whether the relay switches to the other node after each burst.
    pub fn alternates(self) -> bool {
        match self {
            Mode::PointToPoint { both_nodes } => both_nodes,
            Mode::OneWay => false,
            Mode::TwoWay | Mode::NetworkCoded => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulation {
    Gmsk,
    Cpm,
    Dbpsk,
    Dqpsk,
    D8psk,
}

/// Front-end settings handed to the transceiver. The protocol never reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioParams {
    pub side: Side,
    pub frequency_hz: f64,
    pub bit_rate: u32,
    pub tx_gain_db: f32,
    pub rx_gain_db: f32,
    pub modulation: Modulation,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            side: Side::B,
            frequency_hz: 5.375e9,
            bit_rate: 512_000,
            tx_gain_db: 20.0,
            rx_gain_db: 66.0,
            modulation: Modulation::Gmsk,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub role: Role,
    pub mode: Mode,
    pub channel_code: ChannelCode,
    /// Relay only: how long to wait for a node before re-requesting.
    pub timeout: Duration,
    /// Node only: packets per burst.
    pub burst_size: usize,
    /// Node only: accept frames heard directly from the peer.
    pub direct_link: bool,
    /// Publish statistics every this many transmit/receive events.
    pub stats_interval: u32,
    pub grace_period: Duration,
    /// Relay only: stop after this many transmissions.
    pub max_transmissions: Option<u64>,
    pub radio: RadioParams,
}

impl StationConfig {
    pub const MAX_BURST_SIZE: usize = 1024;

    pub fn relay(mode: Mode) -> Self {
        Self { role: Role::Relay, mode, ..Default::default() }
    }

    pub fn node(id: NodeId, mode: Mode) -> Self {
        Self { role: Role::Node(id), mode, ..Default::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_size == 0 || self.burst_size > Self::MAX_BURST_SIZE {
            return Err(ConfigError::BurstSize { got: self.burst_size, max: Self::MAX_BURST_SIZE });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.stats_interval == 0 {
            return Err(ConfigError::ZeroStatsInterval);
        }
        Ok(())
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            role: Role::Relay,
            mode: Mode::NetworkCoded,
            channel_code: ChannelCode::ReedSolomon,
            timeout: Duration::from_secs(1),
            burst_size: 1,
            direct_link: false,
            stats_interval: 100,
            grace_period: Duration::from_secs(1),
            max_transmissions: None,
            radio: RadioParams::default(),
        }
    }
}
