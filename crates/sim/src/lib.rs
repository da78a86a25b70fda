//! simulation tools for the three-station relay

pub mod scenarios;

use std::time::Duration;
use relaying_radio::MediumConfig;

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> MediumConfig {
        MediumConfig {
            packet_loss: 0.01,
            bit_error_rate: 1e-5,
            latency: Duration::from_millis(1),
            latency_jitter: Duration::from_micros(200),
            ..Default::default()
        }
    }

    pub fn average_conditions() -> MediumConfig {
        MediumConfig {
            packet_loss: 0.05,
            bit_error_rate: 1e-4,
            latency: Duration::from_millis(2),
            latency_jitter: Duration::from_micros(500),
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> MediumConfig {
        MediumConfig {
            bandwidth_bps: 256_000,
            packet_loss: 0.15,
            bit_error_rate: 1e-3,
            latency: Duration::from_millis(5),
            latency_jitter: Duration::from_millis(2),
            ..Default::default()
        }
    }

    /// Bit errors beyond what RS(255,223) can repair in most frames.
    pub fn extreme_conditions() -> MediumConfig {
        MediumConfig {
            bandwidth_bps: 128_000,
            packet_loss: 0.30,
            bit_error_rate: 1e-2,
            latency: Duration::from_millis(10),
            latency_jitter: Duration::from_millis(5),
            ..Default::default()
        }
    }
}
