//! Statistics reports pushed to an external observer
//!
//! A report travels as seven space-separated fields:
//! `frames_received frames_received_ok frames_transmitted elapsed_seconds
//! app_bytes_received app_bytes_transmitted timeouts`.

use std::fmt;
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub frames_received: u64,
    pub frames_received_ok: u64,
    pub frames_transmitted: u64,
    pub elapsed_secs: f64,
    pub app_bytes_received: u64,
    pub app_bytes_transmitted: u64,
    pub timeouts: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseStatsError {
    #[error("expected 7 fields, got {0}")]
    FieldCount(usize),

    #[error("field {0} is not a number")]
    BadField(usize),
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.frames_received,
            self.frames_received_ok,
            self.frames_transmitted,
            self.elapsed_secs,
            self.app_bytes_received,
            self.app_bytes_transmitted,
            self.timeouts
        )
    }
}

impl FromStr for StatsReport {
    type Err = ParseStatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(ParseStatsError::FieldCount(fields.len()));
        }
        let int = |i: usize| fields[i].parse::<u64>().map_err(|_| ParseStatsError::BadField(i));
        let elapsed_secs = fields[3]
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or(ParseStatsError::BadField(3))?;

        Ok(Self {
            frames_received: int(0)?,
            frames_received_ok: int(1)?,
            frames_transmitted: int(2)?,
            elapsed_secs,
            app_bytes_received: int(4)?,
            app_bytes_transmitted: int(5)?,
            timeouts: int(6)?,
        })
    }
}

impl StatsReport {
    /// Parses a report, treating anything garbled or partial as no update.
    pub fn parse_lossy(text: &str) -> Option<Self> {
        text.parse().ok()
    }
}

/// One-way push channel for reports. Delivery is best effort.
pub trait StatsObserver: Send + Sync {
    fn publish(&self, report: &StatsReport);
}

/// Sends each report as its text form over an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatsObserver for ChannelObserver {
    fn publish(&self, report: &StatsReport) {
        // a vanished consumer is not the protocol's problem
        let _ = self.tx.send(report.to_string());
    }
}

/// Writes reports to the log under the given station name.
pub struct LogObserver {
    pub name: String,
}

impl StatsObserver for LogObserver {
    fn publish(&self, report: &StatsReport) {
        info!("[{}] stats: {}", self.name, report);
    }
}
