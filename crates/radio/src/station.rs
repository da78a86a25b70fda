//! Bookkeeping shared by relay and node: transmission, counters, periodic
//! statistics and the single graceful shutdown path.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use relaying_core::{ChannelCoder, ChannelError};
use tokio::time::{sleep, Instant};

use crate::config::{RadioParams, StationConfig};
use crate::stats::{StatsObserver, StatsReport};
use crate::transceiver::Transceiver;
use crate::StationError;

#[derive(Debug, Clone, Copy)]
pub struct Counters {
    pub frames_received: u64,
    pub frames_received_ok: u64,
    pub frames_transmitted: u64,
    pub app_bytes_received: u64,
    pub app_bytes_transmitted: u64,
    pub started: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            frames_received: 0,
            frames_received_ok: 0,
            frames_transmitted: 0,
            app_bytes_received: 0,
            app_bytes_transmitted: 0,
            started: Instant::now(),
        }
    }
}

pub struct StationCore {
    name: String,
    coder: ChannelCoder,
    radio: RadioParams,
    transceiver: Arc<dyn Transceiver>,
    observer: Option<Arc<dyn StatsObserver>>,
    counters: Counters,
    stats_interval: u32,
    events_since_report: u32,
    overflow: Vec<Vec<u8>>,
    grace_period: Duration,
    stopped: bool,
}

impl StationCore {
    pub fn new(name: impl Into<String>, config: &StationConfig, transceiver: Arc<dyn Transceiver>) -> Self {
        Self {
            name: name.into(),
            coder: ChannelCoder::new(config.channel_code),
            radio: config.radio.clone(),
            transceiver,
            observer: None,
            counters: Counters::new(),
            stats_interval: config.stats_interval,
            events_since_report: 0,
            overflow: Vec::new(),
            grace_period: config.grace_period,
            stopped: false,
        }
    }

    pub fn set_observer(&mut self, observer: Arc<dyn StatsObserver>) {
        self.observer = Some(observer);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coder(&self) -> &ChannelCoder {
        &self.coder
    }

    /// Front-end settings, only ever logged.
    pub fn radio(&self) -> &RadioParams {
        &self.radio
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Frames the transceiver refused, oldest first.
    pub fn overflow(&self) -> &[Vec<u8>] {
        &self.overflow
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Resource check run before the station starts operating.
    pub async fn ensure_transceiver(&self) -> Result<(), StationError> {
        self.transceiver.probe().await?;
        Ok(())
    }

    pub fn record_received(&mut self) {
        self.counters.frames_received += 1;
    }

    pub fn record_received_ok(&mut self) {
        self.counters.frames_received_ok += 1;
    }

    pub fn record_app_received(&mut self, bytes: usize) {
        self.counters.app_bytes_received += bytes as u64;
    }

    pub fn record_app_transmitted(&mut self, bytes: usize) {
        self.counters.app_bytes_transmitted += bytes as u64;
    }

    /// Channel-codes and frames `packet`, then hands it to the transceiver.
    pub async fn send_packet(&mut self, packet: &[u8], extra: u64) -> Result<(), ChannelError> {
        let wire = self.coder.wrap(packet)?;
        self.send_frame(&wire, false, extra).await;
        Ok(())
    }

    /// Transmits an already framed byte sequence. A refused frame goes to the
    /// overflow log.
    pub async fn send_frame(&mut self, wire: &[u8], end_of_flow: bool, extra: u64) {
        if let Err(e) = self.transceiver.transmit(wire, end_of_flow).await {
            warn!("[{}] transmit failed ({}), keeping {} byte frame in overflow log", self.name, e, wire.len());
            self.overflow.push(wire.to_vec());
        }
        self.counters.frames_transmitted += 1;
        self.tick(extra);
    }

    /// Counts one transmit/receive event and reports every `stats_interval` events.
    pub fn tick(&mut self, extra: u64) {
        self.events_since_report += 1;
        if self.events_since_report >= self.stats_interval {
            self.events_since_report = 0;
            self.report_statistics(extra);
        }
    }

    pub fn snapshot(&self, extra: u64) -> StatsReport {
        StatsReport {
            frames_received: self.counters.frames_received,
            frames_received_ok: self.counters.frames_received_ok,
            frames_transmitted: self.counters.frames_transmitted,
            elapsed_secs: self.counters.started.elapsed().as_secs_f64(),
            app_bytes_received: self.counters.app_bytes_received,
            app_bytes_transmitted: self.counters.app_bytes_transmitted,
            timeouts: extra,
        }
    }

    pub fn report_statistics(&self, extra: u64) {
        let report = self.snapshot(extra);
        debug!("[{}] {}", self.name, report);
        if let Some(observer) = &self.observer {
            observer.publish(&report);
        }
    }

    /// Publishes a final report, waits out the grace period and stops the
    /// transceiver. Returns false if the station was already stopped.
    pub async fn graceful_shutdown(&mut self, extra: u64) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.report_statistics(extra);
        if !self.grace_period.is_zero() {
            sleep(self.grace_period).await;
        }
        self.transceiver.stop().await;
        info!("[{}] stopped: {}", self.name, self.snapshot(extra));
        true
    }
}
