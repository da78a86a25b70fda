//! Relay station
//!
//! Polls A and B in turn, buffers what each sends and forwards it to the other
//! side, either unchanged or XOR-combined when network coding is on. The last
//! forwarded packet of a burst carries the next request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use relaying_core::network_coding::{self, unit};
use relaying_core::types::HEADER_LEN_NODE;
use relaying_core::{Header, HeaderCodec, NodeId, PacketId, RelayHeaderFields};
use tokio::time::Instant;

use crate::config::{ConfigError, Mode, Role, StationConfig};
use crate::runner::{ExitReason, Flow, Station};
use crate::station::StationCore;
use crate::stats::StatsObserver;
use crate::transceiver::Transceiver;
use crate::StationError;

/// Consecutive timeouts after which the link is considered dead.
pub const MAX_TIMEOUTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BufferedFrame {
    id: PacketId,
    data: Vec<u8>,
}

pub struct Relay {
    core: StationCore,
    codec: HeaderCodec,
    mode: Mode,
    timeout: Duration,
    max_transmissions: Option<u64>,
    current_aim: NodeId,
    timeouts: u32,
    timeouts_all: u64,
    buffered_data: bool,
    buffer_a: Vec<BufferedFrame>,
    buffer_b: Vec<BufferedFrame>,
    deadline: Option<Instant>,
    exit: Option<ExitReason>,
}

impl Relay {
    pub fn new(config: StationConfig, transceiver: Arc<dyn Transceiver>) -> Result<Self, StationError> {
        if config.role != Role::Relay {
            return Err(ConfigError::WrongRole { expected: "relay", actual: config.role.name() }.into());
        }
        config.validate()?;

        Ok(Self {
            core: StationCore::new("relay", &config, transceiver),
            codec: HeaderCodec::relay(),
            mode: config.mode,
            timeout: config.timeout,
            max_transmissions: config.max_transmissions,
            current_aim: NodeId::A,
            timeouts: 0,
            timeouts_all: 0,
            buffered_data: false,
            buffer_a: Vec::new(),
            buffer_b: Vec::new(),
            deadline: None,
            exit: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatsObserver>) -> Self {
        self.core.set_observer(observer);
        self
    }

    pub fn core(&self) -> &StationCore {
        &self.core
    }

    pub fn current_aim(&self) -> NodeId {
        self.current_aim
    }

    /// Consecutive timeouts since the last valid frame.
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn timeouts_total(&self) -> u64 {
        self.timeouts_all
    }

    /// Number of frames held for A and for B.
    pub fn buffered(&self) -> (usize, usize) {
        (self.buffer_a.len(), self.buffer_b.len())
    }

    fn arm_timer(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    async fn send_request(&mut self) -> Result<(), StationError> {
        let header = self.codec.encode_relay_header(&RelayHeaderFields::request(self.current_aim))?;
        trace!("requesting data from {}", self.current_aim);
        self.core.send_packet(&header, self.timeouts_all).await?;
        Ok(())
    }

    /// Flushes both buffers towards the nodes. The last packet carries a
    /// request for the current aim; with nothing to flush a pure request is
    /// sent instead.
    async fn forward_buffered(&mut self) -> Result<(), StationError> {
        let buffer_a = std::mem::take(&mut self.buffer_a);
        let buffer_b = std::mem::take(&mut self.buffer_b);
        self.buffered_data = false;

        let mut packets = Vec::with_capacity(buffer_a.len().max(buffer_b.len()));
        if self.mode.network_coding() {
            for i in 0..buffer_a.len().max(buffer_b.len()) {
                match (buffer_a.get(i), buffer_b.get(i)) {
                    (Some(a), Some(b)) => {
                        let combined = network_coding::combine(&unit(&a.data), &unit(&b.data))?;
                        let fields = RelayHeaderFields::coded(a.id, b.id, combined[0]);
                        packets.push((fields, combined[1..].to_vec()));
                    }
                    (Some(a), None) => packets.push(plain(NodeId::A, a)),
                    (None, Some(b)) => packets.push(plain(NodeId::B, b)),
                    (None, None) => {}
                }
            }
        } else {
            packets.extend(buffer_a.iter().map(|a| plain(NodeId::A, a)));
            packets.extend(buffer_b.iter().map(|b| plain(NodeId::B, b)));
        }

        if packets.is_empty() {
            return self.send_request().await;
        }

        debug!("forwarding {} packets, request to {}", packets.len(), self.current_aim);
        let last = packets.len() - 1;
        for (i, (fields, data)) in packets.into_iter().enumerate() {
            let fields = if i == last { fields.with_request(Some(self.current_aim)) } else { fields };
            let mut packet = self.codec.encode_relay_header(&fields)?;
            packet.extend_from_slice(&data);
            self.core.record_app_transmitted(data.len());
            self.core.send_packet(&packet, self.timeouts_all).await?;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, wire: &[u8]) -> Result<(), StationError> {
        let opened = match self.core.coder().open(wire) {
            Ok(opened) => opened,
            Err(e) => {
                debug!("dropping undecodable frame: {}", e);
                return Ok(());
            }
        };
        if !opened.crc_ok {
            debug!("dropping frame with bad CRC");
            return Ok(());
        }
        self.core.record_received_ok();
        self.timeouts = 0;

        let header = match Header::parse(&opened.payload) {
            Ok(header) => header,
            Err(e) => {
                warn!("dropping frame with unparseable header: {}", e);
                return Ok(());
            }
        };
        let flags = self.codec.decode_control_byte(header.control);
        if flags.relay_origin {
            trace!("ignoring frame from another relay");
            return Ok(());
        }
        let Some(source) = flags.single_source().or_else(|| NodeId::owner_of(header.id)) else {
            warn!("dropping frame with no identifiable source (id {})", header.id);
            return Ok(());
        };
        let end = HEADER_LEN_NODE + header.length as usize;
        let Some(data) = opened.payload.get(HEADER_LEN_NODE..end) else {
            warn!("dropping frame from {}: length {} overruns the payload", source, header.length);
            return Ok(());
        };

        self.core.record_app_received(data.len());
        let frame = BufferedFrame { id: header.id, data: data.to_vec() };
        match source {
            NodeId::A => self.buffer_a.push(frame),
            NodeId::B => self.buffer_b.push(frame),
        }
        let other = match source {
            NodeId::A => &self.buffer_b,
            NodeId::B => &self.buffer_a,
        };
        if !other.is_empty() {
            self.buffered_data = true;
        }
        trace!("buffered packet {} from {}", header.id, source);

        if !flags.last_in_burst {
            return Ok(());
        }
        if self.mode.alternates() {
            self.current_aim = self.current_aim.other();
        }

        let mode = self.mode;
        match mode {
            Mode::NetworkCoded if self.buffered_data => self.forward_buffered().await,
            Mode::NetworkCoded => self.send_request().await,
            Mode::PointToPoint { .. } => {
                self.clear_buffers();
                self.send_request().await
            }
            Mode::OneWay | Mode::TwoWay => self.forward_buffered().await,
        }
    }

    fn clear_buffers(&mut self) {
        self.buffer_a.clear();
        self.buffer_b.clear();
        self.buffered_data = false;
    }

    async fn check_limit(&mut self) -> Flow {
        match self.max_transmissions {
            Some(max) if self.core.counters().frames_transmitted >= max => {
                info!("transmission limit of {} reached", max);
                Flow::Stop(self.shutdown(ExitReason::TransmissionLimit).await)
            }
            _ => Flow::Continue,
        }
    }
}

fn plain(source: NodeId, frame: &BufferedFrame) -> (RelayHeaderFields, Vec<u8>) {
    let length = frame.data.len().min(u8::MAX as usize) as u8;
    (RelayHeaderFields::forward(source, frame.id, length), frame.data.clone())
}

#[async_trait]
impl Station for Relay {
    async fn start(&mut self) -> Result<Flow, StationError> {
        self.core.ensure_transceiver().await?;
        info!(
            "relay starting in {:?} mode, code {:?}, radio {:?}",
            self.mode,
            self.core.coder().code(),
            self.core.radio()
        );
        self.send_request().await?;
        self.arm_timer();
        Ok(Flow::Continue)
    }

    async fn on_frame(&mut self, frame: &[u8]) -> Result<Flow, StationError> {
        if let Some(reason) = self.exit {
            return Ok(Flow::Stop(reason));
        }
        self.deadline = None;
        self.core.record_received();
        self.handle_frame(frame).await?;
        self.core.tick(self.timeouts_all);
        self.arm_timer();
        Ok(self.check_limit().await)
    }

    async fn on_timeout(&mut self) -> Result<Flow, StationError> {
        if let Some(reason) = self.exit {
            return Ok(Flow::Stop(reason));
        }
        self.deadline = None;
        self.timeouts += 1;
        self.timeouts_all += 1;

        if self.timeouts >= MAX_TIMEOUTS {
            warn!("{} consecutive timeouts waiting for {}, link is down", self.timeouts, self.current_aim);
            self.core.send_frame(&[], true, self.timeouts_all).await;
            return Ok(Flow::Stop(self.shutdown(ExitReason::LinkFailure).await));
        }

        debug!("timeout {} waiting for {}", self.timeouts, self.current_aim);
        let pending = !self.buffer_a.is_empty() || !self.buffer_b.is_empty();
        if pending && !self.mode.point_to_point() {
            self.forward_buffered().await?;
        } else {
            self.clear_buffers();
            self.send_request().await?;
        }
        self.arm_timer();
        Ok(self.check_limit().await)
    }

    async fn shutdown(&mut self, reason: ExitReason) -> ExitReason {
        if let Some(first) = self.exit {
            return first;
        }
        self.exit = Some(reason);
        self.deadline = None;
        info!("relay shutting down: {:?}", reason);
        self.core.graceful_shutdown(self.timeouts_all).await;
        reason
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
