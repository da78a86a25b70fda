//! End node station
//!
//! A node only speaks when asked: every frame carrying its request bit makes
//! it send one burst. Frames for it arrive forwarded by the relay, possibly
//! XOR-combined with its own earlier packet, or directly from the peer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use relaying_core::network_coding::{self, unit};
use relaying_core::types::HEADER_LEN_NODE;
use relaying_core::{Header, HeaderCodec, NodeId, PacketId};
use tokio::time::Instant;

use crate::config::{ConfigError, Role, StationConfig};
use crate::data::{DataSink, DataSource};
use crate::runner::{ExitReason, Flow, Station};
use crate::station::StationCore;
use crate::stats::StatsObserver;
use crate::transceiver::Transceiver;
use crate::StationError;

/// How many directly heard packet IDs are remembered for deduplication.
const DIRECT_WINDOW: usize = 256;

pub struct Node {
    core: StationCore,
    id: NodeId,
    codec: HeaderCodec,
    network_coding: bool,
    direct_link: bool,
    burst_size: usize,
    packet_id: PacketId,
    /// Own units sent while network coding is on, keyed by packet ID. A unit is
    /// dropped once a coded frame uses it; others stay until the ID wraps, so
    /// the table is bounded only by the send range.
    last_packets: HashMap<PacketId, Vec<u8>>,
    heard_directly: VecDeque<PacketId>,
    source: Box<dyn DataSource>,
    sink: Box<dyn DataSink>,
    other_aim: u64,
    other_node: u64,
    exit: Option<ExitReason>,
}

impl Node {
    pub fn new(
        config: StationConfig,
        transceiver: Arc<dyn Transceiver>,
        source: Box<dyn DataSource>,
        sink: Box<dyn DataSink>,
    ) -> Result<Self, StationError> {
        let Role::Node(id) = config.role else {
            return Err(ConfigError::WrongRole { expected: "node", actual: config.role.name() }.into());
        };
        config.validate()?;

        Ok(Self {
            core: StationCore::new(format!("node {}", id), &config, transceiver),
            id,
            codec: HeaderCodec::node(id),
            network_coding: config.mode.network_coding(),
            direct_link: config.direct_link,
            burst_size: config.burst_size,
            packet_id: *id.send_range().start(),
            last_packets: HashMap::new(),
            heard_directly: VecDeque::with_capacity(DIRECT_WINDOW),
            source,
            sink,
            other_aim: 0,
            other_node: 0,
            exit: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatsObserver>) -> Self {
        self.core.set_observer(observer);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn core(&self) -> &StationCore {
        &self.core
    }

    /// Relay frames that carried the other node's data.
    pub fn other_aim(&self) -> u64 {
        self.other_aim
    }

    /// Frames heard directly from the peer.
    pub fn other_node(&self) -> u64 {
        self.other_node
    }

    fn next_packet_id(&mut self) -> PacketId {
        let range = self.id.send_range();
        let id = self.packet_id;
        self.packet_id = if id >= *range.end() { *range.start() } else { id + 1 };
        id
    }

    /// Sends one burst of `burst_size` packets, the last flagged last-in-burst.
    pub async fn send_data(&mut self) -> Result<(), StationError> {
        let capacity = self.core.coder().code().payload_capacity();
        for i in 0..self.burst_size {
            let last = i + 1 == self.burst_size;
            let mut data = match self.source.read(capacity) {
                Ok(data) => data,
                Err(e) => {
                    warn!("[{}] data source read failed: {}", self.core.name(), e);
                    Vec::new()
                }
            };
            if data.len() > capacity {
                warn!("[{}] data source returned {} bytes, truncating to {}", self.core.name(), data.len(), capacity);
                data.truncate(capacity);
            }

            let id = self.next_packet_id();
            let header = self.codec.encode_node_header(id, data.len() as u8, last)?;
            let mut packet = Vec::with_capacity(HEADER_LEN_NODE + data.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(&data);

            if self.network_coding {
                self.last_packets.insert(id, unit(&data));
            }
            trace!("[{}] sending packet {} ({} bytes, last: {})", self.core.name(), id, data.len(), last);
            self.core.record_app_transmitted(data.len());
            self.core.send_packet(&packet, 0).await?;
        }
        Ok(())
    }

    fn deliver(&mut self, id: PacketId, data: &[u8]) {
        if self.heard_directly.contains(&id) {
            trace!("[{}] packet {} already heard directly", self.core.name(), id);
            return;
        }
        self.core.record_app_received(data.len());
        if let Err(e) = self.sink.write(data) {
            warn!("[{}] data sink write failed: {}", self.core.name(), e);
        }
    }

    fn remember_direct(&mut self, id: PacketId) {
        if self.heard_directly.len() == DIRECT_WINDOW {
            self.heard_directly.pop_front();
        }
        self.heard_directly.push_back(id);
    }

    fn receive_coded(&mut self, header: &Header, payload: &[u8]) {
        let (Some(own_id), Some(peer_id)) = (header.coded_id_of(self.id), header.coded_id_of(self.id.other())) else {
            return;
        };
        let Some(own) = self.last_packets.remove(&own_id) else {
            warn!("[{}] no retained packet {}, cannot decode", self.core.name(), own_id);
            return;
        };
        // the length byte of the coded unit is the last header byte
        let coded = &payload[header.encoded_len() - 1..];
        match network_coding::decode(coded, &own) {
            Ok(peer_unit) => {
                if let Some((_, data)) = peer_unit.split_first() {
                    self.deliver(peer_id, data);
                }
            }
            Err(e) => warn!("[{}] dropping coded packet {}: {}", self.core.name(), peer_id, e),
        }
    }

    fn plain_data<'a>(&self, header: &Header, payload: &'a [u8], header_len: usize) -> Option<&'a [u8]> {
        let data = payload.get(header_len..header_len + header.length as usize);
        if data.is_none() {
            warn!("[{}] length {} overruns the payload of packet {}", self.core.name(), header.length, header.id);
        }
        data
    }

    async fn handle_frame(&mut self, wire: &[u8]) -> Result<(), StationError> {
        let opened = match self.core.coder().open(wire) {
            Ok(opened) => opened,
            Err(e) => {
                debug!("[{}] dropping undecodable frame: {}", self.core.name(), e);
                return Ok(());
            }
        };
        let header = Header::parse(&opened.payload);

        if !opened.crc_ok {
            // a damaged frame is still honoured if it reads as a pure request for us
            if let Ok(header) = header {
                let flags = self.codec.decode_control_byte(header.control);
                if flags.relay_origin && flags.is_my_request && header.id == self.id.request_address() {
                    debug!("[{}] bad CRC, answering the request anyway", self.core.name());
                    self.send_data().await?;
                }
            }
            return Ok(());
        }
        self.core.record_received_ok();

        let header = match header {
            Ok(header) => header,
            Err(e) => {
                warn!("[{}] dropping frame with unparseable header: {}", self.core.name(), e);
                return Ok(());
            }
        };
        let flags = self.codec.decode_control_byte(header.control);
        let payload = opened.payload.as_slice();

        if flags.relay_origin {
            if flags.network_coded {
                self.receive_coded(&header, payload);
            } else if self.id.receive_range().contains(&header.id) {
                if let Some(data) = self.plain_data(&header, payload, header.encoded_len()) {
                    self.deliver(header.id, data);
                }
            } else if header.id != self.id.request_address() {
                self.other_aim += 1;
            }
        } else {
            self.other_node += 1;
            if self.direct_link && self.id.receive_range().contains(&header.id) {
                if let Some(data) = self.plain_data(&header, payload, HEADER_LEN_NODE) {
                    self.deliver(header.id, data);
                    self.remember_direct(header.id);
                }
            }
        }

        if flags.is_my_request {
            self.send_data().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Station for Node {
    async fn start(&mut self) -> Result<Flow, StationError> {
        self.core.ensure_transceiver().await?;
        info!(
            "[{}] ready, burst size {}, network coding {}, direct link {}, radio {:?}",
            self.core.name(),
            self.burst_size,
            self.network_coding,
            self.direct_link,
            self.core.radio()
        );
        Ok(Flow::Continue)
    }

    async fn on_frame(&mut self, frame: &[u8]) -> Result<Flow, StationError> {
        if let Some(reason) = self.exit {
            return Ok(Flow::Stop(reason));
        }
        self.core.record_received();
        self.handle_frame(frame).await?;
        self.core.tick(0);
        Ok(Flow::Continue)
    }

    async fn on_timeout(&mut self) -> Result<Flow, StationError> {
        Ok(self.exit.map_or(Flow::Continue, Flow::Stop))
    }

    async fn shutdown(&mut self, reason: ExitReason) -> ExitReason {
        if let Some(first) = self.exit {
            return first;
        }
        self.exit = Some(reason);
        info!(
            "[{}] shutting down: {:?} ({} frames for the other node, {} heard directly)",
            self.core.name(),
            reason,
            self.other_aim,
            self.other_node
        );
        self.core.graceful_shutdown(0).await;
        reason
    }

    fn deadline(&self) -> Option<Instant> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::data::{ConstantSource, MemorySink};
    use crate::transceiver::RecordingTransceiver;
    use relaying_core::header::{LIB, QA};
    use relaying_core::{ChannelCode, ChannelCoder, RelayHeaderFields};
    use std::time::Duration;

    struct Fixture {
        node: Node,
        radio: Arc<RecordingTransceiver>,
        sink: MemorySink,
    }

    fn fixture(id: NodeId, mode: Mode, burst_size: usize, direct_link: bool) -> Fixture {
        let radio = Arc::new(RecordingTransceiver::new());
        let sink = MemorySink::new();
        let config = StationConfig {
            burst_size,
            direct_link,
            grace_period: Duration::ZERO,
            ..StationConfig::node(id, mode)
        };
        let node = Node::new(
            config,
            radio.clone(),
            Box::new(ConstantSource::new(id.to_string().as_bytes()[0])),
            Box::new(sink.clone()),
        )
        .unwrap();
        Fixture { node, radio, sink }
    }

    fn coder() -> ChannelCoder {
        ChannelCoder::new(ChannelCode::ReedSolomon)
    }

    fn relay_frame(fields: RelayHeaderFields, data: &[u8]) -> Vec<u8> {
        let mut packet = HeaderCodec::relay().encode_relay_header(&fields).unwrap();
        packet.extend_from_slice(data);
        coder().wrap(&packet).unwrap()
    }

    fn request(node: NodeId) -> Vec<u8> {
        relay_frame(RelayHeaderFields::request(node), &[])
    }

    fn sent_headers(radio: &RecordingTransceiver) -> Vec<Header> {
        radio
            .take()
            .iter()
            .map(|t| Header::parse(&coder().open(&t.frame).unwrap().payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_request_triggers_one_burst() {
        let mut f = fixture(NodeId::A, Mode::TwoWay, 3, false);
        f.node.on_frame(&request(NodeId::A)).await.unwrap();

        let headers = sent_headers(&f.radio);
        let ids: Vec<PacketId> = headers.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let libs: Vec<bool> = headers.iter().map(|h| h.control & LIB != 0).collect();
        assert_eq!(libs, vec![false, false, true]);
        assert!(headers.iter().all(|h| h.control & QA != 0 && h.length == 213));
        assert_eq!(f.node.core().counters().app_bytes_transmitted, 3 * 213);
    }

    #[tokio::test]
    async fn test_request_for_other_node_is_ignored() {
        let mut f = fixture(NodeId::A, Mode::TwoWay, 1, false);
        f.node.on_frame(&request(NodeId::B)).await.unwrap();
        assert!(f.radio.sent().is_empty());
        assert_eq!(f.node.other_aim(), 1);
    }

    #[tokio::test]
    async fn test_packet_ids_wrap_within_range() {
        let mut f = fixture(NodeId::B, Mode::TwoWay, 2, false);
        f.node.packet_id = u16::MAX;
        f.node.on_frame(&request(NodeId::B)).await.unwrap();

        let ids: Vec<PacketId> = sent_headers(&f.radio).iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![65535, 32769]);
        assert!(ids.iter().all(|id| NodeId::B.send_range().contains(id)));
    }

    #[tokio::test]
    async fn test_forwarded_data_reaches_sink() {
        let mut f = fixture(NodeId::B, Mode::TwoWay, 1, false);
        let fields = RelayHeaderFields::forward(NodeId::A, 7, 5).with_request(Some(NodeId::B));
        f.node.on_frame(&relay_frame(fields, b"hello")).await.unwrap();

        assert_eq!(f.sink.payloads(), vec![b"hello".to_vec()]);
        assert_eq!(f.node.core().counters().app_bytes_received, 5);
        assert_eq!(sent_headers(&f.radio).len(), 1);
    }

    #[tokio::test]
    async fn test_own_data_echoed_by_relay_is_counted_not_delivered() {
        let mut f = fixture(NodeId::A, Mode::TwoWay, 1, false);
        let fields = RelayHeaderFields::forward(NodeId::A, 7, 3);
        f.node.on_frame(&relay_frame(fields, b"abc")).await.unwrap();
        assert!(f.sink.payloads().is_empty());
        assert_eq!(f.node.other_aim(), 1);
    }

    #[tokio::test]
    async fn test_decodes_network_coded_frame() {
        let mut f = fixture(NodeId::B, Mode::NetworkCoded, 1, false);
        f.node.on_frame(&request(NodeId::B)).await.unwrap();
        let own_id = sent_headers(&f.radio)[0].id;
        assert_eq!(own_id, 32769);
        let own_data = vec![b'B'; 213];

        let data_a = b"payload from node A".to_vec();
        let combined = network_coding::combine(&unit(&data_a), &unit(&own_data)).unwrap();
        let fields = RelayHeaderFields::coded(1, own_id, combined[0]);
        f.node.on_frame(&relay_frame(fields, &combined[1..])).await.unwrap();

        assert_eq!(f.sink.payloads(), vec![data_a]);
        assert!(f.node.last_packets.is_empty());
    }

    #[tokio::test]
    async fn test_coded_frame_without_retained_packet_is_dropped() {
        let mut f = fixture(NodeId::A, Mode::NetworkCoded, 1, false);
        let combined = network_coding::combine(&unit(b"x"), &unit(b"y")).unwrap();
        let fields = RelayHeaderFields::coded(42, 32800, combined[0]);
        f.node.on_frame(&relay_frame(fields, &combined[1..])).await.unwrap();
        assert!(f.sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_damaged_request_is_still_answered() {
        let mut f = fixture(NodeId::A, Mode::TwoWay, 1, false);
        // no FEC and a flipped CRC byte: the header survives, the CRC does not
        let config = StationConfig {
            channel_code: ChannelCode::None,
            grace_period: Duration::ZERO,
            ..StationConfig::node(NodeId::A, Mode::TwoWay)
        };
        f.node = Node::new(config, f.radio.clone(), Box::new(ConstantSource::default()), Box::new(f.sink.clone()))
            .unwrap();

        let uncoded = ChannelCoder::new(ChannelCode::None);
        let header = HeaderCodec::relay().encode_relay_header(&RelayHeaderFields::request(NodeId::A)).unwrap();
        let mut frame = uncoded.wrap(&header).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        f.node.on_frame(&frame).await.unwrap();
        assert_eq!(f.radio.sent().len(), 1);
        assert_eq!(f.node.core().counters().frames_received_ok, 0);

        // a damaged forwarded data frame is not answered
        let fields = RelayHeaderFields::forward(NodeId::B, 32769, 2).with_request(Some(NodeId::A));
        let mut packet = HeaderCodec::relay().encode_relay_header(&fields).unwrap();
        packet.extend_from_slice(b"hi");
        let mut frame = uncoded.wrap(&packet).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        f.node.on_frame(&frame).await.unwrap();
        assert_eq!(f.radio.sent().len(), 1);
        assert!(f.sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_direct_link_deduplicates_relayed_copy() {
        let mut f = fixture(NodeId::B, Mode::TwoWay, 1, true);

        let header = HeaderCodec::node(NodeId::A).encode_node_header(5, 3, true).unwrap();
        let mut packet = header.to_vec();
        packet.extend_from_slice(b"abc");
        f.node.on_frame(&coder().wrap(&packet).unwrap()).await.unwrap();
        assert_eq!(f.node.other_node(), 1);

        let fields = RelayHeaderFields::forward(NodeId::A, 5, 3);
        f.node.on_frame(&relay_frame(fields, b"abc")).await.unwrap();
        assert_eq!(f.sink.payloads(), vec![b"abc".to_vec()]);
        assert!(f.radio.sent().is_empty());
    }

    #[tokio::test]
    async fn test_direct_frames_ignored_without_direct_link() {
        let mut f = fixture(NodeId::B, Mode::TwoWay, 1, false);
        let header = HeaderCodec::node(NodeId::A).encode_node_header(5, 3, true).unwrap();
        let mut packet = header.to_vec();
        packet.extend_from_slice(b"abc");
        f.node.on_frame(&coder().wrap(&packet).unwrap()).await.unwrap();
        assert_eq!(f.node.other_node(), 1);
        assert!(f.sink.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut f = fixture(NodeId::A, Mode::TwoWay, 1, false);
        assert_eq!(f.node.shutdown(ExitReason::Terminated).await, ExitReason::Terminated);
        assert_eq!(f.node.shutdown(ExitReason::LinkFailure).await, ExitReason::Terminated);
        assert!(f.radio.is_stopped());
        assert_eq!(
            f.node.on_frame(&request(NodeId::A)).await.unwrap(),
            Flow::Stop(ExitReason::Terminated)
        );
    }

    struct OversizedSource;

    impl DataSource for OversizedSource {
        fn read(&mut self, max: usize) -> std::io::Result<Vec<u8>> {
            Ok(vec![0x5a; max + 100])
        }
    }

    #[tokio::test]
    async fn test_oversized_source_read_is_truncated() {
        let radio = Arc::new(RecordingTransceiver::new());
        let config = StationConfig { grace_period: Duration::ZERO, ..StationConfig::node(NodeId::B, Mode::TwoWay) };
        let mut node =
            Node::new(config, radio.clone(), Box::new(OversizedSource), Box::new(MemorySink::new())).unwrap();

        node.on_frame(&request(NodeId::B)).await.unwrap();

        let headers = sent_headers(&radio);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].length, 213);
        assert_eq!(node.core().counters().app_bytes_transmitted, 213);
    }

    #[test]
    fn test_rejects_relay_config() {
        let radio = Arc::new(RecordingTransceiver::new());
        let result = Node::new(
            StationConfig::relay(Mode::TwoWay),
            radio,
            Box::new(ConstantSource::default()),
            Box::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(StationError::Config(ConfigError::WrongRole { expected: "node", .. }))));
    }
}
