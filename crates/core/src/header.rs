//! Relay and node packet headers
//!
//! ```text
//! node        [ctrl][id hi][id lo][len]
//! relay       [ctrl][id hi][id lo][len]
//! relay + NC  [ctrl][idA hi][idA lo][idB hi][idB lo][lenA ^ lenB]
//! ```

use bytes::BufMut;
use thiserror::Error;

use crate::types::{NodeId, PacketId, HEADER_LEN_NODE, HEADER_LEN_RELAY, HEADER_LEN_RELAY_NC};

pub const RQA: u8 = 0x01;
pub const RQB: u8 = 0x02;
pub const R_BIT: u8 = 0x04;
pub const QA: u8 = 0x08;
pub const QB: u8 = 0x10;
pub const NC: u8 = 0x20;
pub const LIB: u8 = 0x40;
pub const RESERVED: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("only a single request is allowed per relay header")]
    ConflictingRequests,

    #[error("network coding requires a packet ID from each node")]
    MissingPacketIds,

    #[error("forwarded data packet has no source")]
    MissingSource,

    #[error("node headers need a codec built for a node identity")]
    NoIdentity,

    #[error("header truncated: need {required} bytes, got {actual}")]
    Truncated { required: usize, actual: usize },
}

/// Bits of a control byte as seen by one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlags {
    pub relay_origin: bool,
    pub network_coded: bool,
    pub is_my_request: bool,
    pub last_in_burst: bool,
    pub source_is_a: bool,
    pub source_is_b: bool,
}

impl ControlFlags {
    /// The single source named by the flags; `None` when neither or both bits are set.
    pub fn single_source(&self) -> Option<NodeId> {
        match (self.source_is_a, self.source_is_b) {
            (true, false) => Some(NodeId::A),
            (false, true) => Some(NodeId::B),
            _ => None,
        }
    }
}

/// Inputs for a relay-originated header.
///
/// For a plain forwarded packet the ID of the forwarded packet goes in the
/// slot of its source (`id_a` for data from A, `id_b` for data from B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayHeaderFields {
    pub length: u8,
    pub request_to_a: bool,
    pub request_to_b: bool,
    pub id_a: Option<PacketId>,
    pub id_b: Option<PacketId>,
    pub network_coded: bool,
    pub source: Option<NodeId>,
}

impl RelayHeaderFields {
    pub fn request(node: NodeId) -> Self {
        Self {
            request_to_a: node == NodeId::A,
            request_to_b: node == NodeId::B,
            ..Default::default()
        }
    }

    pub fn forward(source: NodeId, id: PacketId, length: u8) -> Self {
        let (id_a, id_b) = match source {
            NodeId::A => (Some(id), None),
            NodeId::B => (None, Some(id)),
        };
        Self {
            length,
            id_a,
            id_b,
            source: Some(source),
            ..Default::default()
        }
    }

    pub fn coded(id_a: PacketId, id_b: PacketId, length: u8) -> Self {
        Self {
            length,
            id_a: Some(id_a),
            id_b: Some(id_b),
            network_coded: true,
            ..Default::default()
        }
    }

    pub fn with_request(mut self, node: Option<NodeId>) -> Self {
        self.request_to_a = node == Some(NodeId::A);
        self.request_to_b = node == Some(NodeId::B);
        self
    }
}

/// A parsed header. `peer_id` is only present on network-coded relay headers,
/// in which case `id` belongs to A and `peer_id` to B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub control: u8,
    pub id: PacketId,
    pub peer_id: Option<PacketId>,
    pub length: u8,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {
        let Some(&control) = bytes.first() else {
            return Err(HeaderError::Truncated { required: HEADER_LEN_NODE, actual: 0 });
        };
        let coded = control & R_BIT != 0 && control & NC != 0;
        let required = if coded { HEADER_LEN_RELAY_NC } else { HEADER_LEN_RELAY };
        if bytes.len() < required {
            return Err(HeaderError::Truncated { required, actual: bytes.len() });
        }

        let id = u16::from_be_bytes([bytes[1], bytes[2]]);
        if coded {
            Ok(Self {
                control,
                id,
                peer_id: Some(u16::from_be_bytes([bytes[3], bytes[4]])),
                length: bytes[5],
            })
        } else {
            Ok(Self { control, id, peer_id: None, length: bytes[3] })
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.peer_id.is_some() {
            HEADER_LEN_RELAY_NC
        } else {
            HEADER_LEN_RELAY
        }
    }

    /// Packet ID belonging to `node` in a network-coded header.
    pub fn coded_id_of(&self, node: NodeId) -> Option<PacketId> {
        let peer = self.peer_id?;
        Some(match node {
            NodeId::A => self.id,
            NodeId::B => peer,
        })
    }
}

/// Header encoder/decoder for one station. A relay codec has no identity and
/// never sees its own request bit set.
#[derive(Debug, Clone, Copy)]
pub struct HeaderCodec {
    identity: Option<NodeId>,
    my_request: u8,
}

impl HeaderCodec {
    pub fn relay() -> Self {
        Self { identity: None, my_request: 0 }
    }

    pub fn node(id: NodeId) -> Self {
        let my_request = match id {
            NodeId::A => RQA,
            NodeId::B => RQB,
        };
        Self { identity: Some(id), my_request }
    }

    pub fn decode_control_byte(&self, byte: u8) -> ControlFlags {
        ControlFlags {
            relay_origin: byte & R_BIT != 0,
            network_coded: byte & NC != 0,
            is_my_request: byte & self.my_request != 0,
            last_in_burst: byte & LIB != 0,
            source_is_a: byte & QA != 0,
            source_is_b: byte & QB != 0,
        }
    }

    pub fn encode_relay_header(&self, fields: &RelayHeaderFields) -> Result<Vec<u8>, HeaderError> {
        if fields.request_to_a && fields.request_to_b {
            return Err(HeaderError::ConflictingRequests);
        }
        if fields.network_coded && (fields.id_a.is_none() || fields.id_b.is_none()) {
            return Err(HeaderError::MissingPacketIds);
        }

        let mut control = R_BIT;
        let mut address = 0;
        if fields.request_to_a {
            control |= RQA;
            address = NodeId::A.request_address();
        } else if fields.request_to_b {
            control |= RQB;
            address = NodeId::B.request_address();
        }

        let mut header = Vec::with_capacity(HEADER_LEN_RELAY_NC);
        match (fields.id_a, fields.id_b, fields.network_coded) {
            (None, None, _) => {
                header.put_u8(control);
                header.put_u16(address);
                header.put_u8(fields.length);
            }
            (Some(id_a), Some(id_b), true) => {
                header.put_u8(control | NC | QA | QB);
                header.put_u16(id_a);
                header.put_u16(id_b);
                header.put_u8(fields.length);
            }
            (id_a, id_b, false) => {
                let source = fields.source.ok_or(HeaderError::MissingSource)?;
                let (flag, id) = match source {
                    NodeId::A => (QA, id_a),
                    NodeId::B => (QB, id_b),
                };
                let id = id.ok_or(HeaderError::MissingPacketIds)?;
                header.put_u8(control | flag);
                header.put_u16(id);
                header.put_u8(fields.length);
            }
            _ => return Err(HeaderError::MissingPacketIds),
        }
        Ok(header)
    }

    pub fn encode_node_header(
        &self,
        id: PacketId,
        length: u8,
        last_in_burst: bool,
    ) -> Result<[u8; HEADER_LEN_NODE], HeaderError> {
        let mut control = match self.identity.ok_or(HeaderError::NoIdentity)? {
            NodeId::A => QA,
            NodeId::B => QB,
        };
        if last_in_burst {
            control |= LIB;
        }
        let [hi, lo] = id.to_be_bytes();
        Ok([control, hi, lo, length])
    }
}
