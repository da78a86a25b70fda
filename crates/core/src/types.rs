use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

pub type PacketId = u16;

pub const HEADER_LEN_NODE: usize = 4;
pub const HEADER_LEN_RELAY: usize = 4;
pub const HEADER_LEN_RELAY_NC: usize = 6;

/// Identity of an end node. The 16-bit packet ID space is split between the
/// two nodes so the origin of any data packet follows from its ID alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    A,
    B,
}

impl NodeId {
    pub fn other(self) -> Self {
        match self {
            NodeId::A => NodeId::B,
            NodeId::B => NodeId::A,
        }
    }

    /// ID carried by a pure request addressed to this node.
    pub fn request_address(self) -> PacketId {
        match self {
            NodeId::A => 0,
            NodeId::B => 32768,
        }
    }

    /// IDs this node stamps on its own data packets.
    pub fn send_range(self) -> RangeInclusive<PacketId> {
        match self {
            NodeId::A => 1..=32767,
            NodeId::B => 32769..=65535,
        }
    }

    /// IDs of data packets destined for this node, i.e. the peer's send range.
    pub fn receive_range(self) -> RangeInclusive<PacketId> {
        self.other().send_range()
    }

    /// Owner of a data packet ID, `None` for the two request addresses.
    pub fn owner_of(id: PacketId) -> Option<NodeId> {
        if NodeId::A.send_range().contains(&id) {
            Some(NodeId::A)
        } else if NodeId::B.send_range().contains(&id) {
            Some(NodeId::B)
        } else {
            None
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::A => write!(f, "A"),
            NodeId::B => write!(f, "B"),
        }
    }
}
