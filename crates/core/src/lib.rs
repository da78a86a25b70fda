//! Wire-level primitives for the three-station relaying protocol: packet
//! headers, XOR network coding and the channel-coding frame layer.

pub mod channel;
pub mod header;
pub mod network_coding;
pub mod types;

pub use channel::{ChannelCode, ChannelCoder, ChannelError, FrameKind, Opened};
pub use header::{ControlFlags, Header, HeaderCodec, HeaderError, RelayHeaderFields};
pub use network_coding::CodingError;
pub use types::{NodeId, PacketId};
