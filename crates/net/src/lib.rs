pub mod buffer;
pub mod config;
pub mod datagram;
pub mod error;
pub mod listener;
mod loopback;
pub mod reactor;
pub mod resolve;
pub mod stats;
pub mod stream;
pub mod table;

pub use buffer::{BLOCK_SIZE, ByteQueue};
pub use config::NetConfig;
pub use datagram::{DatagramHandler, DatagramId, IPV6_DISCOVERY_GROUP, broadcast_addr};
pub use error::{NetError, Result};
pub use listener::AcceptHandler;
pub use reactor::Reactor;
pub use resolve::{resolve, resolve_node, resolve_passive, sockaddr_to_strings};
pub use stats::{NetworkStats, StreamInfo};
pub use stream::{StreamFlags, StreamHandler, StreamId, StreamState};
pub use table::{SlotId, SlotTable};
