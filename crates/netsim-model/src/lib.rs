pub mod addr;
pub mod config;
pub mod error;
pub mod ids;
pub mod packet;
pub mod scenario;

pub use addr::MacAddr;
pub use error::ConfigError;
pub use ids::{LinkId, NodeId};
pub use packet::{Packet, PacketKind, TransportHeader, TransportKind};
// Re-export flags module from packet so users can access TCP flag constants
pub use packet::tcp_flags;

pub use scenario::Scenario;
