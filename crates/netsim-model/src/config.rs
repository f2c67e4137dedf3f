use std::net::Ipv4Addr;

/// Default MTU for hosts.
pub const DEFAULT_MTU: usize = 1500;

/// Transport/network header sizes in bytes.
pub const UDP_HEADER_SIZE: usize = 8;
pub const TCP_HEADER_SIZE: usize = 20;
pub const IP_HEADER_SIZE: usize = 20;

/// Wire sizes of the control-packet types.
pub const ARP_PACKET_SIZE: usize = 56;
pub const DHCP_HEADER_SIZE: usize = 240;
pub const DNS_HEADER_SIZE: usize = 12;
pub const BPDU_PACKET_SIZE: usize = 70;
pub const HELLO_HEADER_SIZE: usize = 24;
pub const HELLO_PAYLOAD_SIZE: usize = 20;
pub const LSA_HEADER_SIZE: usize = 24;
pub const LSA_PAYLOAD_SIZE: usize = 100;

/// Initial TTL of data packets.
pub const DATA_TTL: u8 = 64;
/// Hello/LSA/ARP stay on their own segment.
pub const CONTROL_TTL: u8 = 1;
/// DHCP exchanges never cross a router either, but the source sets 255.
pub const DHCP_TTL: u8 = 255;

/// OSPF-style all-routers multicast group.
pub const OSPF_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 5);

/// Addressing used by a DHCP client before it holds a lease.
pub const UNSPECIFIED_IP: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);
pub const LIMITED_BROADCAST_IP: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Router control-plane intervals, seconds.
pub const DEFAULT_HELLO_INTERVAL: f64 = 10.0;
pub const DEFAULT_LSA_INTERVAL: f64 = 10.0;

/// A neighbor whose last hello is older than this many hello intervals is
/// considered dead and no longer vouches for its cached link.
pub const DEAD_INTERVAL_FACTOR: f64 = 4.0;

/// Floor for STP/OSPF link costs so zero-bandwidth links never divide away.
pub const MIN_LINK_COST: f64 = 1e-9;

/// TCP sender behavior: segments sent back-to-back once the handshake
/// completes, and the duplicate-ACK count that triggers a fast retransmit.
pub const TCP_INITIAL_WINDOW: usize = 4;
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Ephemeral port range used by the traffic generators.
pub const EPHEMERAL_PORT_MIN: u16 = 1024;
pub const EPHEMERAL_PORT_MAX: u16 = 49151;
