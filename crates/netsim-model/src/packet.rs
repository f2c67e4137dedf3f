use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::addr::MacAddr;
use crate::config::{
    ARP_PACKET_SIZE, BPDU_PACKET_SIZE, CONTROL_TTL, DATA_TTL, DHCP_HEADER_SIZE, DHCP_TTL,
    DNS_HEADER_SIZE, HELLO_HEADER_SIZE, HELLO_PAYLOAD_SIZE, LIMITED_BROADCAST_IP, LSA_HEADER_SIZE,
    LSA_PAYLOAD_SIZE, OSPF_MULTICAST, TCP_HEADER_SIZE, UDP_HEADER_SIZE, UNSPECIFIED_IP,
};
use crate::ids::LinkId;

/// TCP header flags.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2Header {
    pub source_mac: MacAddr,
    pub destination_mac: MacAddr,
}

/// Fragmentation marks carried in the network header. `original_data_id`
/// groups the fragments of one datagram; it is set on every data packet
/// that carries payload so reassembly can tell singletons from tails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentFlags {
    pub more_fragments: bool,
    pub original_data_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Header {
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub ttl: u8,
    pub fragment: FragmentFlags,
    pub fragment_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

/// Transport header of a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Tcp {
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
    },
}

impl TransportHeader {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportHeader::Udp { .. } => TransportKind::Udp,
            TransportHeader::Tcp { .. } => TransportKind::Tcp,
        }
    }

    pub fn header_size(&self) -> usize {
        match self {
            TransportHeader::Udp { .. } => UDP_HEADER_SIZE,
            TransportHeader::Tcp { .. } => TCP_HEADER_SIZE,
        }
    }

    pub fn src_port(&self) -> u16 {
        match self {
            TransportHeader::Udp { src_port, .. } | TransportHeader::Tcp { src_port, .. } => {
                *src_port
            }
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self {
            TransportHeader::Udp { dst_port, .. } | TransportHeader::Tcp { dst_port, .. } => {
                *dst_port
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataPayload {
    pub transport: TransportHeader,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

#[derive(Debug, Clone, Copy)]
pub struct ArpPayload {
    pub op: ArpOp,
    /// Address pair the responder claims (for replies) or announces (for
    /// requests). A reply's `sender_ip` is always the IP that was queried.
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy)]
pub enum DhcpMessage {
    Discover,
    Offer {
        offered_ip: Ipv4Net,
    },
    Request {
        requested_ip: Ipv4Net,
    },
    Ack {
        assigned_ip: Ipv4Net,
        dns_server_ip: Option<Ipv4Addr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsQueryType {
    A,
}

#[derive(Debug, Clone)]
pub struct DnsPayload {
    pub query_domain: String,
    pub query_type: DnsQueryType,
    /// Present on responses only.
    pub resolved_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone)]
pub struct BpduPayload {
    pub root_id: String,
    pub bridge_id: String,
    pub path_cost: f64,
}

#[derive(Debug, Clone)]
pub struct HelloPayload {
    pub router_id: String,
    pub network: Ipv4Net,
    pub hello_interval: f64,
    pub neighbors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkActivity {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkStateEntry {
    pub network: Ipv4Net,
    pub cost: f64,
    pub state: LinkActivity,
}

#[derive(Debug, Clone)]
pub struct LsaPayload {
    pub router_id: String,
    pub sequence_number: u64,
    pub link_state_info: BTreeMap<LinkId, LinkStateEntry>,
}

/// The tagged packet sum. Each arm carries only the fields its protocol
/// needs; the shared L2/L3 headers live on [`Packet`] itself.
#[derive(Debug, Clone)]
pub enum PacketKind {
    Data(DataPayload),
    Arp(ArpPayload),
    Dhcp(DhcpMessage),
    Dns(DnsPayload),
    Bpdu(BpduPayload),
    Hello(HelloPayload),
    Lsa(LsaPayload),
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub l2: L2Header,
    pub l3: L3Header,
    pub kind: PacketKind,
    /// Header + payload bytes as counted against link bandwidth.
    pub size: usize,
    pub creation_time: f64,
    /// Set by the link when the loss trial fails; the packet is still
    /// delivered so the receiver can log the loss.
    pub lost: bool,
}

impl Packet {
    pub fn type_label(&self) -> &'static str {
        match &self.kind {
            PacketKind::Data(d) => match d.transport.kind() {
                TransportKind::Udp => "udp",
                TransportKind::Tcp => "tcp",
            },
            PacketKind::Arp(_) => "arp",
            PacketKind::Dhcp(_) => "dhcp",
            PacketKind::Dns(_) => "dns",
            PacketKind::Bpdu(_) => "bpdu",
            PacketKind::Hello(_) => "hello",
            PacketKind::Lsa(_) => "lsa",
        }
    }

    pub fn payload_len(&self) -> usize {
        match &self.kind {
            PacketKind::Data(d) => d.payload.len(),
            _ => 0,
        }
    }

    /// A data fragment (or unfragmented datagram).
    #[allow(clippy::too_many_arguments)]
    pub fn data(
        id: u64,
        now: f64,
        source_mac: MacAddr,
        destination_mac: MacAddr,
        source_ip: Ipv4Addr,
        destination_ip: Ipv4Addr,
        fragment: FragmentFlags,
        fragment_offset: usize,
        transport: TransportHeader,
        payload: Vec<u8>,
    ) -> Self {
        let size = transport.header_size() + crate::config::IP_HEADER_SIZE + payload.len();
        Packet {
            id,
            l2: L2Header { source_mac, destination_mac },
            l3: L3Header {
                source_ip,
                destination_ip,
                ttl: DATA_TTL,
                fragment,
                fragment_offset,
            },
            kind: PacketKind::Data(DataPayload { transport, payload }),
            size,
            creation_time: now,
            lost: false,
        }
    }

    pub fn arp(
        id: u64,
        now: f64,
        source_mac: MacAddr,
        destination_mac: MacAddr,
        source_ip: Ipv4Addr,
        destination_ip: Ipv4Addr,
        op: ArpOp,
    ) -> Self {
        Packet {
            id,
            l2: L2Header { source_mac, destination_mac },
            l3: L3Header {
                source_ip,
                destination_ip,
                ttl: CONTROL_TTL,
                fragment: FragmentFlags::default(),
                fragment_offset: 0,
            },
            kind: PacketKind::Arp(ArpPayload {
                op,
                sender_mac: source_mac,
                sender_ip: source_ip,
                target_ip: destination_ip,
            }),
            size: ARP_PACKET_SIZE,
            creation_time: now,
            lost: false,
        }
    }

    /// DHCP client messages go to the limited broadcast address; server
    /// messages are unicast back to the client MAC.
    pub fn dhcp(
        id: u64,
        now: f64,
        source_mac: MacAddr,
        destination_mac: MacAddr,
        source_ip: Ipv4Addr,
        destination_ip: Ipv4Addr,
        message: DhcpMessage,
    ) -> Self {
        Packet {
            id,
            l2: L2Header { source_mac, destination_mac },
            l3: L3Header {
                source_ip,
                destination_ip,
                ttl: DHCP_TTL,
                fragment: FragmentFlags::default(),
                fragment_offset: 0,
            },
            kind: PacketKind::Dhcp(message),
            size: DHCP_HEADER_SIZE,
            creation_time: now,
            lost: false,
        }
    }

    pub fn dhcp_client_broadcast(
        id: u64,
        now: f64,
        source_mac: MacAddr,
        message: DhcpMessage,
    ) -> Self {
        Self::dhcp(
            id,
            now,
            source_mac,
            MacAddr::BROADCAST,
            UNSPECIFIED_IP,
            LIMITED_BROADCAST_IP,
            message,
        )
    }

    pub fn dns(
        id: u64,
        now: f64,
        source_mac: MacAddr,
        destination_mac: MacAddr,
        source_ip: Ipv4Addr,
        destination_ip: Ipv4Addr,
        payload: DnsPayload,
    ) -> Self {
        let size = DNS_HEADER_SIZE + payload.query_domain.len() + 4;
        Packet {
            id,
            l2: L2Header { source_mac, destination_mac },
            l3: L3Header {
                source_ip,
                destination_ip,
                ttl: DATA_TTL,
                fragment: FragmentFlags::default(),
                fragment_offset: 0,
            },
            kind: PacketKind::Dns(payload),
            size,
            creation_time: now,
            lost: false,
        }
    }

    pub fn bpdu(id: u64, now: f64, payload: BpduPayload) -> Self {
        Packet {
            id,
            l2: L2Header {
                source_mac: MacAddr::ZERO,
                destination_mac: MacAddr::BROADCAST,
            },
            l3: L3Header {
                source_ip: UNSPECIFIED_IP,
                destination_ip: UNSPECIFIED_IP,
                ttl: CONTROL_TTL,
                fragment: FragmentFlags::default(),
                fragment_offset: 0,
            },
            kind: PacketKind::Bpdu(payload),
            size: BPDU_PACKET_SIZE,
            creation_time: now,
            lost: false,
        }
    }

    pub fn hello(id: u64, now: f64, source_mac: MacAddr, source_ip: Ipv4Addr, payload: HelloPayload) -> Self {
        Packet {
            id,
            l2: L2Header {
                source_mac,
                destination_mac: MacAddr::BROADCAST,
            },
            l3: L3Header {
                source_ip,
                destination_ip: OSPF_MULTICAST,
                ttl: CONTROL_TTL,
                fragment: FragmentFlags::default(),
                fragment_offset: 0,
            },
            kind: PacketKind::Hello(payload),
            size: HELLO_HEADER_SIZE + HELLO_PAYLOAD_SIZE,
            creation_time: now,
            lost: false,
        }
    }

    pub fn lsa(id: u64, now: f64, source_mac: MacAddr, source_ip: Ipv4Addr, payload: LsaPayload) -> Self {
        Packet {
            id,
            l2: L2Header {
                source_mac,
                destination_mac: MacAddr::BROADCAST,
            },
            l3: L3Header {
                source_ip,
                destination_ip: OSPF_MULTICAST,
                ttl: CONTROL_TTL,
                fragment: FragmentFlags::default(),
                fragment_offset: 0,
            },
            kind: PacketKind::Lsa(payload),
            size: LSA_HEADER_SIZE + LSA_PAYLOAD_SIZE,
            creation_time: now,
            lost: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_size_counts_headers_and_payload() {
        let p = Packet::data(
            1,
            0.0,
            MacAddr::ZERO,
            MacAddr::BROADCAST,
            UNSPECIFIED_IP,
            LIMITED_BROADCAST_IP,
            FragmentFlags::default(),
            0,
            TransportHeader::Udp { src_port: 1000, dst_port: 2000 },
            vec![0u8; 100],
        );
        assert_eq!(p.size, 8 + 20 + 100);
        assert_eq!(p.type_label(), "udp");
    }

    #[test]
    fn control_packets_have_positive_size() {
        let arp = Packet::arp(
            1,
            0.0,
            MacAddr::ZERO,
            MacAddr::BROADCAST,
            UNSPECIFIED_IP,
            UNSPECIFIED_IP,
            ArpOp::Request,
        );
        assert!(arp.size >= 1);
        let dns = Packet::dns(
            2,
            0.0,
            MacAddr::ZERO,
            MacAddr::BROADCAST,
            UNSPECIFIED_IP,
            UNSPECIFIED_IP,
            DnsPayload {
                query_domain: "example.com".into(),
                query_type: DnsQueryType::A,
                resolved_ip: None,
            },
        );
        assert!(dns.size >= 1);
    }

    #[test]
    fn tcp_flag_tests() {
        let hdr = TransportHeader::Tcp {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            flags: tcp_flags::SYN | tcp_flags::ACK,
        };
        assert_eq!(hdr.header_size(), 20);
        match hdr {
            TransportHeader::Tcp { flags, .. } => {
                assert_ne!(flags & tcp_flags::SYN, 0);
                assert_ne!(flags & tcp_flags::ACK, 0);
                assert_eq!(flags & tcp_flags::FIN, 0);
            }
            _ => unreachable!(),
        }
    }
}
