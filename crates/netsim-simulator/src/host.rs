use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::Rng;
use tracing::{debug, info, warn};

use netsim_model::addr::is_network_address;
use netsim_model::config::{
    EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN, IP_HEADER_SIZE, TCP_HEADER_SIZE, UDP_HEADER_SIZE,
};
use netsim_model::packet::{
    ArpOp, DhcpMessage, DnsPayload, DnsQueryType, FragmentFlags, Packet, PacketKind,
    TransportHeader, TransportKind,
};
use netsim_model::{LinkId, MacAddr};

use crate::engine::Ctx;
use crate::scheduler::{TimerKind, TrafficSpec};
use crate::tcp::TcpConnection;
use crate::trace::TraceEvent;

/// A transport-level send, carrying everything needed to (re)issue it.
/// Requests to unresolved destinations park here until the ARP reply lands.
#[derive(Debug, Clone)]
pub(crate) struct SendRequest {
    pub dst_ip: Ipv4Addr,
    pub transport: TransportKind,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct UdpFlow {
    dst: Ipv4Addr,
    end_time: f64,
    interval: f64,
    payload_size: usize,
    src_port: u16,
    dst_port: u16,
}

/// An end host: ARP + DHCP + DNS client, IP fragmentation and reassembly,
/// UDP traffic generators and TCP endpoints (the TCP state machine lives in
/// `tcp.rs`).
pub struct Host {
    name: String,
    ip: Ipv4Net,
    pub(crate) mac: MacAddr,
    links: Vec<LinkId>,
    default_route: Option<LinkId>,
    mtu: usize,
    dns_server: Option<Ipv4Addr>,
    arp_table: HashMap<Ipv4Addr, MacAddr>,
    waiting_for_arp: HashMap<Ipv4Addr, Vec<SendRequest>>,
    dns_cache: HashMap<String, Ipv4Addr>,
    waiting_for_dns: HashMap<String, Vec<TrafficSpec>>,
    flows: Vec<UdpFlow>,
    pub(crate) connections: HashMap<(Ipv4Addr, u16), TcpConnection>,
    /// Fragment store: original data id -> offset -> bytes.
    fragments: HashMap<u64, BTreeMap<usize, Vec<u8>>>,
    /// Payloads handed up to the application layer (reassembled datagrams).
    pub(crate) delivered: Vec<Vec<u8>>,
}

impl Host {
    pub fn new(
        name: String,
        ip: Ipv4Net,
        mac: MacAddr,
        dns_server: Option<Ipv4Addr>,
        mtu: usize,
    ) -> Self {
        Host {
            name,
            ip,
            mac,
            links: Vec::new(),
            default_route: None,
            mtu,
            dns_server,
            arp_table: HashMap::new(),
            waiting_for_arp: HashMap::new(),
            dns_cache: HashMap::new(),
            waiting_for_dns: HashMap::new(),
            flows: Vec::new(),
            connections: HashMap::new(),
            fragments: HashMap::new(),
            delivered: Vec::new(),
        }
    }

    pub fn ip(&self) -> Ipv4Net {
        self.ip
    }

    /// A host declared with the network address of its subnet has no usable
    /// IP and must lease one over DHCP.
    pub fn needs_dhcp(&self) -> bool {
        is_network_address(self.ip)
    }

    pub fn attach(&mut self, link: LinkId) {
        self.links.push(link);
    }

    pub fn set_default_route(&mut self, link: LinkId) {
        self.default_route = Some(link);
    }

    pub fn add_dns_record(&mut self, domain: &str, ip: Ipv4Addr) {
        self.dns_cache.insert(domain.to_string(), ip);
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.connections.len()
    }

    // ----- receive pipeline ----------------------------------------------

    pub(crate) fn receive(&mut self, ctx: &mut Ctx<'_>, packet: Packet, _ingress: LinkId) {
        if packet.lost {
            ctx.log(&packet, TraceEvent::Lost);
            return;
        }
        let destination = packet.l2.destination_mac;
        if !destination.is_broadcast() && destination != self.mac {
            ctx.log(&packet, TraceEvent::Dropped);
            return;
        }

        if matches!(packet.kind, PacketKind::Data(_)) {
            self.handle_data(ctx, packet);
            return;
        }
        match &packet.kind {
            PacketKind::Arp(_) => self.handle_arp(ctx, &packet),
            PacketKind::Dhcp(message) => {
                let message = *message;
                self.handle_dhcp(ctx, &packet, message);
            }
            PacketKind::Dns(_) => self.handle_dns(ctx, &packet),
            _ => ctx.log(&packet, TraceEvent::Dropped),
        }
    }

    fn handle_arp(&mut self, ctx: &mut Ctx<'_>, packet: &Packet) {
        let PacketKind::Arp(arp) = &packet.kind else { return };
        let arp = *arp;
        match arp.op {
            ArpOp::Request => {
                if packet.l2.destination_mac.is_broadcast() {
                    ctx.log(packet, TraceEvent::Arrived);
                    if arp.target_ip == self.ip.addr() {
                        let reply = Packet::arp(
                            ctx.next_packet_id(),
                            ctx.now,
                            self.mac,
                            packet.l2.source_mac,
                            self.ip.addr(),
                            packet.l3.source_ip,
                            ArpOp::Reply,
                        );
                        ctx.log(&reply, TraceEvent::ArpReplySent);
                        self.emit(ctx, reply);
                    }
                }
            }
            ArpOp::Reply => {
                if packet.l2.destination_mac == self.mac && arp.target_ip == self.ip.addr() {
                    ctx.log(packet, TraceEvent::ArpReplyReceived);
                    self.arp_table.insert(arp.sender_ip, arp.sender_mac);
                    match self.waiting_for_arp.remove(&arp.sender_ip) {
                        Some(requests) => {
                            for request in requests {
                                self.send_transport(ctx, request);
                            }
                        }
                        None => {
                            debug!(host = %self.name, ip = %arp.sender_ip,
                                   "ARP reply for an address nothing was waiting on");
                        }
                    }
                }
            }
        }
    }

    fn handle_dhcp(&mut self, ctx: &mut Ctx<'_>, packet: &Packet, message: DhcpMessage) {
        if packet.l2.destination_mac != self.mac {
            return;
        }
        ctx.log(packet, TraceEvent::Arrived);
        match message {
            DhcpMessage::Offer { offered_ip } => {
                ctx.log(packet, TraceEvent::DhcpOfferReceived);
                let request = Packet::dhcp_client_broadcast(
                    ctx.next_packet_id(),
                    ctx.now,
                    self.mac,
                    DhcpMessage::Request {
                        requested_ip: offered_ip,
                    },
                );
                ctx.log(&request, TraceEvent::DhcpRequestSent);
                self.emit(ctx, request);
            }
            DhcpMessage::Ack {
                assigned_ip,
                dns_server_ip,
            } => {
                ctx.log(packet, TraceEvent::DhcpAckReceived);
                self.ip = assigned_ip;
                info!(host = %self.name, ip = %assigned_ip, "DHCP lease acquired");
                if let Some(dns) = dns_server_ip {
                    self.dns_server = Some(dns);
                    info!(host = %self.name, dns = %dns, "DNS server assigned via DHCP");
                }
            }
            // Client side never processes DISCOVER/REQUEST.
            DhcpMessage::Discover | DhcpMessage::Request { .. } => {}
        }
    }

    fn handle_dns(&mut self, ctx: &mut Ctx<'_>, packet: &Packet) {
        if packet.l2.destination_mac != self.mac {
            return;
        }
        let PacketKind::Dns(dns) = &packet.kind else { return };
        ctx.log(packet, TraceEvent::Arrived);
        ctx.log(packet, TraceEvent::DnsResponseReceived);
        if let Some(ip) = dns.resolved_ip {
            let domain = dns.query_domain.clone();
            self.dns_cache.insert(domain.clone(), ip);
            info!(host = %self.name, %domain, %ip, "DNS record resolved");
            if let Some(waiting) = self.waiting_for_dns.remove(&domain) {
                for spec in waiting {
                    self.set_traffic(ctx, ip, spec);
                }
            }
        }
    }

    fn handle_data(&mut self, ctx: &mut Ctx<'_>, packet: Packet) {
        let PacketKind::Data(data) = &packet.kind else { return };
        if packet.l3.destination_ip != self.ip.addr() {
            ctx.log(&packet, TraceEvent::Dropped);
            return;
        }
        ctx.log(&packet, TraceEvent::Arrived);
        match data.transport.kind() {
            TransportKind::Udp => self.process_datagram(ctx, &packet),
            TransportKind::Tcp => self.handle_tcp(ctx, &packet),
        }
    }

    // ----- fragmentation and reassembly ----------------------------------

    /// Store fragments as they come in; on the final fragment, verify the
    /// pieces cover the datagram and deliver it.
    pub(crate) fn process_datagram(&mut self, ctx: &mut Ctx<'_>, packet: &Packet) {
        let PacketKind::Data(data) = &packet.kind else { return };
        let fragment = packet.l3.fragment;
        let offset = packet.l3.fragment_offset;

        if fragment.more_fragments {
            let Some(data_id) = fragment.original_data_id else { return };
            self.fragments
                .entry(data_id)
                .or_default()
                .insert(offset, data.payload.clone());
            ctx.log(packet, TraceEvent::FragmentStored);
            return;
        }

        let Some(data_id) = fragment.original_data_id else {
            // Headerless control segment (empty TCP payloads and the like).
            return;
        };
        match self.fragments.remove(&data_id) {
            Some(mut parts) => {
                parts.insert(offset, data.payload.clone());
                let Some((&last_offset, last)) = parts.iter().next_back() else {
                    return;
                };
                let expected = last_offset + last.len();
                let total: usize = parts.values().map(Vec::len).sum();
                if total == expected {
                    ctx.log(packet, TraceEvent::Reassembled);
                    let mut assembled = Vec::with_capacity(total);
                    for part in parts.values() {
                        assembled.extend_from_slice(part);
                    }
                    self.delivered.push(assembled);
                } else {
                    ctx.log(packet, TraceEvent::ReassembleFailedIncompleteData);
                }
            }
            None if offset > 0 => {
                // The tail showed up with nothing stored before it.
                ctx.log(packet, TraceEvent::ReassembleFailedNoFragments);
            }
            None => {
                // Unfragmented datagram.
                self.delivered.push(data.payload.clone());
            }
        }
    }

    // ----- timers ---------------------------------------------------------

    pub(crate) fn timer(&mut self, ctx: &mut Ctx<'_>, timer: TimerKind) {
        match timer {
            TimerKind::DhcpDiscover => self.send_dhcp_discover(ctx),
            TimerKind::StartTraffic(spec) => self.attempt_start_traffic(ctx, spec),
            TimerKind::TrafficTick(flow) => self.traffic_tick(ctx, flow),
            _ => {}
        }
    }

    fn send_dhcp_discover(&mut self, ctx: &mut Ctx<'_>) {
        let discover = Packet::dhcp_client_broadcast(
            ctx.next_packet_id(),
            ctx.now,
            self.mac,
            DhcpMessage::Discover,
        );
        ctx.log(&discover, TraceEvent::DhcpDiscoverSent);
        self.emit(ctx, discover);
    }

    // ----- traffic generation --------------------------------------------

    fn attempt_start_traffic(&mut self, ctx: &mut Ctx<'_>, spec: TrafficSpec) {
        // IP-literal destinations skip the resolver entirely.
        if let Ok(ip) = spec.url.parse::<Ipv4Addr>() {
            self.set_traffic(ctx, ip, spec);
            return;
        }
        if let Some(&ip) = self.dns_cache.get(&spec.url) {
            self.set_traffic(ctx, ip, spec);
            return;
        }
        let Some(server) = self.dns_server else {
            warn!(host = %self.name, url = %spec.url,
                  "cannot resolve destination: no DNS server configured; traffic dropped");
            return;
        };
        self.waiting_for_dns
            .entry(spec.url.clone())
            .or_default()
            .push(spec.clone());
        let query = Packet::dns(
            ctx.next_packet_id(),
            ctx.now,
            self.mac,
            MacAddr::BROADCAST,
            self.ip.addr(),
            server,
            DnsPayload {
                query_domain: spec.url.clone(),
                query_type: DnsQueryType::A,
                resolved_ip: None,
            },
        );
        ctx.log(&query, TraceEvent::DnsQuerySent);
        self.emit(ctx, query);
    }

    fn set_traffic(&mut self, ctx: &mut Ctx<'_>, dst: Ipv4Addr, spec: TrafficSpec) {
        match spec.protocol {
            TransportKind::Udp => self.set_udp_flow(ctx, dst, spec),
            TransportKind::Tcp => self.open_tcp(ctx, dst, spec),
        }
    }

    fn set_udp_flow(&mut self, ctx: &mut Ctx<'_>, dst: Ipv4Addr, spec: TrafficSpec) {
        let flow = UdpFlow {
            dst,
            end_time: spec.end_time(),
            interval: spec.interval(),
            payload_size: spec.payload_size,
            src_port: self.random_port(ctx),
            dst_port: self.random_port(ctx),
        };
        let index = self.flows.len();
        self.flows.push(flow);
        ctx.schedule(0.0, TimerKind::TrafficTick(index));
    }

    fn traffic_tick(&mut self, ctx: &mut Ctx<'_>, index: usize) {
        let flow = &self.flows[index];
        if ctx.now >= flow.end_time {
            return;
        }
        let request = SendRequest {
            dst_ip: flow.dst,
            transport: TransportKind::Udp,
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            seq: 0,
            ack: 0,
            flags: 0,
            payload: vec![b'X'; flow.payload_size],
        };
        let interval = flow.interval;
        self.send_transport(ctx, request);
        ctx.schedule(interval, TimerKind::TrafficTick(index));
    }

    pub(crate) fn random_port(&self, ctx: &mut Ctx<'_>) -> u16 {
        ctx.rng.random_range(EPHEMERAL_PORT_MIN..=EPHEMERAL_PORT_MAX)
    }

    // ----- send path ------------------------------------------------------

    /// Send a transport request, resolving the destination MAC first. An
    /// unresolved destination parks the request and fires an ARP broadcast.
    pub(crate) fn send_transport(&mut self, ctx: &mut Ctx<'_>, request: SendRequest) {
        match self.arp_table.get(&request.dst_ip).copied() {
            Some(mac) => self.emit_transport(ctx, request, mac),
            None => {
                self.send_arp_request(ctx, request.dst_ip);
                self.waiting_for_arp
                    .entry(request.dst_ip)
                    .or_default()
                    .push(request);
            }
        }
    }

    fn send_arp_request(&mut self, ctx: &mut Ctx<'_>, target: Ipv4Addr) {
        let request = Packet::arp(
            ctx.next_packet_id(),
            ctx.now,
            self.mac,
            MacAddr::BROADCAST,
            self.ip.addr(),
            target,
            ArpOp::Request,
        );
        ctx.log(&request, TraceEvent::ArpRequestSent);
        self.emit(ctx, request);
    }

    /// Fragment the payload against the MTU and emit every piece.
    fn emit_transport(&mut self, ctx: &mut Ctx<'_>, request: SendRequest, dst_mac: MacAddr) {
        let header_size = match request.transport {
            TransportKind::Udp => UDP_HEADER_SIZE,
            TransportKind::Tcp => TCP_HEADER_SIZE,
        } + IP_HEADER_SIZE;

        if request.payload.is_empty() {
            let packet = Packet::data(
                ctx.next_packet_id(),
                ctx.now,
                self.mac,
                dst_mac,
                self.ip.addr(),
                request.dst_ip,
                FragmentFlags::default(),
                0,
                self.transport_header(&request),
                Vec::new(),
            );
            self.emit(ctx, packet);
            return;
        }

        let per_fragment = self.mtu.saturating_sub(header_size).max(1);
        let total = request.payload.len();
        let data_id = ctx.next_data_id();
        let mut offset = 0;
        while offset < total {
            let len = per_fragment.min(total - offset);
            let more = offset + len < total;
            let packet = Packet::data(
                ctx.next_packet_id(),
                ctx.now,
                self.mac,
                dst_mac,
                self.ip.addr(),
                request.dst_ip,
                FragmentFlags {
                    more_fragments: more,
                    original_data_id: Some(data_id),
                },
                offset,
                self.transport_header(&request),
                request.payload[offset..offset + len].to_vec(),
            );
            self.emit(ctx, packet);
            offset += len;
        }
    }

    fn transport_header(&self, request: &SendRequest) -> TransportHeader {
        match request.transport {
            TransportKind::Udp => TransportHeader::Udp {
                src_port: request.src_port,
                dst_port: request.dst_port,
            },
            TransportKind::Tcp => TransportHeader::Tcp {
                src_port: request.src_port,
                dst_port: request.dst_port,
                seq: request.seq,
                ack: request.ack,
                flags: request.flags,
            },
        }
    }

    /// Frames leave over the default route when one is set, otherwise over
    /// every attached link.
    pub(crate) fn emit(&mut self, ctx: &mut Ctx<'_>, packet: Packet) {
        match self.default_route {
            Some(link) => ctx.transmit(link, packet),
            None => {
                for &link in &self.links {
                    ctx.transmit(link, packet.clone());
                }
            }
        }
    }
}
