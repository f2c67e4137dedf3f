use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use netsim_model::addr::is_network_address;
use netsim_model::config::LIMITED_BROADCAST_IP;
use netsim_model::packet::{ArpOp, DhcpMessage, DnsPayload, Packet, PacketKind};
use netsim_model::{ConfigError, LinkId, MacAddr};

use crate::engine::Ctx;
use crate::trace::TraceEvent;

/// Authoritative A-record server. Known domains get a unicast response;
/// unknown ones are silently dropped.
pub struct DnsServer {
    name: String,
    ip: Ipv4Net,
    mac: MacAddr,
    links: Vec<LinkId>,
    records: HashMap<String, Ipv4Addr>,
}

impl DnsServer {
    pub fn new(name: String, ip: Ipv4Net, mac: MacAddr) -> Self {
        DnsServer {
            name,
            ip,
            mac,
            links: Vec::new(),
            records: HashMap::new(),
        }
    }

    pub fn ip(&self) -> Ipv4Net {
        self.ip
    }

    pub fn attach(&mut self, link: LinkId) {
        self.links.push(link);
    }

    pub fn add_record(&mut self, domain: &str, ip: Ipv4Addr) {
        self.records.insert(domain.to_string(), ip);
    }

    pub(crate) fn receive(&mut self, ctx: &mut Ctx<'_>, packet: Packet, _ingress: LinkId) {
        if packet.lost {
            ctx.log(&packet, TraceEvent::Lost);
            return;
        }
        let destination = packet.l2.destination_mac;
        if !destination.is_broadcast() && destination != self.mac {
            return;
        }
        match &packet.kind {
            PacketKind::Arp(arp) => {
                if arp.op == ArpOp::Request && arp.target_ip == self.ip.addr() {
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
            PacketKind::Dns(query) => {
                if packet.l3.destination_ip != self.ip.addr() {
                    ctx.log(&packet, TraceEvent::Dropped);
                    return;
                }
                ctx.log(&packet, TraceEvent::Arrived);
                ctx.log(&packet, TraceEvent::DnsQueryReceived);
                match self.records.get(&query.query_domain).copied() {
                    Some(resolved) => {
                        let response = Packet::dns(
                            ctx.next_packet_id(),
                            ctx.now,
                            self.mac,
                            packet.l2.source_mac,
                            self.ip.addr(),
                            packet.l3.source_ip,
                            DnsPayload {
                                query_domain: query.query_domain.clone(),
                                query_type: query.query_type,
                                resolved_ip: Some(resolved),
                            },
                        );
                        ctx.log(&response, TraceEvent::DnsResponseSent);
                        self.emit(ctx, response);
                    }
                    None => {
                        debug!(server = %self.name, domain = %query.query_domain,
                               "no record for queried domain, query dropped");
                    }
                }
            }
            _ => {}
        }
    }

    fn emit(&mut self, ctx: &mut Ctx<'_>, packet: Packet) {
        for &link in &self.links {
            ctx.transmit(link, packet.clone());
        }
    }
}

/// Leases addresses from an ordered pool (the host addresses of the pool
/// network, minus the server's own). DISCOVER pops the next address into an
/// OFFER; REQUEST is confirmed with an ACK carrying the optional DNS
/// server option. No lease timers.
pub struct DhcpServer {
    name: String,
    ip: Ipv4Net,
    mac: MacAddr,
    links: Vec<LinkId>,
    pool: VecDeque<Ipv4Net>,
    dns_server: Option<Ipv4Addr>,
    leases: HashMap<MacAddr, Ipv4Net>,
}

impl DhcpServer {
    pub fn new(
        name: String,
        ip: Ipv4Net,
        mac: MacAddr,
        pool_net: Ipv4Net,
        dns_server: Option<Ipv4Addr>,
    ) -> Result<Self, ConfigError> {
        if !is_network_address(pool_net) {
            return Err(ConfigError::PoolNotNetworkAddress(pool_net));
        }
        let prefix = pool_net.prefix_len();
        let pool = pool_net
            .hosts()
            .filter(|&addr| addr != ip.addr())
            .map(|addr| Ipv4Net::new(addr, prefix).expect("prefix length comes from a valid net"))
            .collect();
        Ok(DhcpServer {
            name,
            ip,
            mac,
            links: Vec::new(),
            pool,
            dns_server,
            leases: HashMap::new(),
        })
    }

    pub fn ip(&self) -> Ipv4Net {
        self.ip
    }

    pub fn attach(&mut self, link: LinkId) {
        self.links.push(link);
    }

    pub(crate) fn receive(&mut self, ctx: &mut Ctx<'_>, packet: Packet, _ingress: LinkId) {
        if packet.lost {
            ctx.log(&packet, TraceEvent::Lost);
            return;
        }
        let destination = packet.l2.destination_mac;
        if !destination.is_broadcast() && destination != self.mac {
            return;
        }
        match &packet.kind {
            PacketKind::Arp(arp) => {
                if arp.op == ArpOp::Request && arp.target_ip == self.ip.addr() {
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
            PacketKind::Dhcp(message) => {
                if !destination.is_broadcast() || packet.l3.destination_ip != LIMITED_BROADCAST_IP
                {
                    return;
                }
                match message {
                    DhcpMessage::Discover => self.on_discover(ctx, &packet),
                    DhcpMessage::Request { requested_ip } => {
                        let requested = *requested_ip;
                        self.on_request(ctx, &packet, requested);
                    }
                    DhcpMessage::Offer { .. } | DhcpMessage::Ack { .. } => {}
                }
            }
            _ => {}
        }
    }

    fn on_discover(&mut self, ctx: &mut Ctx<'_>, discover: &Packet) {
        let Some(offered_ip) = self.pool.pop_front() else {
            warn!(server = %self.name, "DHCP pool exhausted, DISCOVER ignored");
            return;
        };
        let offer = Packet::dhcp(
            ctx.next_packet_id(),
            ctx.now,
            self.mac,
            discover.l2.source_mac,
            self.ip.addr(),
            offered_ip.addr(),
            DhcpMessage::Offer { offered_ip },
        );
        ctx.log(&offer, TraceEvent::DhcpOfferSent);
        self.emit(ctx, offer);
    }

    fn on_request(&mut self, ctx: &mut Ctx<'_>, request: &Packet, requested_ip: Ipv4Net) {
        let client = request.l2.source_mac;
        self.leases.insert(client, requested_ip);
        info!(server = %self.name, %client, ip = %requested_ip, "DHCP lease confirmed");
        let ack = Packet::dhcp(
            ctx.next_packet_id(),
            ctx.now,
            self.mac,
            client,
            self.ip.addr(),
            requested_ip.addr(),
            DhcpMessage::Ack {
                assigned_ip: requested_ip,
                dns_server_ip: self.dns_server,
            },
        );
        ctx.log(&ack, TraceEvent::DhcpAckSent);
        self.emit(ctx, ack);
    }

    fn emit(&mut self, ctx: &mut Ctx<'_>, packet: Packet) {
        for &link in &self.links {
            ctx.transmit(link, packet.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_must_be_a_network_address() {
        let err = DhcpServer::new(
            "d1".into(),
            "192.168.1.1/24".parse().unwrap(),
            MacAddr::ZERO,
            "192.168.1.1/24".parse().unwrap(),
            None,
        );
        assert!(matches!(err, Err(ConfigError::PoolNotNetworkAddress(_))));
    }

    #[test]
    fn pool_skips_the_server_address() {
        let server = DhcpServer::new(
            "d1".into(),
            "192.168.1.1/24".parse().unwrap(),
            MacAddr::ZERO,
            "192.168.1.0/24".parse().unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(server.pool.len(), 253);
        assert_eq!(
            server.pool.front().map(|n| n.addr()),
            Some("192.168.1.2".parse().unwrap())
        );
    }
}
