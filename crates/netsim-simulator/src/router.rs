use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::debug;

use netsim_model::addr::nets_overlap;
use netsim_model::config::{DEAD_INTERVAL_FACTOR, OSPF_MULTICAST};
use netsim_model::packet::{
    ArpOp, HelloPayload, LinkActivity, LinkStateEntry, LsaPayload, Packet, PacketKind,
};
use netsim_model::{LinkId, MacAddr, NodeId};

use crate::engine::Ctx;
use crate::scheduler::TimerKind;
use crate::trace::TraceEvent;

#[derive(Debug, Clone, Copy)]
pub struct Interface {
    pub ip: Ipv4Net,
    pub mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NextHop {
    Direct,
    Via(String),
}

#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub(crate) prefix: Ipv4Net,
    next_hop: NextHop,
    link: LinkId,
}

#[derive(Debug, Clone, Copy)]
struct Neighbor {
    last_hello: f64,
    link: LinkId,
}

impl Neighbor {
    /// Hellos arrive every `hello_interval`; a neighbor that has missed
    /// several in a row is treated as gone.
    fn is_alive(&self, now: f64, hello_interval: f64) -> bool {
        now - self.last_hello <= hello_interval * DEAD_INTERVAL_FACTOR
    }
}

#[derive(Debug, Clone)]
struct TopoEntry {
    /// `None` for the self entry, which is refreshed locally rather than
    /// learned from the flood.
    sequence: Option<u64>,
    links: BTreeMap<LinkId, LinkStateEntry>,
}

/// First containing prefix in a table kept sorted by descending prefix
/// length, i.e. the longest match.
fn longest_prefix_match(routes: &[Route], dst: Ipv4Addr) -> Option<&Route> {
    routes.iter().find(|r| r.prefix.contains(&dst))
}

/// Walk the SPF predecessor chain back from `dest` until the node whose
/// predecessor is `start`: that node is the first hop.
fn initial_hop(
    prev: &BTreeMap<String, Option<String>>,
    dest: &str,
    start: &str,
) -> Option<String> {
    let mut current = dest.to_string();
    loop {
        match prev.get(&current)? {
            Some(p) if p == start => return Some(current),
            Some(p) => current = p.clone(),
            None => return None,
        }
    }
}

/// An IP router: one ARP-speaking interface per attached link, an
/// OSPF-style control plane (hello + flooded LSAs + Dijkstra) and a
/// longest-prefix-match forwarding plane.
pub struct Router {
    node: NodeId,
    name: String,
    /// Declared interface addresses and whether each is bound to a link yet.
    available_ips: Vec<(Ipv4Net, bool)>,
    interfaces: BTreeMap<LinkId, Interface>,
    routes: Vec<Route>,
    /// ARP is per interface: the same destination can resolve to different
    /// next hops on different links, and a reroute must re-resolve.
    arp_table: HashMap<(LinkId, Ipv4Addr), MacAddr>,
    waiting_for_arp: HashMap<(LinkId, Ipv4Addr), Vec<Packet>>,
    default_route: Option<LinkId>,
    neighbors: BTreeMap<String, Neighbor>,
    hello_interval: f64,
    lsa_interval: f64,
    lsa_sequence: u64,
    topology: BTreeMap<String, TopoEntry>,
}

impl Router {
    pub fn new(
        node: NodeId,
        name: String,
        ips: Vec<Ipv4Net>,
        hello_interval: f64,
        lsa_interval: f64,
    ) -> Self {
        Router {
            node,
            name,
            available_ips: ips.into_iter().map(|ip| (ip, false)).collect(),
            interfaces: BTreeMap::new(),
            routes: Vec::new(),
            arp_table: HashMap::new(),
            waiting_for_arp: HashMap::new(),
            default_route: None,
            neighbors: BTreeMap::new(),
            hello_interval,
            lsa_interval,
            lsa_sequence: 0,
            topology: BTreeMap::new(),
        }
    }

    pub fn unassigned_ips(&self) -> Vec<Ipv4Net> {
        self.available_ips
            .iter()
            .filter(|(_, used)| !used)
            .map(|(ip, _)| *ip)
            .collect()
    }

    pub fn add_interface(&mut self, link: LinkId, ip: Ipv4Net, mac: MacAddr) {
        if let Some(slot) = self.available_ips.iter_mut().find(|(a, _)| *a == ip) {
            slot.1 = true;
        }
        self.interfaces.insert(link, Interface { ip, mac });
        self.insert_route(ip.trunc(), NextHop::Direct, link);
    }

    pub fn set_default_route(&mut self, link: LinkId) {
        self.default_route = Some(link);
    }

    pub fn route_summary(&self) -> Vec<(Ipv4Net, String)> {
        self.routes
            .iter()
            .map(|r| {
                let label = match &r.next_hop {
                    NextHop::Direct => "directly connected".to_string(),
                    NextHop::Via(hop) => hop.clone(),
                };
                (r.prefix, label)
            })
            .collect()
    }

    fn insert_route(&mut self, prefix: Ipv4Net, next_hop: NextHop, link: LinkId) {
        self.routes.retain(|r| r.prefix != prefix);
        self.routes.push(Route {
            prefix,
            next_hop,
            link,
        });
        self.routes
            .sort_by(|a, b| b.prefix.prefix_len().cmp(&a.prefix.prefix_len()));
    }

    // ----- receive --------------------------------------------------------

    pub(crate) fn receive(&mut self, ctx: &mut Ctx<'_>, packet: Packet, ingress: LinkId) {
        if packet.lost {
            ctx.log(&packet, TraceEvent::Lost);
            return;
        }
        match &packet.kind {
            PacketKind::Arp(arp) => {
                let arp = *arp;
                match arp.op {
                    ArpOp::Request => self.on_arp_request(ctx, &packet, arp.target_ip, ingress),
                    ArpOp::Reply => {
                        self.on_arp_reply(ctx, ingress, arp.sender_ip, arp.sender_mac)
                    }
                }
                return;
            }
            PacketKind::Hello(hello) => {
                let hello = hello.clone();
                self.on_hello(ctx, &hello, ingress);
                return;
            }
            PacketKind::Lsa(lsa) => {
                let lsa = lsa.clone();
                self.on_lsa(ctx, &packet, &lsa, ingress);
                return;
            }
            PacketKind::Bpdu(_) => {
                ctx.log(&packet, TraceEvent::Dropped);
                return;
            }
            _ => {}
        }
        self.forward_data(ctx, packet, ingress);
    }

    /// Answer requests for the interface's own address, and proxy-answer
    /// for targets outside the interface subnet (hosts ARP for their final
    /// destination; this interface is their way out).
    fn on_arp_request(
        &mut self,
        ctx: &mut Ctx<'_>,
        packet: &Packet,
        target: Ipv4Addr,
        ingress: LinkId,
    ) {
        let Some(iface) = self.interfaces.get(&ingress).copied() else {
            return;
        };
        let owns = target == iface.ip.addr();
        let proxy = !iface.ip.contains(&target);
        if owns || proxy {
            let reply = Packet::arp(
                ctx.next_packet_id(),
                ctx.now,
                iface.mac,
                packet.l2.source_mac,
                target,
                packet.l3.source_ip,
                ArpOp::Reply,
            );
            ctx.log(&reply, TraceEvent::ArpReplySent);
            ctx.transmit(ingress, reply);
        }
    }

    /// Install the mapping for the interface the reply came in on and
    /// re-forward whatever was parked on it (the route is looked up fresh;
    /// it may have moved meanwhile).
    fn on_arp_reply(
        &mut self,
        ctx: &mut Ctx<'_>,
        ingress: LinkId,
        sender_ip: Ipv4Addr,
        sender_mac: MacAddr,
    ) {
        self.arp_table.insert((ingress, sender_ip), sender_mac);
        if let Some(parked) = self.waiting_for_arp.remove(&(ingress, sender_ip)) {
            for packet in parked {
                self.forward_packet(ctx, packet);
            }
        }
    }

    fn on_hello(&mut self, ctx: &mut Ctx<'_>, hello: &HelloPayload, ingress: LinkId) {
        let fresh = !self.neighbors.contains_key(&hello.router_id);
        self.neighbors.insert(
            hello.router_id.clone(),
            Neighbor {
                last_hello: ctx.now,
                link: ingress,
            },
        );
        if fresh {
            debug!(router = %self.name, neighbor = %hello.router_id, "new OSPF neighbor");
        }
    }

    /// Accept strictly newer LSAs: update the topology database, recompute
    /// routes, and flood everywhere except back toward the predecessor.
    fn on_lsa(&mut self, ctx: &mut Ctx<'_>, packet: &Packet, lsa: &LsaPayload, ingress: LinkId) {
        if lsa.router_id == self.name {
            return;
        }
        let known = self
            .topology
            .get(&lsa.router_id)
            .and_then(|e| e.sequence);
        if known.is_some_and(|s| lsa.sequence_number <= s) {
            debug!(router = %self.name, origin = %lsa.router_id, "stale LSA ignored");
            return;
        }
        self.topology.insert(
            lsa.router_id.clone(),
            TopoEntry {
                sequence: Some(lsa.sequence_number),
                links: lsa.link_state_info.clone(),
            },
        );
        self.recompute_routes(ctx);

        let predecessor = ctx.peer(ingress);
        for (&link, iface) in &self.interfaces {
            if link == ingress || ctx.link(link).peer(self.node) == predecessor {
                continue;
            }
            let mut flooded = packet.clone();
            flooded.l2.source_mac = iface.mac;
            ctx.transmit(link, flooded);
        }
    }

    // ----- timers ---------------------------------------------------------

    pub(crate) fn timer(&mut self, ctx: &mut Ctx<'_>, timer: TimerKind) {
        match timer {
            TimerKind::Hello => {
                self.send_hellos(ctx);
                ctx.schedule(self.hello_interval, TimerKind::Hello);
            }
            TimerKind::Lsa => {
                self.send_lsas(ctx);
                ctx.schedule(self.lsa_interval, TimerKind::Lsa);
            }
            _ => {}
        }
    }

    fn send_hellos(&mut self, ctx: &mut Ctx<'_>) {
        let neighbors: Vec<String> = self.neighbors.keys().cloned().collect();
        for (&link, iface) in &self.interfaces {
            let hello = Packet::hello(
                ctx.next_packet_id(),
                ctx.now,
                iface.mac,
                iface.ip.addr(),
                HelloPayload {
                    router_id: self.name.clone(),
                    network: iface.ip.trunc(),
                    hello_interval: self.hello_interval,
                    neighbors: neighbors.clone(),
                },
            );
            ctx.transmit(link, hello);
        }
    }

    fn send_lsas(&mut self, ctx: &mut Ctx<'_>) {
        self.lsa_sequence += 1;
        let info = self.link_state_info(ctx);
        for (&link, iface) in &self.interfaces {
            let lsa = Packet::lsa(
                ctx.next_packet_id(),
                ctx.now,
                iface.mac,
                iface.ip.addr(),
                LsaPayload {
                    router_id: self.name.clone(),
                    sequence_number: self.lsa_sequence,
                    link_state_info: info.clone(),
                },
            );
            ctx.transmit(link, lsa);
        }
    }

    fn link_state_info(&self, ctx: &Ctx<'_>) -> BTreeMap<LinkId, LinkStateEntry> {
        self.interfaces
            .iter()
            .map(|(&link, iface)| {
                let l = ctx.link(link);
                (
                    link,
                    LinkStateEntry {
                        network: iface.ip,
                        cost: l.cost(),
                        state: if l.is_active {
                            LinkActivity::Active
                        } else {
                            LinkActivity::Inactive
                        },
                    },
                )
            })
            .collect()
    }

    // ----- data plane -----------------------------------------------------

    fn forward_data(&mut self, ctx: &mut Ctx<'_>, mut packet: Packet, ingress: LinkId) {
        packet.l3.ttl = packet.l3.ttl.saturating_sub(1);
        if packet.l3.ttl == 0 {
            ctx.log(&packet, TraceEvent::TtlExpired);
            return;
        }
        let Some(iface) = self.interfaces.get(&ingress).copied() else {
            return;
        };
        if packet.l2.destination_mac != iface.mac {
            ctx.log(&packet, TraceEvent::UnmatchedMac);
            return;
        }
        ctx.log(&packet, TraceEvent::Received);

        let dst = packet.l3.destination_ip;
        if self.interfaces.values().any(|i| i.ip.addr() == dst) {
            ctx.log(&packet, TraceEvent::Arrived);
            return;
        }
        self.forward_packet(ctx, packet);
    }

    fn forward_packet(&mut self, ctx: &mut Ctx<'_>, packet: Packet) {
        let dst = packet.l3.destination_ip;
        if dst == OSPF_MULTICAST {
            for (&link, iface) in &self.interfaces {
                let mut copy = packet.clone();
                copy.l2.source_mac = iface.mac;
                ctx.transmit(link, copy);
            }
            return;
        }
        match longest_prefix_match(&self.routes, dst).map(|r| r.link) {
            Some(link) => self.resolve_and_send(ctx, packet, link),
            None => match self.default_route {
                Some(link) => self.resolve_and_send(ctx, packet, link),
                None => ctx.log(&packet, TraceEvent::Dropped),
            },
        }
    }

    /// Rewrite the MAC pair and enqueue, resolving the next-hop MAC over
    /// ARP first if the cache misses (the packet parks meanwhile).
    fn resolve_and_send(&mut self, ctx: &mut Ctx<'_>, mut packet: Packet, link: LinkId) {
        let Some(iface) = self.interfaces.get(&link).copied() else {
            ctx.log(&packet, TraceEvent::Dropped);
            return;
        };
        let dst = packet.l3.destination_ip;
        match self.arp_table.get(&(link, dst)).copied() {
            Some(mac) => {
                packet.l2.source_mac = iface.mac;
                packet.l2.destination_mac = mac;
                ctx.log(&packet, TraceEvent::Forwarded);
                ctx.transmit(link, packet);
            }
            None => {
                let request = Packet::arp(
                    ctx.next_packet_id(),
                    ctx.now,
                    iface.mac,
                    MacAddr::BROADCAST,
                    iface.ip.addr(),
                    dst,
                    ArpOp::Request,
                );
                ctx.log(&request, TraceEvent::ArpRequestSent);
                ctx.transmit(link, request);
                self.waiting_for_arp
                    .entry((link, dst))
                    .or_default()
                    .push(packet);
            }
        }
    }

    // ----- SPF ------------------------------------------------------------

    fn recompute_routes(&mut self, ctx: &Ctx<'_>) {
        // The self entry is refreshed from live link state on every
        // recompute; it carries no flood sequence number.
        let own = self.link_state_info(ctx);
        self.topology.insert(
            self.name.clone(),
            TopoEntry {
                sequence: None,
                links: own,
            },
        );

        let (dist, prev) = self.shortest_paths(ctx);

        let mut table: BTreeMap<Ipv4Net, (NextHop, LinkId)> = BTreeMap::new();
        for (dest, entry) in &self.topology {
            if dest == &self.name || !dist.get(dest).is_some_and(|d| d.is_finite()) {
                continue;
            }
            let Some(next) = initial_hop(&prev, dest, &self.name) else {
                continue;
            };
            let Some(link) = self.link_to_neighbor(ctx, &next) else {
                continue;
            };
            for state in entry.links.values() {
                let prefix = state.network.trunc();
                let direct = self
                    .interfaces
                    .values()
                    .any(|i| nets_overlap(i.ip, state.network));
                let hop = if direct {
                    NextHop::Direct
                } else {
                    NextHop::Via(next.clone())
                };
                table.insert(prefix, (hop, link));
            }
        }
        // Local interface networks always win over SPF-derived entries.
        for (&link, iface) in &self.interfaces {
            table.insert(iface.ip.trunc(), (NextHop::Direct, link));
        }

        self.routes = table
            .into_iter()
            .map(|(prefix, (next_hop, link))| Route {
                prefix,
                next_hop,
                link,
            })
            .collect();
        self.routes
            .sort_by(|a, b| b.prefix.prefix_len().cmp(&a.prefix.prefix_len()));
        debug!(router = %self.name, routes = self.routes.len(), "routing table recomputed");
    }

    fn shortest_paths(
        &self,
        ctx: &Ctx<'_>,
    ) -> (BTreeMap<String, f64>, BTreeMap<String, Option<String>>) {
        #[derive(PartialEq)]
        struct Item {
            cost: f64,
            router: String,
        }
        impl Eq for Item {}
        impl PartialOrd for Item {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Item {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.cost
                    .total_cmp(&other.cost)
                    .then_with(|| self.router.cmp(&other.router))
            }
        }

        let mut dist: BTreeMap<String, f64> = self
            .topology
            .keys()
            .map(|k| (k.clone(), f64::INFINITY))
            .collect();
        let mut prev: BTreeMap<String, Option<String>> =
            self.topology.keys().map(|k| (k.clone(), None)).collect();
        dist.insert(self.name.clone(), 0.0);

        let mut heap = BinaryHeap::new();
        heap.push(Reverse(Item {
            cost: 0.0,
            router: self.name.clone(),
        }));
        while let Some(Reverse(item)) = heap.pop() {
            if item.cost > dist[&item.router] {
                continue;
            }
            let Some(entry) = self.topology.get(&item.router) else {
                continue;
            };
            for (&link, state) in &entry.links {
                if state.state == LinkActivity::Inactive {
                    continue;
                }
                let Some(neighbor) = neighbor_router(ctx, link, &item.router) else {
                    continue;
                };
                if !dist.contains_key(&neighbor) {
                    continue;
                }
                let candidate = item.cost + state.cost;
                if candidate < dist[&neighbor] {
                    dist.insert(neighbor.clone(), candidate);
                    prev.insert(neighbor.clone(), Some(item.router.clone()));
                    heap.push(Reverse(Item {
                        cost: candidate,
                        router: neighbor,
                    }));
                }
            }
        }
        (dist, prev)
    }

    /// The hello-learned link is only trusted while the neighbor is alive;
    /// otherwise fall back to scanning the interfaces for a direct link.
    fn link_to_neighbor(&self, ctx: &Ctx<'_>, neighbor: &str) -> Option<LinkId> {
        if let Some(n) = self.neighbors.get(neighbor)
            && n.is_alive(ctx.now, self.hello_interval)
        {
            return Some(n.link);
        }
        self.interfaces
            .keys()
            .find(|&&link| ctx.node_name(ctx.link(link).peer(self.node)) == neighbor)
            .copied()
    }
}

/// The router on the far side of `link` from `current`, by name.
fn neighbor_router(ctx: &Ctx<'_>, link: LinkId, current: &str) -> Option<String> {
    let info = ctx.link(link);
    let a = ctx.node_name(info.a);
    let b = ctx.node_name(info.b);
    if a == current {
        Some(b.to_string())
    } else if b == current {
        Some(a.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, link: usize) -> Route {
        Route {
            prefix: prefix.parse().unwrap(),
            next_hop: NextHop::Direct,
            link: LinkId(link),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let mut routes = vec![
            route("10.0.0.0/8", 0),
            route("10.1.0.0/16", 1),
            route("10.1.2.0/24", 2),
        ];
        routes.sort_by(|a, b| b.prefix.prefix_len().cmp(&a.prefix.prefix_len()));
        let hit = longest_prefix_match(&routes, "10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(hit.link, LinkId(2));
        let hit = longest_prefix_match(&routes, "10.1.9.9".parse().unwrap()).unwrap();
        assert_eq!(hit.link, LinkId(1));
        let hit = longest_prefix_match(&routes, "10.9.9.9".parse().unwrap()).unwrap();
        assert_eq!(hit.link, LinkId(0));
        assert!(longest_prefix_match(&routes, "192.168.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn neighbor_liveness_window() {
        let neighbor = Neighbor {
            last_hello: 100.0,
            link: LinkId(0),
        };
        assert!(neighbor.is_alive(100.0, 10.0));
        assert!(neighbor.is_alive(139.9, 10.0));
        assert!(!neighbor.is_alive(140.1, 10.0));
    }

    #[test]
    fn initial_hop_walks_predecessors() {
        let mut prev: BTreeMap<String, Option<String>> = BTreeMap::new();
        prev.insert("r1".into(), None);
        prev.insert("r3".into(), Some("r1".into()));
        prev.insert("r2".into(), Some("r3".into()));
        assert_eq!(initial_hop(&prev, "r2", "r1"), Some("r3".into()));
        assert_eq!(initial_hop(&prev, "r3", "r1"), Some("r3".into()));
        assert_eq!(initial_hop(&prev, "r1", "r1"), None);
    }
}
