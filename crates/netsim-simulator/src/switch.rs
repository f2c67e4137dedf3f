use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use netsim_model::packet::{BpduPayload, Packet, PacketKind};
use netsim_model::{LinkId, MacAddr, NodeId};

use crate::engine::{Ctx, DeviceKind};
use crate::scheduler::TimerKind;
use crate::trace::TraceEvent;

/// Spanning-tree state of one switch port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initial,
    Forwarding,
    Blocking,
}

/// Whether a `(root_id, path_cost)` claim lexicographically improves on the
/// current one.
fn better_claim(current_root: &str, current_cost: f64, root: &str, cost: f64) -> bool {
    root < current_root || (root == current_root && cost < current_cost)
}

/// A learning switch running the spanning-tree protocol. Ports toward
/// non-switch devices always forward; among switch-to-switch ports a
/// non-root bridge keeps exactly one uplink and blocks the rest.
pub struct Switch {
    node: NodeId,
    name: String,
    links: Vec<LinkId>,
    port_states: BTreeMap<LinkId, PortState>,
    forwarding_table: HashMap<MacAddr, LinkId>,
    root_id: String,
    root_path_cost: f64,
    is_root: bool,
}

impl Switch {
    pub fn new(node: NodeId, name: String) -> Self {
        Switch {
            node,
            root_id: name.clone(),
            name,
            links: Vec::new(),
            port_states: BTreeMap::new(),
            forwarding_table: HashMap::new(),
            root_path_cost: 0.0,
            is_root: true,
        }
    }

    pub fn attach(&mut self, link: LinkId) {
        self.links.push(link);
        self.port_states.insert(link, PortState::Initial);
        // Every switch starts as the root of its own tree, and a root
        // forwards on all ports. BPDU processing revises this.
        if self.is_root {
            for state in self.port_states.values_mut() {
                *state = PortState::Forwarding;
            }
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn port_states(&self) -> Vec<(LinkId, PortState)> {
        self.port_states.iter().map(|(&l, &s)| (l, s)).collect()
    }

    pub(crate) fn timer(&mut self, ctx: &mut Ctx<'_>, timer: TimerKind) {
        if let TimerKind::StpAnnounce = timer {
            self.send_bpdus(ctx);
        }
    }

    pub(crate) fn receive(&mut self, ctx: &mut Ctx<'_>, packet: Packet, ingress: LinkId) {
        if let PacketKind::Bpdu(bpdu) = &packet.kind {
            ctx.log(&packet, TraceEvent::BpduReceived);
            let bpdu = bpdu.clone();
            self.process_bpdu(ctx, &bpdu, ingress);
            return;
        }

        if packet.lost {
            ctx.log(&packet, TraceEvent::Lost);
            return;
        }
        ctx.log(&packet, TraceEvent::Received);

        // MAC learning: remember which port the source sits behind.
        self.forwarding_table.insert(packet.l2.source_mac, ingress);
        self.forward_frame(ctx, packet, ingress);
    }

    fn forward_frame(&mut self, ctx: &mut Ctx<'_>, packet: Packet, ingress: LinkId) {
        // Unicast out the learned port only while that port still forwards;
        // a destination learned behind a since-blocked port is treated as
        // unknown and flooded like everything else.
        let destination = packet.l2.destination_mac;
        if !destination.is_broadcast()
            && let Some(&out) = self.forwarding_table.get(&destination)
            && self.port_states.get(&out) == Some(&PortState::Forwarding)
        {
            ctx.log(&packet, TraceEvent::Forwarded);
            ctx.transmit(out, packet);
            return;
        }
        for &link in &self.links {
            if link != ingress && self.port_states.get(&link) == Some(&PortState::Forwarding) {
                ctx.log(&packet, TraceEvent::Broadcast);
                ctx.transmit(link, packet.clone());
            }
        }
    }

    fn process_bpdu(&mut self, ctx: &mut Ctx<'_>, bpdu: &BpduPayload, _ingress: LinkId) {
        let new_cost = bpdu.path_cost + 1.0;
        let changed = better_claim(&self.root_id, self.root_path_cost, &bpdu.root_id, new_cost);
        if changed {
            debug!(
                switch = %self.name,
                root = %bpdu.root_id,
                cost = new_cost,
                "adopting new spanning-tree root"
            );
            self.root_id = bpdu.root_id.clone();
            self.root_path_cost = new_cost;
            self.is_root = false;
        }

        self.update_port_states(ctx, new_cost);

        if changed {
            self.send_bpdus(ctx);
        }
    }

    fn update_port_states(&mut self, ctx: &mut Ctx<'_>, received_cost: f64) {
        if self.is_root {
            for state in self.port_states.values_mut() {
                *state = PortState::Forwarding;
            }
            return;
        }

        // Pick the single uplink among switch-to-switch ports: the one
        // minimizing (link cost + received path cost, min endpoint id).
        let mut best: Option<(f64, String, LinkId)> = None;
        for &link in &self.links {
            if !self.connects_switches(ctx, link) {
                continue;
            }
            let info = ctx.link(link);
            let cost = info.cost() + received_cost;
            let low_endpoint = {
                let a = ctx.node_name(info.a);
                let b = ctx.node_name(info.b);
                if a < b { a } else { b }.to_string()
            };
            let candidate = (cost, low_endpoint, link);
            best = match best {
                None => Some(candidate),
                Some(cur) => {
                    if candidate.0.total_cmp(&cur.0).then(candidate.1.cmp(&cur.1))
                        == std::cmp::Ordering::Less
                    {
                        Some(candidate)
                    } else {
                        Some(cur)
                    }
                }
            };
        }
        let uplink = best.map(|(_, _, l)| l);

        for &link in &self.links {
            let state = if Some(link) == uplink || !self.connects_switches(ctx, link) {
                PortState::Forwarding
            } else {
                PortState::Blocking
            };
            self.port_states.insert(link, state);
        }
    }

    fn connects_switches(&self, ctx: &Ctx<'_>, link: LinkId) -> bool {
        let peer = ctx.link(link).peer(self.node);
        ctx.node_kind(peer) == DeviceKind::Switch
    }

    fn send_bpdus(&mut self, ctx: &mut Ctx<'_>) {
        for &link in &self.links {
            let packet = Packet::bpdu(
                ctx.next_packet_id(),
                ctx.now,
                BpduPayload {
                    root_id: self.root_id.clone(),
                    bridge_id: self.name.clone(),
                    path_cost: self.root_path_cost,
                },
            );
            ctx.transmit(link, packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_comparison_is_lexicographic() {
        // Smaller root id wins regardless of cost.
        assert!(better_claim("s2", 0.0, "s1", 10.0));
        // Same root: lower cost wins.
        assert!(better_claim("s1", 3.0, "s1", 2.0));
        assert!(!better_claim("s1", 2.0, "s1", 2.0));
        assert!(!better_claim("s1", 2.0, "s1", 3.0));
        // Larger root never adopted.
        assert!(!better_claim("s1", 5.0, "s2", 0.0));
    }

    #[test]
    fn new_switch_is_its_own_root_and_forwards_everywhere() {
        let mut switch = Switch::new(NodeId(0), "s1".into());
        switch.attach(LinkId(0));
        switch.attach(LinkId(1));
        assert!(switch.is_root());
        assert!(
            switch
                .port_states()
                .iter()
                .all(|&(_, s)| s == PortState::Forwarding)
        );
    }
}
