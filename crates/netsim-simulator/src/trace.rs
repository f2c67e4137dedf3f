use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;

use netsim_model::MacAddr;
use netsim_model::packet::Packet;

/// Event types recorded against a packet. This is the stable vocabulary
/// consumed by downstream reporters; additions are fine, renames are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEvent {
    Received,
    Arrived,
    Lost,
    Dropped,
    DroppedLinkInactive,
    Broadcast,
    Forwarded,
    TtlExpired,
    UnmatchedMac,
    FragmentStored,
    Reassembled,
    ReassembleFailedNoFragments,
    ReassembleFailedIncompleteData,
    ArpRequestSent,
    ArpReplySent,
    ArpReplyReceived,
    DhcpDiscoverSent,
    DhcpOfferSent,
    DhcpOfferReceived,
    DhcpRequestSent,
    DhcpAckSent,
    DhcpAckReceived,
    DnsQuerySent,
    DnsQueryReceived,
    DnsResponseSent,
    DnsResponseReceived,
    BpduReceived,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEventRecord {
    pub time: f64,
    pub event: TraceEvent,
    pub node_id: String,
}

/// One packet's life, as exposed to reporting code.
#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub id: u64,
    pub packet_type: &'static str,
    pub source_mac: MacAddr,
    pub destination_mac: MacAddr,
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub size: usize,
    pub creation_time: f64,
    /// `None` until an `arrived` event stamps it; stays `None` for packets
    /// lost in flight.
    pub arrival_time: Option<f64>,
    pub events: Vec<TraceEventRecord>,
}

/// Append-only per-packet event log. Records are created lazily on the
/// first event a packet triggers; ordering by packet id keeps exports
/// deterministic.
#[derive(Debug, Default)]
pub struct PacketTrace {
    records: BTreeMap<u64, PacketRecord>,
}

impl PacketTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, now: f64, packet: &Packet, event: TraceEvent, node: &str) {
        let record = self.records.entry(packet.id).or_insert_with(|| PacketRecord {
            id: packet.id,
            packet_type: packet.type_label(),
            source_mac: packet.l2.source_mac,
            destination_mac: packet.l2.destination_mac,
            source_ip: packet.l3.source_ip,
            destination_ip: packet.l3.destination_ip,
            size: packet.size,
            creation_time: packet.creation_time,
            arrival_time: None,
            events: Vec::new(),
        });
        if event == TraceEvent::Arrived {
            record.arrival_time = Some(now);
        }
        record.events.push(TraceEventRecord {
            time: now,
            event,
            node_id: node.to_string(),
        });
    }

    pub fn records(&self) -> impl Iterator<Item = &PacketRecord> {
        self.records.values()
    }

    pub fn record(&self, id: u64) -> Option<&PacketRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aggregate per `(packet_type, source, destination)` flow: counts,
    /// bytes, mean delay and mean goodput over the observation window.
    pub fn summary(&self) -> Vec<FlowSummary> {
        #[derive(Default)]
        struct Acc {
            sent_packets: u64,
            sent_bytes: u64,
            received_packets: u64,
            received_bytes: u64,
            lost_packets: u64,
            total_delay: f64,
            min_creation: f64,
            max_arrival: f64,
        }

        let mut acc: BTreeMap<(&'static str, Ipv4Addr, Ipv4Addr), Acc> = BTreeMap::new();
        for record in self.records.values() {
            let entry = acc
                .entry((record.packet_type, record.source_ip, record.destination_ip))
                .or_insert_with(|| Acc {
                    min_creation: f64::INFINITY,
                    ..Default::default()
                });
            entry.sent_packets += 1;
            entry.sent_bytes += record.size as u64;
            entry.min_creation = entry.min_creation.min(record.creation_time);
            match record.arrival_time {
                Some(arrival) => {
                    entry.received_packets += 1;
                    entry.received_bytes += record.size as u64;
                    entry.total_delay += arrival - record.creation_time;
                    entry.max_arrival = entry.max_arrival.max(arrival);
                }
                None => entry.lost_packets += 1,
            }
        }

        acc.into_iter()
            .map(|((packet_type, src, dst), a)| {
                let window = a.max_arrival - a.min_creation;
                FlowSummary {
                    packet_type,
                    source_ip: src,
                    destination_ip: dst,
                    sent_packets: a.sent_packets,
                    sent_bytes: a.sent_bytes,
                    received_packets: a.received_packets,
                    received_bytes: a.received_bytes,
                    lost_packets: a.lost_packets,
                    average_delay: if a.received_packets > 0 {
                        a.total_delay / a.received_packets as f64
                    } else {
                        0.0
                    },
                    average_throughput_bps: if window > 0.0 {
                        a.received_bytes as f64 * 8.0 / window
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub packet_type: &'static str,
    pub source_ip: Ipv4Addr,
    pub destination_ip: Ipv4Addr,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub lost_packets: u64,
    pub average_delay: f64,
    pub average_throughput_bps: f64,
}

/// Serializable snapshot of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub duration: f64,
    pub packets: Vec<PacketRecord>,
    pub summary: Vec<FlowSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_model::packet::{FragmentFlags, TransportHeader};

    fn packet(id: u64, created: f64) -> Packet {
        Packet::data(
            id,
            created,
            MacAddr::ZERO,
            MacAddr::BROADCAST,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            FragmentFlags::default(),
            0,
            TransportHeader::Udp { src_port: 1, dst_port: 2 },
            vec![0u8; 100],
        )
    }

    #[test]
    fn arrived_stamps_arrival_time() {
        let mut trace = PacketTrace::new();
        let p = packet(1, 0.5);
        trace.log(0.6, &p, TraceEvent::Received, "s1");
        trace.log(0.7, &p, TraceEvent::Arrived, "n2");
        let record = trace.record(1).unwrap();
        assert_eq!(record.arrival_time, Some(0.7));
        assert_eq!(record.events.len(), 2);
        assert_eq!(record.events[0].node_id, "s1");
    }

    #[test]
    fn lost_packets_keep_null_arrival() {
        let mut trace = PacketTrace::new();
        let p = packet(1, 0.0);
        trace.log(0.1, &p, TraceEvent::Lost, "n2");
        assert_eq!(trace.record(1).unwrap().arrival_time, None);
    }

    #[test]
    fn summary_aggregates_per_flow() {
        let mut trace = PacketTrace::new();
        for id in 0..4u64 {
            let p = packet(id, id as f64);
            if id == 3 {
                trace.log(id as f64 + 0.1, &p, TraceEvent::Lost, "n2");
            } else {
                trace.log(id as f64 + 0.5, &p, TraceEvent::Arrived, "n2");
            }
        }
        let summary = trace.summary();
        assert_eq!(summary.len(), 1);
        let flow = &summary[0];
        assert_eq!(flow.sent_packets, 4);
        assert_eq!(flow.received_packets, 3);
        assert_eq!(flow.lost_packets, 1);
        assert!((flow.average_delay - 0.5).abs() < 1e-12);
    }
}
