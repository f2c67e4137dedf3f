use std::collections::VecDeque;

use netsim_model::config::MIN_LINK_COST;
use netsim_model::packet::Packet;
use netsim_model::{LinkId, NodeId};

use crate::scheduler::Dir;

/// What a dequeue produced: the packet now serializing, when serialization
/// started and how long it takes, and the start time of the next queued
/// packet (the engine schedules the follow-up dequeue from it).
pub struct Dequeued {
    pub packet: Packet,
    pub start: f64,
    pub transmit: f64,
    pub next_start: Option<f64>,
}

#[derive(Debug, Default)]
struct DirQueue {
    queue: VecDeque<(f64, Packet)>,
    /// Absolute time at which this direction finishes serializing
    /// everything currently queued. Reset to zero once it drains.
    tail: f64,
}

/// A bidirectional point-to-point link with one FIFO serialization queue
/// per direction. Transmission time is `size * 8 / bandwidth`; delivery
/// happens a further `delay` seconds after serialization completes.
#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub a: NodeId,
    pub b: NodeId,
    /// Bits per second.
    pub bandwidth: f64,
    /// Propagation delay, seconds.
    pub delay: f64,
    pub loss_rate: f64,
    pub is_active: bool,
    dirs: [DirQueue; 2],
}

impl Link {
    pub fn new(id: LinkId, a: NodeId, b: NodeId, bandwidth: f64, delay: f64, loss_rate: f64) -> Self {
        Link {
            id,
            a,
            b,
            bandwidth,
            delay,
            loss_rate,
            is_active: true,
            dirs: [DirQueue::default(), DirQueue::default()],
        }
    }

    pub fn dir_from(&self, from: NodeId) -> Dir {
        if from == self.a { Dir::AToB } else { Dir::BToA }
    }

    /// The node on the receiving end of a direction.
    pub fn receiver(&self, dir: Dir) -> NodeId {
        match dir {
            Dir::AToB => self.b,
            Dir::BToA => self.a,
        }
    }

    /// The opposite endpoint of `node`.
    pub fn peer(&self, node: NodeId) -> NodeId {
        if node == self.a { self.b } else { self.a }
    }

    pub fn transmit_time(&self, size: usize) -> f64 {
        size as f64 * 8.0 / self.bandwidth
    }

    /// STP/OSPF cost of this link.
    pub fn cost(&self) -> f64 {
        (1.0 / self.bandwidth).max(MIN_LINK_COST)
    }

    /// Queue a packet for transmission. Serialization starts once the
    /// direction is free: `start = max(now, tail)`. Returns the dequeue
    /// event time when this packet is first in line (the engine must
    /// schedule a `LinkDequeue` for it); later packets are chained from the
    /// preceding dequeue.
    pub fn enqueue(&mut self, now: f64, from: NodeId, packet: Packet) -> Option<f64> {
        let transmit = self.transmit_time(packet.size);
        let d = &mut self.dirs[self.dir_from(from).index()];
        let start = now.max(d.tail);
        d.tail = start + transmit;
        d.queue.push_back((start, packet));
        (d.queue.len() == 1).then_some(start)
    }

    /// Pop the head of a direction queue when its serialization slot opens.
    pub fn dequeue(&mut self, dir: Dir) -> Option<Dequeued> {
        let bandwidth = self.bandwidth;
        let d = &mut self.dirs[dir.index()];
        let (start, packet) = d.queue.pop_front()?;
        let transmit = packet.size as f64 * 8.0 / bandwidth;
        let next_start = d.queue.front().map(|(s, _)| *s);
        Some(Dequeued {
            packet,
            start,
            transmit,
            next_start,
        })
    }

    /// Tail decay: once the direction has fully drained, snap the tail back
    /// to zero so idle time never accumulates into future starts.
    pub fn idle_check(&mut self, now: f64, dir: Dir) {
        let d = &mut self.dirs[dir.index()];
        if d.queue.is_empty() && d.tail <= now {
            d.tail = 0.0;
        }
    }

    pub fn queued(&self, dir: Dir) -> usize {
        self.dirs[dir.index()].queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsim_model::MacAddr;
    use netsim_model::packet::{FragmentFlags, TransportHeader};

    fn test_packet(id: u64, payload: usize) -> Packet {
        Packet::data(
            id,
            0.0,
            MacAddr::ZERO,
            MacAddr::BROADCAST,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            FragmentFlags::default(),
            0,
            TransportHeader::Udp { src_port: 1, dst_port: 2 },
            vec![0u8; payload],
        )
    }

    fn test_link() -> Link {
        // 1 Mbps, 10 ms
        Link::new(LinkId(0), NodeId(0), NodeId(1), 1_000_000.0, 0.01, 0.0)
    }

    #[test]
    fn first_packet_starts_immediately() {
        let mut link = test_link();
        let p = test_packet(1, 972); // 1000 bytes on the wire
        let start = link.enqueue(0.5, NodeId(0), p);
        assert_eq!(start, Some(0.5));
        let out = link.dequeue(Dir::AToB).unwrap();
        assert_eq!(out.start, 0.5);
        // 1000 * 8 / 1e6 = 8 ms
        assert!((out.transmit - 0.008).abs() < 1e-12);
        assert!(out.next_start.is_none());
    }

    #[test]
    fn second_packet_waits_for_the_first() {
        let mut link = test_link();
        assert_eq!(link.enqueue(0.0, NodeId(0), test_packet(1, 972)), Some(0.0));
        // Enqueued while the first is still serializing: starts at its tail.
        assert_eq!(link.enqueue(0.001, NodeId(0), test_packet(2, 972)), None);
        let first = link.dequeue(Dir::AToB).unwrap();
        assert_eq!(first.packet.id, 1);
        assert_eq!(first.next_start, Some(0.008));
        let second = link.dequeue(Dir::AToB).unwrap();
        assert_eq!(second.packet.id, 2);
        assert_eq!(second.start, 0.008);
    }

    #[test]
    fn directions_are_independent() {
        let mut link = test_link();
        assert_eq!(link.enqueue(0.0, NodeId(0), test_packet(1, 972)), Some(0.0));
        assert_eq!(link.enqueue(0.0, NodeId(1), test_packet(2, 972)), Some(0.0));
        assert_eq!(link.queued(Dir::AToB), 1);
        assert_eq!(link.queued(Dir::BToA), 1);
    }

    #[test]
    fn tail_resets_after_drain() {
        let mut link = test_link();
        link.enqueue(0.0, NodeId(0), test_packet(1, 972));
        link.dequeue(Dir::AToB).unwrap();
        link.idle_check(0.008, Dir::AToB);
        // A later enqueue starts at `now`, not at some stale tail.
        assert_eq!(link.enqueue(5.0, NodeId(0), test_packet(2, 972)), Some(5.0));
    }

    #[test]
    fn fifo_regardless_of_size() {
        let mut link = test_link();
        link.enqueue(0.0, NodeId(0), test_packet(1, 9972)); // big first
        link.enqueue(0.0, NodeId(0), test_packet(2, 72)); // small second
        let first = link.dequeue(Dir::AToB).unwrap();
        let second = link.dequeue(Dir::AToB).unwrap();
        assert_eq!(first.packet.id, 1);
        assert_eq!(second.packet.id, 2);
        assert!(second.start >= first.start + first.transmit - 1e-12);
    }

    #[test]
    fn cost_is_inverse_bandwidth_with_floor() {
        let link = test_link();
        assert!((link.cost() - 1e-6).abs() < 1e-18);
    }
}
