use std::cmp::Ordering;
use std::collections::BinaryHeap;

use netsim_model::packet::{Packet, TransportKind};
use netsim_model::{LinkId, NodeId};

/// Direction of travel across a link, named after its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    AToB,
    BToA,
}

impl Dir {
    pub fn index(self) -> usize {
        match self {
            Dir::AToB => 0,
            Dir::BToA => 1,
        }
    }
}

/// Parameters of one traffic generator request, carried from the public
/// `start_*_traffic` call to the host that will run it (possibly after a
/// DNS round trip).
#[derive(Debug, Clone)]
pub struct TrafficSpec {
    pub url: String,
    pub protocol: TransportKind,
    pub bitrate: f64,
    pub start_time: f64,
    pub duration: f64,
    pub header_size: usize,
    pub payload_size: usize,
    pub burstiness: f64,
}

impl TrafficSpec {
    /// Inter-packet interval of the generator.
    pub fn interval(&self) -> f64 {
        (self.header_size + self.payload_size) as f64 * 8.0 / self.bitrate * self.burstiness
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Timers delivered back to a device. Periodic tasks re-arm themselves from
/// the handler; termination is by predicate, never by cancellation.
#[derive(Debug, Clone)]
pub enum TimerKind {
    /// DHCP client kick-off, scheduled with start jitter at construction.
    DhcpDiscover,
    /// Switch announces its (root, cost) claim on every port.
    StpAnnounce,
    /// Router hello tick.
    Hello,
    /// Router LSA tick.
    Lsa,
    /// Resolve a traffic URL and start generating.
    StartTraffic(TrafficSpec),
    /// One UDP generator tick; the index addresses the host's flow table.
    TrafficTick(usize),
}

#[derive(Debug)]
pub enum EventKind {
    /// A packet reaches the head of a link direction queue and starts
    /// serializing.
    LinkDequeue { link: LinkId, dir: Dir },
    /// Serialization finished; reset the direction tail if it drained.
    LinkIdle { link: LinkId, dir: Dir },
    /// A packet arrives at a node after transmission + propagation.
    Deliver {
        node: NodeId,
        link: LinkId,
        packet: Packet,
    },
    Timer {
        node: NodeId,
        timer: TimerKind,
    },
}

#[derive(Debug)]
struct Event {
    time: f64,
    kind: EventKind,
    seq: u64, // Unique ID to order events at the same time
}

// Custom Ord for Min-Heap (smallest time pops first)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison: smallest (time, seq) is Greater in BinaryHeap
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The virtual clock and its event heap. Strictly single-threaded; `now`
/// never decreases, and events scheduled at equal times dispatch in
/// scheduling order.
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    seq: u64,
    now: f64,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            seq: 0,
            now: 0.0,
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    /// Insert an event at an absolute time. Scheduling into the past is a
    /// caller bug; release builds clamp to `now` so the clock stays
    /// monotone.
    pub fn schedule(&mut self, time: f64, kind: EventKind) {
        debug_assert!(time >= self.now, "event scheduled in the past");
        let time = time.max(self.now);
        self.heap.push(Event {
            time,
            kind,
            seq: self.seq,
        });
        self.seq += 1;
    }

    pub fn schedule_in(&mut self, delay: f64, kind: EventKind) {
        self.schedule(self.now + delay.max(0.0), kind);
    }

    pub fn peek_time(&self) -> Option<f64> {
        self.heap.peek().map(|e| e.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop the minimum `(time, seq)` event and advance the clock to it.
    pub fn pop(&mut self) -> Option<EventKind> {
        let event = self.heap.pop()?;
        self.now = event.time;
        Some(event.kind)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(n: usize) -> EventKind {
        EventKind::Timer {
            node: NodeId(n),
            timer: TimerKind::DhcpDiscover,
        }
    }

    fn node_of(kind: &EventKind) -> usize {
        match kind {
            EventKind::Timer { node, .. } => node.0,
            _ => unreachable!(),
        }
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = EventQueue::new();
        q.schedule(3.0, marker(3));
        q.schedule(1.0, marker(1));
        q.schedule(2.0, marker(2));
        let order: Vec<usize> = std::iter::from_fn(|| q.pop()).map(|k| node_of(&k)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn equal_times_dispatch_fifo() {
        let mut q = EventQueue::new();
        for n in 0..16 {
            q.schedule(5.0, marker(n));
        }
        let order: Vec<usize> = std::iter::from_fn(|| q.pop()).map(|k| node_of(&k)).collect();
        assert_eq!(order, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn clock_is_monotone() {
        let mut q = EventQueue::new();
        q.schedule(2.0, marker(0));
        q.schedule(1.0, marker(1));
        q.schedule(2.0, marker(2));
        let mut last = 0.0;
        while q.pop().is_some() {
            assert!(q.now() >= last);
            last = q.now();
        }
    }

    #[test]
    fn schedule_from_now_lands_after_earlier_seq() {
        // Two events at the same instant: the one scheduled first pops
        // first even after interleaved pops.
        let mut q = EventQueue::new();
        q.schedule(1.0, marker(0));
        assert_eq!(node_of(&q.pop().unwrap()), 0);
        // now == 1.0; schedule two more at the current instant
        q.schedule(1.0, marker(1));
        q.schedule(1.0, marker(2));
        assert_eq!(node_of(&q.pop().unwrap()), 1);
        assert_eq!(node_of(&q.pop().unwrap()), 2);
    }
}
