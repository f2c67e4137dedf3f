use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use rand::Rng;
use tracing::{debug, info};

use netsim_model::config::{DUP_ACK_THRESHOLD, TCP_INITIAL_WINDOW};
use netsim_model::packet::{Packet, PacketKind, TransportHeader, TransportKind};
use netsim_model::tcp_flags;

use crate::engine::Ctx;
use crate::host::{Host, SendRequest};
use crate::scheduler::TrafficSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    SynReceived,
    Established,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpTrafficInfo {
    pub end_time: f64,
    pub payload_size: usize,
}

/// One TCP connection, keyed by `(peer ip, peer port)` on the owning host.
/// The record exists from the first SYN (sent or received) until a FIN
/// deletes it.
#[derive(Debug)]
pub struct TcpConnection {
    pub(crate) state: TcpState,
    /// Next sequence number this side will send.
    pub(crate) seq: u32,
    /// Next byte expected from the peer (the cumulative ACK we advertise).
    pub(crate) ack: u32,
    pub(crate) last_ack: Option<u32>,
    pub(crate) duplicate_ack_count: u32,
    /// Application bytes not yet put on the wire (fixed buffer, sized
    /// `bitrate * duration / 8` at connection setup).
    pub(crate) pending: Vec<u8>,
    /// Sent segments by starting sequence number, for fast retransmit.
    pub(crate) history: BTreeMap<u32, SendRequest>,
    /// Out-of-order receive buffer: segment start -> length.
    pub(crate) reorder: BTreeMap<u32, usize>,
    pub(crate) traffic: Option<TcpTrafficInfo>,
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
}

impl TcpConnection {
    /// Cut up to `limit` segments off the pending buffer. Stops early when
    /// the buffer runs dry or the traffic window has closed.
    fn take_segments(&mut self, now: f64, peer: Ipv4Addr, limit: usize) -> Vec<SendRequest> {
        let Some(traffic) = self.traffic else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < limit && !self.pending.is_empty() && now < traffic.end_time {
            let len = traffic.payload_size.min(self.pending.len());
            let payload: Vec<u8> = self.pending.drain(..len).collect();
            let request = SendRequest {
                dst_ip: peer,
                transport: TransportKind::Tcp,
                src_port: self.src_port,
                dst_port: self.dst_port,
                seq: self.seq,
                ack: self.ack,
                flags: tcp_flags::PSH,
                payload,
            };
            self.history.insert(self.seq, request.clone());
            self.seq += len as u32;
            out.push(request);
        }
        out
    }

    fn control(&self, peer: Ipv4Addr, flags: u8) -> SendRequest {
        SendRequest {
            dst_ip: peer,
            transport: TransportKind::Tcp,
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq: self.seq,
            ack: self.ack,
            flags,
            payload: Vec::new(),
        }
    }
}

impl Host {
    /// Active open: buffer the whole transfer, pick an ISN, send the SYN.
    pub(crate) fn open_tcp(&mut self, ctx: &mut Ctx<'_>, dst: Ipv4Addr, spec: TrafficSpec) {
        let src_port = self.random_port(ctx);
        let dst_port = self.random_port(ctx);
        let isn: u32 = ctx.rng.random_range(1..=10_000);
        let buffered = (spec.bitrate * spec.duration / 8.0) as usize;
        let connection = TcpConnection {
            state: TcpState::SynSent,
            seq: isn,
            ack: 0,
            last_ack: None,
            duplicate_ack_count: 0,
            pending: vec![b'X'; buffered],
            history: BTreeMap::new(),
            reorder: BTreeMap::new(),
            traffic: Some(TcpTrafficInfo {
                end_time: spec.end_time(),
                payload_size: spec.payload_size,
            }),
            src_port,
            dst_port,
        };
        let syn = connection.control(dst, tcp_flags::SYN);
        info!(peer = %dst, port = dst_port, bytes = buffered, "opening TCP connection");
        self.connections.insert((dst, dst_port), connection);
        self.send_transport(ctx, syn);
    }

    pub(crate) fn handle_tcp(&mut self, ctx: &mut Ctx<'_>, packet: &Packet) {
        let PacketKind::Data(data) = &packet.kind else { return };
        let TransportHeader::Tcp {
            src_port,
            seq,
            ack,
            flags,
            ..
        } = data.transport
        else {
            return;
        };
        let peer = packet.l3.source_ip;
        let key = (peer, src_port);
        let payload_len = data.payload.len() as u32;

        if flags & tcp_flags::SYN != 0 {
            if flags & tcp_flags::ACK != 0 {
                self.on_syn_ack(ctx, key, seq, ack);
            } else {
                self.on_syn(ctx, key, seq, data.transport.dst_port());
            }
            return;
        }
        if flags & tcp_flags::ACK != 0 {
            self.on_ack(ctx, key, ack);
        }
        if flags & tcp_flags::PSH != 0 {
            self.on_data(ctx, key, seq, payload_len, packet);
        }
        if flags & tcp_flags::FIN != 0 {
            self.on_fin(key);
        }
    }

    /// Passive open: a fresh SYN creates the connection record and answers
    /// with a SYN-ACK; the SYN itself consumes one sequence number.
    fn on_syn(&mut self, ctx: &mut Ctx<'_>, key: (Ipv4Addr, u16), peer_seq: u32, our_port: u16) {
        if self.connections.contains_key(&key) {
            debug!(peer = %key.0, "duplicate SYN ignored");
            return;
        }
        let isn: u32 = ctx.rng.random_range(1..=10_000);
        let mut connection = TcpConnection {
            state: TcpState::SynReceived,
            seq: isn,
            ack: peer_seq + 1,
            last_ack: None,
            duplicate_ack_count: 0,
            pending: Vec::new(),
            history: BTreeMap::new(),
            reorder: BTreeMap::new(),
            traffic: None,
            src_port: our_port,
            dst_port: key.1,
        };
        let syn_ack = connection.control(key.0, tcp_flags::SYN | tcp_flags::ACK);
        connection.seq = isn + 1;
        self.connections.insert(key, connection);
        self.send_transport(ctx, syn_ack);
    }

    /// Active side completes the handshake and opens with a window's worth
    /// of data back to back.
    fn on_syn_ack(&mut self, ctx: &mut Ctx<'_>, key: (Ipv4Addr, u16), peer_seq: u32, _ack: u32) {
        let Some(mut connection) = self.connections.remove(&key) else {
            debug!(peer = %key.0, "SYN-ACK for unknown connection");
            return;
        };
        if connection.state != TcpState::SynSent {
            self.connections.insert(key, connection);
            return;
        }
        connection.state = TcpState::Established;
        connection.seq += 1;
        connection.ack = peer_seq + 1;
        info!(peer = %key.0, port = key.1, "TCP connection established");
        let ack = connection.control(key.0, tcp_flags::ACK);
        let burst = connection.take_segments(ctx.now, key.0, TCP_INITIAL_WINDOW);
        self.connections.insert(key, connection);
        self.send_transport(ctx, ack);
        for segment in burst {
            self.send_transport(ctx, segment);
        }
    }

    /// Sender-side ACK clock: a new ACK releases the next segment, the
    /// third duplicate triggers a fast retransmit, and the final ACK of the
    /// transfer is answered with a FIN.
    fn on_ack(&mut self, ctx: &mut Ctx<'_>, key: (Ipv4Addr, u16), ack: u32) {
        let Some(mut connection) = self.connections.remove(&key) else {
            debug!(peer = %key.0, ack, "ACK for unknown connection key");
            return;
        };
        if connection.state == TcpState::SynReceived {
            connection.state = TcpState::Established;
            info!(peer = %key.0, port = key.1, "TCP connection established");
        }

        let mut retransmit = None;
        let mut to_send = Vec::new();
        if connection.last_ack == Some(ack) {
            connection.duplicate_ack_count += 1;
            if connection.duplicate_ack_count >= DUP_ACK_THRESHOLD {
                connection.duplicate_ack_count = 0;
                retransmit = connection.history.get(&ack).cloned();
                match &retransmit {
                    Some(_) => info!(peer = %key.0, seq = ack, "fast retransmit"),
                    None => debug!(peer = %key.0, seq = ack, "no history entry to retransmit"),
                }
            } else {
                to_send = connection.take_segments(ctx.now, key.0, 1);
            }
        } else {
            connection.duplicate_ack_count = 1;
            connection.last_ack = Some(ack);
            connection
                .history
                .retain(|&start, segment| start + segment.payload.len() as u32 > ack);
            to_send = connection.take_segments(ctx.now, key.0, 1);
        }

        let transfer_done = connection
            .traffic
            .is_some_and(|t| connection.pending.is_empty() || ctx.now >= t.end_time);
        if transfer_done
            && ack == connection.seq
            && to_send.is_empty()
            && retransmit.is_none()
        {
            let fin = connection.control(key.0, tcp_flags::FIN);
            info!(peer = %key.0, port = key.1, "transfer complete, sending FIN");
            self.send_transport(ctx, fin);
            return; // record dropped: connection is closed
        }

        self.connections.insert(key, connection);
        if let Some(segment) = retransmit {
            self.send_transport(ctx, segment);
        }
        for segment in to_send {
            self.send_transport(ctx, segment);
        }
    }

    /// Receiver side: buffer out-of-order data, advance the cumulative ACK
    /// over everything contiguous, acknowledge every segment.
    fn on_data(
        &mut self,
        ctx: &mut Ctx<'_>,
        key: (Ipv4Addr, u16),
        seq: u32,
        len: u32,
        packet: &Packet,
    ) {
        let Some(mut connection) = self.connections.remove(&key) else {
            debug!(peer = %key.0, seq, "data for unknown connection key");
            return;
        };
        if seq >= connection.ack && len > 0 {
            connection.reorder.insert(seq, len as usize);
        }
        while let Some(advance) = connection.reorder.remove(&connection.ack) {
            connection.ack += advance as u32;
        }
        let ack = connection.control(key.0, tcp_flags::ACK);
        self.connections.insert(key, connection);
        self.send_transport(ctx, ack);
        self.process_datagram(ctx, packet);
    }

    fn on_fin(&mut self, key: (Ipv4Addr, u16)) {
        match self.connections.remove(&key) {
            Some(_) => info!(peer = %key.0, port = key.1, "TCP connection terminated"),
            None => debug!(peer = %key.0, "FIN for unknown connection key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> TcpConnection {
        TcpConnection {
            state: TcpState::Established,
            seq: 100,
            ack: 1,
            last_ack: None,
            duplicate_ack_count: 0,
            pending: vec![b'X'; 30],
            history: BTreeMap::new(),
            reorder: BTreeMap::new(),
            traffic: Some(TcpTrafficInfo {
                end_time: 10.0,
                payload_size: 10,
            }),
            src_port: 1,
            dst_port: 2,
        }
    }

    #[test]
    fn take_segments_advances_seq_and_records_history() {
        let mut c = connection();
        let peer: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let segments = c.take_segments(0.0, peer, 2);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].seq, 100);
        assert_eq!(segments[1].seq, 110);
        assert_eq!(c.seq, 120);
        assert_eq!(c.pending.len(), 10);
        assert!(c.history.contains_key(&100));
        assert!(c.history.contains_key(&110));
    }

    #[test]
    fn take_segments_respects_end_time() {
        let mut c = connection();
        let peer: Ipv4Addr = "10.0.0.2".parse().unwrap();
        assert!(c.take_segments(10.0, peer, 4).is_empty());
        assert_eq!(c.pending.len(), 30);
    }

    #[test]
    fn take_segments_drains_short_tail() {
        let mut c = connection();
        c.pending = vec![b'X'; 14];
        let peer: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let segments = c.take_segments(0.0, peer, 4);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].payload.len(), 4);
        assert_eq!(c.seq, 114);
    }

    #[test]
    fn passive_side_has_no_segments_to_send() {
        let mut c = connection();
        c.traffic = None;
        let peer: Ipv4Addr = "10.0.0.2".parse().unwrap();
        assert!(c.take_segments(0.0, peer, 4).is_empty());
    }
}
