//! End-to-end scenarios driving full topologies through the public API.

use netsim_simulator::{
    HostConfig, PortState, RouterConfig, SimConfig, Simulator, TraceEvent, TrafficParams,
};

fn params(
    bitrate: f64,
    start: f64,
    duration: f64,
    header_size: usize,
    payload_size: usize,
) -> TrafficParams {
    TrafficParams {
        bitrate,
        start_time: start,
        duration,
        header_size,
        payload_size,
        burstiness: 1.0,
    }
}

/// Two hosts on one lossless link: every packet arrives, and per-packet
/// delay is exactly serialization + propagation.
#[test]
fn s1_two_hosts_lossless_udp() {
    let mut sim = Simulator::new(SimConfig { seed: 1 });
    sim.add_host("n1", "192.168.10.1/24", HostConfig::default()).unwrap();
    sim.add_host("n2", "192.168.10.2/24", HostConfig::default()).unwrap();
    sim.add_link("n1", "n2", 10_000_000.0, 0.01, 0.0).unwrap();
    // 1028-byte packets, one per second for 7.5 s starting at t=1.
    sim.start_udp_traffic("n1", "192.168.10.2", params(8224.0, 1.0, 7.5, 28, 1000))
        .unwrap();
    sim.run();

    let data: Vec<_> = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp")
        .collect();
    assert_eq!(data.len(), 8);
    let expected_delay = 1028.0 * 8.0 / 10_000_000.0 + 0.01;
    for record in &data {
        let arrival = record.arrival_time.expect("lossless link");
        let delay = arrival - record.creation_time;
        assert!(
            (delay - expected_delay).abs() < 1e-12,
            "delay {delay} != {expected_delay}"
        );
    }
    assert_eq!(sim.host_delivered("n2").unwrap().len(), 8);
}

/// Switched LAN: ARP broadcasts flood, learned unicast does not.
#[test]
fn s2_switch_learns_macs() {
    let mut sim = Simulator::new(SimConfig { seed: 2 });
    sim.add_host("a", "10.0.0.1/24", HostConfig::default()).unwrap();
    sim.add_host("b", "10.0.0.2/24", HostConfig::default()).unwrap();
    sim.add_host("c", "10.0.0.3/24", HostConfig::default()).unwrap();
    sim.add_switch("s1").unwrap();
    for host in ["a", "b", "c"] {
        sim.add_link(host, "s1", 10_000_000.0, 0.001, 0.0).unwrap();
    }
    // One packet each: a->b, then b->a, then c->a.
    sim.start_udp_traffic("a", "10.0.0.2", params(1024.0, 1.0, 0.5, 28, 100)).unwrap();
    sim.start_udp_traffic("b", "10.0.0.1", params(1024.0, 5.0, 0.5, 28, 100)).unwrap();
    sim.start_udp_traffic("c", "10.0.0.1", params(1024.0, 9.0, 0.5, 28, 100)).unwrap();
    sim.run();

    let mut data_count = 0;
    for record in sim.trace().records() {
        let broadcasts = record
            .events
            .iter()
            .filter(|e| e.event == TraceEvent::Broadcast && e.node_id == "s1")
            .count();
        match record.packet_type {
            "udp" => {
                data_count += 1;
                // Every data frame goes to a learned MAC: forwarded on one
                // port, never flooded.
                assert_eq!(broadcasts, 0, "data frame was flooded");
                assert!(
                    record
                        .events
                        .iter()
                        .any(|e| e.event == TraceEvent::Forwarded && e.node_id == "s1")
                );
                assert!(record.arrival_time.is_some());
            }
            "arp" if record.destination_mac.is_broadcast() => {
                // Requests hit both non-ingress ports.
                assert_eq!(broadcasts, 2, "ARP request should flood");
            }
            _ => {}
        }
    }
    assert_eq!(data_count, 3);
}

/// STP on a triangle of equal-bandwidth switches: the lowest-id switch
/// becomes root with all ports forwarding; the redundant link is blocked.
#[test]
fn s3_stp_triangle_converges_to_tree() {
    let mut sim = Simulator::new(SimConfig { seed: 3 });
    sim.add_switch("s1").unwrap();
    sim.add_switch("s2").unwrap();
    sim.add_switch("s3").unwrap();
    let _l12 = sim.add_link("s1", "s2", 1_000_000.0, 0.001, 0.0).unwrap();
    let _l13 = sim.add_link("s1", "s3", 1_000_000.0, 0.001, 0.0).unwrap();
    let l23 = sim.add_link("s2", "s3", 1_000_000.0, 0.001, 0.0).unwrap();
    sim.run();

    assert_eq!(sim.switch_is_root("s1"), Some(true));
    assert_eq!(sim.switch_is_root("s2"), Some(false));
    assert_eq!(sim.switch_is_root("s3"), Some(false));

    let all_forwarding = sim.switch_port_states("s1").unwrap();
    assert!(all_forwarding.iter().all(|&(_, s)| s == PortState::Forwarding));

    for name in ["s2", "s3"] {
        let states = sim.switch_port_states(name).unwrap();
        let blocking: Vec<_> = states
            .iter()
            .filter(|&&(_, s)| s == PortState::Blocking)
            .collect();
        assert_eq!(blocking.len(), 1, "{name} should block exactly one port");
        assert_eq!(blocking[0].0, l23, "{name} should block the redundant link");
    }
}

/// OSPF diamond: traffic prefers the higher-bandwidth branch, and
/// converges onto the other branch after the preferred link goes down.
#[test]
fn s4_ospf_diamond_reroutes() {
    let mut sim = Simulator::new(SimConfig { seed: 4 });
    sim.add_host("h1", "10.0.1.100/24", HostConfig::default()).unwrap();
    sim.add_host("h2", "10.0.2.100/24", HostConfig::default()).unwrap();
    sim.add_router(
        "r1",
        &["10.0.1.1/24", "10.0.13.1/24", "10.0.14.1/24"],
        RouterConfig::default(),
    )
    .unwrap();
    sim.add_router(
        "r2",
        &["10.0.2.1/24", "10.0.23.2/24", "10.0.24.2/24"],
        RouterConfig::default(),
    )
    .unwrap();
    sim.add_router("r3", &["10.0.13.3/24", "10.0.23.3/24"], RouterConfig::default())
        .unwrap();
    sim.add_router("r4", &["10.0.14.4/24", "10.0.24.4/24"], RouterConfig::default())
        .unwrap();

    sim.add_link("h1", "r1", 10_000_000.0, 0.001, 0.0).unwrap();
    sim.add_link("h2", "r2", 10_000_000.0, 0.001, 0.0).unwrap();
    let r1r3 = sim.add_link("r1", "r3", 200_000.0, 0.001, 0.0).unwrap();
    sim.add_link("r3", "r2", 200_000.0, 0.001, 0.0).unwrap();
    sim.add_link("r1", "r4", 100_000.0, 0.001, 0.0).unwrap();
    sim.add_link("r4", "r2", 100_000.0, 0.001, 0.0).unwrap();

    // One packet per second from t=6 until t=40.
    sim.start_udp_traffic("h1", "10.0.2.100", params(8224.0, 6.0, 34.0, 28, 1000))
        .unwrap();

    sim.run_until(20.0);
    let via_r3 = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp" && r.arrival_time.is_some())
        .filter(|r| r.events.iter().any(|e| e.node_id == "r3"))
        .count();
    assert!(via_r3 > 0, "initial path should cross r3");
    let via_r4 = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp")
        .filter(|r| r.events.iter().any(|e| e.node_id == "r4"))
        .count();
    assert_eq!(via_r4, 0, "nothing should cross r4 before the failure");

    // Take the preferred branch down; routes must converge onto r4 within
    // two LSA intervals.
    sim.set_link_active(r1r3, false);
    sim.run_until(45.0);

    let late_records: Vec<_> = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp" && r.creation_time > 35.0)
        .collect();
    assert!(!late_records.is_empty());
    for record in &late_records {
        assert!(
            record.events.iter().all(|e| e.node_id != "r3"),
            "post-failure packet still crossed r3"
        );
        assert!(
            record.events.iter().any(|e| e.node_id == "r4"),
            "post-failure packet should cross r4"
        );
        assert!(record.arrival_time.is_some());
    }
}

/// DHCP lease acquisition, DNS resolution, then UDP traffic to the
/// resolved address.
#[test]
fn s5_dhcp_then_dns_then_traffic() {
    let mut sim = Simulator::new(SimConfig { seed: 5 });
    // Network-form address: n1 must lease one over DHCP.
    sim.add_host("n1", "192.168.1.0/24", HostConfig::default()).unwrap();
    sim.add_host("n2", "192.168.1.10/24", HostConfig::default()).unwrap();
    sim.add_switch("s1").unwrap();
    sim.add_dhcp_server(
        "d1",
        "192.168.1.1/24",
        "192.168.1.0/24",
        Some("192.168.1.53".parse().unwrap()),
    )
    .unwrap();
    sim.add_dns_server("dns1", "192.168.1.53/24").unwrap();
    sim.add_dns_record("dns1", "server.example", "192.168.1.10".parse().unwrap())
        .unwrap();
    for node in ["n1", "n2", "d1", "dns1"] {
        sim.add_link(node, "s1", 10_000_000.0, 0.001, 0.0).unwrap();
    }
    sim.start_udp_traffic("n1", "server.example", params(8224.0, 1.5, 3.5, 28, 1000))
        .unwrap();

    sim.run_until(0.7);
    let leased = sim.host_ip("n1").unwrap();
    assert_eq!(leased, "192.168.1.2/24".parse().unwrap(), "lease by 0.7 s");

    sim.run();
    let first_data_creation = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp")
        .map(|r| r.creation_time)
        .fold(f64::INFINITY, f64::min);
    let dns_query_creation = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "dns" && r.destination_mac.is_broadcast())
        .map(|r| r.creation_time)
        .fold(f64::INFINITY, f64::min);
    assert!(dns_query_creation.is_finite(), "a DNS query must be sent");
    assert!(
        dns_query_creation < first_data_creation,
        "resolution precedes traffic"
    );
    assert!(!sim.host_delivered("n2").unwrap().is_empty());
}

/// TCP: handshake, one injected mid-stream loss, duplicate-ACK fast
/// retransmit, FIN teardown.
#[test]
fn s6_tcp_fast_retransmit() {
    let mut sim = Simulator::new(SimConfig { seed: 6 });
    sim.add_host("a", "10.1.0.1/24", HostConfig::default()).unwrap();
    sim.add_host("b", "10.1.0.2/24", HostConfig::default()).unwrap();
    let link = sim.add_link("a", "b", 10_000_000.0, 0.005, 0.0).unwrap();
    // 5 MSS-sized segments: 58400 bps * 1 s / 8 = 7300 B = 5 * 1460.
    sim.start_tcp_traffic("a", "10.1.0.2", params(58_400.0, 0.5, 1.0, 40, 1460))
        .unwrap();
    // Lose the second data segment in flight.
    sim.inject_data_drop(link, 2);
    sim.run();

    let segments: Vec<_> = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "tcp" && r.size == 1500)
        .collect();
    assert_eq!(segments.len(), 6, "5 segments + 1 fast retransmit");
    assert_eq!(
        segments
            .iter()
            .filter(|r| r.events.iter().any(|e| e.event == TraceEvent::Lost))
            .count(),
        1
    );

    let received: usize = sim.host_delivered("b").unwrap().iter().map(Vec::len).sum();
    assert_eq!(received, 7300, "every payload byte reaches b exactly once");

    // FIN tore both records down.
    assert_eq!(sim.host_tcp_connection_count("a"), Some(0));
    assert_eq!(sim.host_tcp_connection_count("b"), Some(0));
}

/// The fraction of packets marked lost converges to the configured rate.
#[test]
fn loss_rate_converges() {
    let mut sim = Simulator::new(SimConfig { seed: 7 });
    sim.add_host("n1", "10.2.0.1/24", HostConfig::default()).unwrap();
    sim.add_host("n2", "10.2.0.2/24", HostConfig::default()).unwrap();
    sim.add_link("n1", "n2", 100_000_000.0, 0.001, 0.3).unwrap();
    // 2000 packets, 10 ms apart.
    sim.start_udp_traffic("n1", "10.2.0.2", params(822_400.0, 0.0, 20.0, 28, 1000))
        .unwrap();
    sim.run();

    let (mut total, mut lost) = (0usize, 0usize);
    for record in sim.trace().records().filter(|r| r.packet_type == "udp") {
        total += 1;
        if record.arrival_time.is_none() {
            lost += 1;
        }
    }
    assert_eq!(total, 2000);
    let ratio = lost as f64 / total as f64;
    assert!((ratio - 0.3).abs() < 0.05, "loss ratio {ratio} too far from 0.3");
}

/// A payload larger than the MTU is fragmented on the wire and reassembled
/// byte-for-byte at the destination.
#[test]
fn fragmentation_round_trip() {
    let mut sim = Simulator::new(SimConfig { seed: 8 });
    sim.add_host("n1", "10.3.0.1/24", HostConfig::default()).unwrap();
    sim.add_host("n2", "10.3.0.2/24", HostConfig::default()).unwrap();
    sim.add_link("n1", "n2", 10_000_000.0, 0.001, 0.0).unwrap();
    // One 5000-byte datagram: UDP fragments of 1472 + 1472 + 1472 + 584.
    sim.start_udp_traffic("n1", "10.3.0.2", params(1024.0, 0.0, 0.5, 28, 5000))
        .unwrap();
    sim.run();

    let fragments = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp")
        .count();
    assert_eq!(fragments, 4);
    assert_eq!(
        sim.trace()
            .records()
            .flat_map(|r| r.events.iter())
            .filter(|e| e.event == TraceEvent::FragmentStored)
            .count(),
        3
    );
    let delivered = sim.host_delivered("n2").unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0], vec![b'X'; 5000]);
}

/// Losing a middle fragment makes reassembly fail with the incomplete-data
/// log, and nothing is delivered.
#[test]
fn fragment_loss_fails_reassembly() {
    let mut sim = Simulator::new(SimConfig { seed: 9 });
    sim.add_host("n1", "10.4.0.1/24", HostConfig::default()).unwrap();
    sim.add_host("n2", "10.4.0.2/24", HostConfig::default()).unwrap();
    let link = sim.add_link("n1", "n2", 10_000_000.0, 0.001, 0.0).unwrap();
    sim.start_udp_traffic("n1", "10.4.0.2", params(1024.0, 0.0, 0.5, 28, 5000))
        .unwrap();
    sim.inject_data_drop(link, 2);
    sim.run();

    assert!(
        sim.trace()
            .records()
            .flat_map(|r| r.events.iter())
            .any(|e| e.event == TraceEvent::ReassembleFailedIncompleteData)
    );
    assert!(sim.host_delivered("n2").unwrap().is_empty());
}

/// Two routers default-routing at each other cannot loop a packet forever:
/// the TTL burns down and the packet is dropped.
#[test]
fn ttl_kills_routing_loops() {
    let mut sim = Simulator::new(SimConfig { seed: 10 });
    sim.add_host("h1", "10.5.0.100/24", HostConfig::default()).unwrap();
    sim.add_router("r1", &["10.5.0.1/24", "10.5.12.1/24"], RouterConfig::default())
        .unwrap();
    sim.add_router("r2", &["10.5.12.2/24"], RouterConfig::default()).unwrap();
    sim.add_link("h1", "r1", 10_000_000.0, 0.001, 0.0).unwrap();
    let transit = sim.add_link("r1", "r2", 10_000_000.0, 0.001, 0.0).unwrap();
    sim.set_default_route("r1", transit).unwrap();
    sim.set_default_route("r2", transit).unwrap();
    // Destination no router owns: the default routes bounce it back and
    // forth until the TTL expires.
    sim.start_udp_traffic("h1", "203.0.113.5", params(8224.0, 1.0, 0.5, 28, 1000))
        .unwrap();
    sim.run_until(10.0);

    let expired: Vec<_> = sim
        .trace()
        .records()
        .filter(|r| r.events.iter().any(|e| e.event == TraceEvent::TtlExpired))
        .collect();
    assert_eq!(expired.len(), 1);
    // 64 TTL decrements means at most 64 router visits.
    let hops = expired[0]
        .events
        .iter()
        .filter(|e| e.event == TraceEvent::Received)
        .count();
    assert!(hops <= 64, "packet crossed {hops} routers");
}

/// A scenario file drives the same engine as the builder API.
#[test]
fn toml_scenario_runs() {
    let text = r#"
        [sim]
        seed = 11

        [[hosts]]
        id = "n1"
        ip = "192.168.77.1/24"

        [[hosts]]
        id = "n2"
        ip = "192.168.77.2/24"

        [[links]]
        a = "n1"
        b = "n2"
        bandwidth = 10_000_000.0
        delay = 0.01

        [[traffic]]
        type = "udp"
        node = "n1"
        url = "192.168.77.2"
        bitrate = 8224.0
        start = 1.0
        duration = 7.5
        header_size = 28
        payload_size = 1000
    "#;
    let scenario: netsim_model::Scenario = toml::from_str(text).unwrap();
    let mut sim = Simulator::from_scenario(&scenario).unwrap();
    sim.run();
    let arrived = sim
        .trace()
        .records()
        .filter(|r| r.packet_type == "udp" && r.arrival_time.is_some())
        .count();
    assert_eq!(arrived, 8);
}
