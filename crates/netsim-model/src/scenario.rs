use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::addr::MacAddr;

/// A declarative topology + traffic description, loaded from TOML by the
/// CLI and by tests. Field names follow the builder API one to one.
#[derive(Deserialize, Debug, Clone)]
pub struct Scenario {
    #[serde(default)]
    pub sim: SimSection,
    #[serde(default)]
    pub hosts: Vec<HostDecl>,
    #[serde(default)]
    pub switches: Vec<SwitchDecl>,
    #[serde(default)]
    pub routers: Vec<RouterDecl>,
    #[serde(default)]
    pub dns_servers: Vec<DnsServerDecl>,
    #[serde(default)]
    pub dhcp_servers: Vec<DhcpServerDecl>,
    #[serde(default)]
    pub links: Vec<LinkDecl>,
    #[serde(default)]
    pub dns_records: Vec<DnsRecordDecl>,
    #[serde(default)]
    pub host_dns_records: Vec<HostDnsRecordDecl>,
    #[serde(default)]
    pub traffic: Vec<TrafficDecl>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SimSection {
    #[serde(default)]
    pub seed: u64,
    /// Virtual end time in seconds. Required when routers are declared
    /// (their periodic hello/LSA tasks never drain the queue).
    pub until: Option<f64>,
}

impl Default for SimSection {
    fn default() -> Self {
        SimSection { seed: 0, until: None }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct HostDecl {
    pub id: String,
    pub ip: Ipv4Net,
    pub mac: Option<MacAddr>,
    pub dns_server: Option<Ipv4Addr>,
    pub mtu: Option<usize>,
    /// Name of a declared link to use as the default route.
    pub default_route: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SwitchDecl {
    pub id: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RouterDecl {
    pub id: String,
    pub ips: Vec<Ipv4Net>,
    pub hello_interval: Option<f64>,
    pub lsa_interval: Option<f64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DnsServerDecl {
    pub id: String,
    pub ip: Ipv4Net,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DhcpServerDecl {
    pub id: String,
    pub ip: Ipv4Net,
    pub pool: Ipv4Net,
    pub dns_server: Option<Ipv4Addr>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LinkDecl {
    /// Optional name so default routes can refer to this link.
    pub name: Option<String>,
    pub a: String,
    pub b: String,
    /// Bits per second.
    pub bandwidth: f64,
    /// Propagation delay in seconds.
    pub delay: f64,
    #[serde(default)]
    pub loss: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DnsRecordDecl {
    pub server: String,
    pub domain: String,
    pub ip: Ipv4Addr,
}

/// Pre-seeds a host's resolver cache, bypassing DNS for that domain.
#[derive(Deserialize, Debug, Clone)]
pub struct HostDnsRecordDecl {
    pub node: String,
    pub domain: String,
    pub ip: Ipv4Addr,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficDecl {
    Udp {
        node: String,
        url: String,
        bitrate: f64,
        start: f64,
        duration: f64,
        header_size: usize,
        payload_size: usize,
        #[serde(default = "default_burstiness")]
        burstiness: f64,
    },
    Tcp {
        node: String,
        url: String,
        bitrate: f64,
        start: f64,
        duration: f64,
        header_size: usize,
        payload_size: usize,
        #[serde(default = "default_burstiness")]
        burstiness: f64,
    },
}

fn default_burstiness() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_scenario() {
        let text = r#"
            [sim]
            seed = 42

            [[hosts]]
            id = "n1"
            ip = "192.168.1.1/24"

            [[hosts]]
            id = "n2"
            ip = "192.168.1.2/24"

            [[links]]
            a = "n1"
            b = "n2"
            bandwidth = 10_000_000.0
            delay = 0.01

            [[traffic]]
            type = "udp"
            node = "n1"
            url = "192.168.1.2"
            bitrate = 8224.0
            start = 1.0
            duration = 7.5
            header_size = 28
            payload_size = 1000
        "#;
        let sc: Scenario = toml::from_str(text).unwrap();
        assert_eq!(sc.sim.seed, 42);
        assert_eq!(sc.hosts.len(), 2);
        assert_eq!(sc.links.len(), 1);
        assert!(matches!(sc.traffic[0], TrafficDecl::Udp { .. }));
        match &sc.traffic[0] {
            TrafficDecl::Udp { burstiness, .. } => assert_eq!(*burstiness, 1.0),
            _ => unreachable!(),
        }
    }
}
