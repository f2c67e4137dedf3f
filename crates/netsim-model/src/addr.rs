use std::fmt;
use std::str::FromStr;

use ipnet::Ipv4Net;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Six-octet link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    /// All-zero source used by BPDUs.
    pub const ZERO: MacAddr = MacAddr([0x00; 6]);

    pub fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    /// Generate a random unicast, locally-administered address.
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut octets: [u8; 6] = rng.random();
        octets[0] = (octets[0] | 0x02) & !0x01;
        MacAddr(octets)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ConfigError;

    /// Accepts six hex octets separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else {
            s.split('-').collect()
        };
        if parts.len() != 6 {
            return Err(ConfigError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(ConfigError::InvalidMac(s.to_string()));
            }
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::InvalidMac(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Whether two CIDR interface addresses sit on the same network. Both sides
/// are truncated with their own prefix, so `10.0.0.1/24` and `10.0.0.7/24`
/// match while `10.0.0.1/24` and `10.0.1.1/24` do not.
pub fn same_network(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.trunc() == b.trunc()
}

/// Whether two networks overlap at all (used for the "directly connected"
/// routing-table decision).
pub fn nets_overlap(a: Ipv4Net, b: Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// A CIDR address in "network form": host bits all zero. Hosts constructed
/// this way have no usable address yet and go through DHCP.
pub fn is_network_address(net: Ipv4Net) -> bool {
    net.addr() == net.network()
}
