use ipnet::Ipv4Net;
use thiserror::Error;

/// Configuration faults raised while a topology is being built. These abort
/// simulator construction; runtime faults never surface here, they are
/// logged into the packet trace instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MAC address `{0}`")]
    InvalidMac(String),

    #[error("invalid CIDR address `{0}`")]
    InvalidCidr(String),

    #[error("link endpoints `{a}` and `{b}` share no compatible subnet")]
    NoCompatibleSubnet { a: String, b: String },

    #[error("DHCP pool `{0}` is not a network address")]
    PoolNotNetworkAddress(Ipv4Net),

    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),

    #[error("unknown node `{0}`")]
    UnknownNode(String),

    #[error("unknown link `{0}`")]
    UnknownLink(String),

    #[error("node `{0}` cannot terminate this operation (wrong device kind)")]
    WrongDeviceKind(String),
}
