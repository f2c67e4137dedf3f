pub mod engine;
pub mod host;
pub mod link;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod switch;
pub mod tcp;
pub mod trace;

pub use engine::{DeviceKind, HostConfig, RouterConfig, SimConfig, Simulator, TrafficParams};
pub use link::Link;
pub use switch::PortState;
pub use trace::{FlowSummary, PacketRecord, PacketTrace, SimulationReport, TraceEvent};
