mod event;
mod flow;
mod manifest;
mod reassembly;
mod sequence;

pub use event::{AttackKind, Event, HijackAttack, InjectionAttack};
pub use flow::{FlowKey, TcpIpFlow};
pub use manifest::{
    IpHeader, PacketManifest, TcpHeader, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN, TCP_URG,
};
pub use reassembly::{DiscardSink, Reassembly, ReassemblySink, StreamCollector};
pub use sequence::Sequence;
