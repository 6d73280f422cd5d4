//! Network-facing side of the gateway: listener, per-connection framer,
//! device identification and the UDP ingest path.

mod framer;
mod identity;
mod listener;
mod udp;

pub use framer::{ConnectionFramer, FramerState};
pub use identity::{IdentityTable, normalize_remote};
pub use listener::Gateway;
pub use udp::UdpIngest;
