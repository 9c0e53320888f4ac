//! Client sessions
//!
//! Per-login state, the LowID registry and the firewall probe.

pub mod probe;
pub mod registry;
pub mod state;

pub use probe::{ProbeIdentity, ReachabilityProbe, StaticProbe, TcpReachabilityProbe};
pub use registry::{ConnectionSlot, LowIdPool, SessionRegistry, LOW_ID_MAX};
pub use state::{is_low_id, pack_ipv4, unpack_ipv4, ClientSession, SessionHandle};
