//! Server module
//!
//! TCP and UDP services sharing one `ServerContext`.

pub mod connection;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod listener;
pub mod udp;

pub use connection::ClientConnection;
pub use context::{ServerContext, ServerInfo};
pub use directory::{Directory, MemoryDirectory, Source, MAX_SEARCH_RESULTS, MAX_SOURCES};
pub use dispatcher::{Outcome, ProtocolDispatcher};
pub use listener::TcpService;
pub use udp::UdpService;
