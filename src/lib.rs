//! ed2k-server
//!
//! An eD2K server: client logins with HighID/LowID assignment, file
//! offers, source lookup, search, callback relay and UDP queries, with
//! optional RC4 protocol obfuscation on both transports.

pub mod cli;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use error::Ed2kError;

pub use cli::{CliArgs, Config, HandshakeKind};
pub use crypto::{HandshakeStrategy, TcpCrypt, UdpKeyspace, UdpObfuscation};
pub use protocol::{ClientRequest, Message, MessageFramer, ServerMessage, UdpRequest, UdpResponse};
pub use server::{
    ClientConnection, Directory, MemoryDirectory, ProtocolDispatcher, ServerContext, ServerInfo, TcpService,
    UdpService,
};
pub use session::{ClientSession, LowIdPool, ReachabilityProbe, SessionRegistry, TcpReachabilityProbe};
