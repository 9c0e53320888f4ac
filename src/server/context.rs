//! Shared server state
//!
//! `ServerInfo` holds what the server tells clients about itself.
//! `ServerContext` bundles it with the directory, the session registry and
//! the reachability probe; one instance is shared by every listener.

use std::sync::Arc;
use std::time::Duration;

use crate::crypto::HandshakeStrategy;
use crate::protocol::constants::*;
use crate::protocol::ServerMessage;
use crate::server::directory::Directory;
use crate::session::{ReachabilityProbe, SessionRegistry};

/// Identity and advertised settings
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub description: String,
    pub dynamic_ip: String,
    pub hash: [u8; 16],
    /// Packed public IPv4, 0 when unknown
    pub ip: u32,
    pub tcp_port: u16,
    pub tcp_obfuscated_port: u16,
    pub udp_port: u16,
    pub udp_obfuscated_port: u16,
    pub obfuscation: bool,
    pub udp_server_key: u32,
    pub max_connections: u32,
    pub soft_file_limit: u32,
    pub hard_file_limit: u32,
    pub login_message: String,
    pub low_id_message: String,
    pub udp_get_sources: bool,
    pub udp_get_files: bool,
}

impl ServerInfo {
    /// Sent in ID_CHANGE
    pub fn tcp_flags(&self) -> u32 {
        let mut flags = FLAG_ZLIB | FLAG_NEWTAGS | FLAG_UNICODE | FLAG_LARGEFILES;
        if self.obfuscation {
            flags |= FLAG_SUPPORTCRYPT | FLAG_REQUESTCRYPT | FLAG_REQUIRECRYPT;
        }
        flags
    }

    /// Sent in GLOBSERVSTATRES
    pub fn udp_flags(&self) -> u32 {
        let mut flags = 0;
        if self.udp_get_sources {
            flags |= FLAG_UDP_EXTGETSOURCES | FLAG_UDP_EXTGETSOURCES2;
        }
        if self.udp_get_files {
            flags |= FLAG_UDP_EXTGETFILES;
        }
        if self.obfuscation {
            flags |= FLAG_UDP_OBFUSCATION | FLAG_TCP_OBFUSCATION;
        }
        flags
    }

    pub fn version_banner(&self) -> String {
        format!("server version {} ({})", SERVER_VERSION_STR, SERVER_NAME)
    }

    pub fn ident(&self) -> ServerMessage {
        ServerMessage::Ident {
            hash: self.hash,
            ip: self.ip,
            port: self.tcp_port,
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            description: String::new(),
            dynamic_ip: String::new(),
            hash: [0; 16],
            ip: 0,
            tcp_port: 4661,
            tcp_obfuscated_port: 4671,
            udp_port: 4665,
            udp_obfuscated_port: 4675,
            obfuscation: false,
            udp_server_key: 0x1234_5678,
            max_connections: 10_000,
            soft_file_limit: 10_000,
            hard_file_limit: 20_000,
            login_message: String::new(),
            low_id_message: String::new(),
            udp_get_sources: true,
            udp_get_files: true,
        }
    }
}

/// Everything a connection or datagram handler needs
pub struct ServerContext {
    pub info: ServerInfo,
    pub directory: Arc<dyn Directory>,
    pub registry: SessionRegistry,
    pub probe: Arc<dyn ReachabilityProbe>,
    /// Key agreement used on the obfuscated TCP port
    pub handshake: HandshakeStrategy,
    pub handshake_timeout: Duration,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("info", &self.info)
            .field("registry", &self.registry)
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_flags() {
        let mut info = ServerInfo::default();
        assert_eq!(info.tcp_flags(), 0x0119);
        info.obfuscation = true;
        assert_eq!(info.tcp_flags(), 0x0f19);
    }

    #[test]
    fn test_udp_flags() {
        let mut info = ServerInfo::default();
        assert_eq!(info.udp_flags(), 0x0023);
        info.udp_get_sources = false;
        info.obfuscation = true;
        assert_eq!(info.udp_flags(), 0x0602);
    }
}
