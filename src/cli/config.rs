//! Server configuration
//!
//! Loaded from an optional JSON file, then overridden by CLI flags.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cli::args::CliArgs;
use crate::crypto::{md5_digest, HandshakeStrategy};
use crate::error::Ed2kError;
use crate::protocol::constants::SERVER_VERSION_STR;
use crate::protocol::Endpoint;
use crate::server::ServerInfo;
use crate::session::{pack_ipv4, LowIdPool, ProbeIdentity, LOW_ID_MAX};

/// Key agreement accepted on the obfuscated TCP port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeKind {
    #[serde(rename = "dh")]
    #[value(name = "dh")]
    DiffieHellman,
    SharedSecret,
}

/// Configuration for the ed2k server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub description: String,
    /// Dynamic DNS name, sent in SERVERDESCRES
    pub dynamic_ip: String,
    pub bind_address: Ipv4Addr,
    /// Advertised address; unknown when absent
    pub public_ip: Option<Ipv4Addr>,
    pub tcp_port: u16,
    pub tcp_obfuscated_port: u16,
    pub udp_port: u16,
    pub udp_obfuscated_port: u16,
    pub max_connections: u32,
    pub obfuscation: bool,
    pub handshake: HandshakeKind,
    /// Handshake and reachability probe timeout
    pub timeout_ms: u64,
    pub allow_low_ids: bool,
    pub low_id_min: u32,
    pub low_id_max: u32,
    pub udp_server_key: u32,
    pub login_message: String,
    pub low_id_message: String,
    pub udp_get_sources: bool,
    pub udp_get_files: bool,
    pub soft_file_limit: u32,
    pub hard_file_limit: u32,
    /// Other servers, as "ip:port"
    pub servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "ed2k-server".to_string(),
            description: "eD2K server".to_string(),
            dynamic_ip: String::new(),
            bind_address: Ipv4Addr::UNSPECIFIED,
            public_ip: None,
            tcp_port: 4661,
            tcp_obfuscated_port: 4671,
            udp_port: 4665,
            udp_obfuscated_port: 4675,
            max_connections: 10_000,
            obfuscation: true,
            handshake: HandshakeKind::DiffieHellman,
            timeout_ms: 2000,
            allow_low_ids: true,
            low_id_min: 1,
            low_id_max: LOW_ID_MAX,
            udp_server_key: 0x1234_5678,
            login_message: "Welcome!".to_string(),
            low_id_message: "You have LowID.".to_string(),
            udp_get_sources: true,
            udp_get_files: true,
            soft_file_limit: 10_000,
            hard_file_limit: 20_000,
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading config file: {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            Ed2kError::config_error_with_field(format!("Invalid config file: {}", e), path.display().to_string())
        })?;
        Ok(config)
    }

    /// File values (or defaults) with CLI flags applied on top
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        debug!("Effective config: {:?}", config);
        Ok(config)
    }

    fn apply_args(&mut self, args: &CliArgs) {
        if let Some(name) = &args.name {
            self.name = name.clone();
        }
        if let Some(description) = &args.description {
            self.description = description.clone();
        }
        if let Some(bind) = args.bind {
            self.bind_address = bind;
        }
        if args.public_ip.is_some() {
            self.public_ip = args.public_ip;
        }
        if let Some(port) = args.tcp_port {
            self.tcp_port = port;
        }
        if let Some(port) = args.tcp_obfuscated_port {
            self.tcp_obfuscated_port = port;
        }
        if let Some(port) = args.udp_port {
            self.udp_port = port;
        }
        if let Some(port) = args.udp_obfuscated_port {
            self.udp_obfuscated_port = port;
        }
        if let Some(max) = args.max_connections {
            self.max_connections = max;
        }
        if let Some(obfuscation) = args.obfuscation {
            self.obfuscation = obfuscation;
        }
        if let Some(handshake) = args.handshake {
            self.handshake = handshake;
        }
        if let Some(timeout) = args.timeout_ms {
            self.timeout_ms = timeout;
        }
        if let Some(allow) = args.allow_low_ids {
            self.allow_low_ids = allow;
        }
        if let Some(min) = args.low_id_min {
            self.low_id_min = min;
        }
        if let Some(max) = args.low_id_max {
            self.low_id_max = max;
        }
        if let Some(key) = args.udp_server_key {
            self.udp_server_key = key;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let ports = [
            ("tcp_port", self.tcp_port),
            ("tcp_obfuscated_port", self.tcp_obfuscated_port),
            ("udp_port", self.udp_port),
            ("udp_obfuscated_port", self.udp_obfuscated_port),
        ];
        for (field, port) in ports {
            if port == 0 {
                return Err(Ed2kError::config_error_with_field("Port cannot be 0", field).into());
            }
        }

        if self.max_connections == 0 {
            return Err(Ed2kError::config_error_with_field("max_connections must be at least 1", "max_connections").into());
        }

        if self.timeout_ms == 0 {
            return Err(Ed2kError::config_error_with_field("Timeout cannot be 0", "timeout_ms").into());
        }

        if self.low_id_min == 0 {
            return Err(Ed2kError::config_error_with_field("LowIDs start at 1", "low_id_min").into());
        }
        if self.low_id_max > LOW_ID_MAX {
            return Err(Ed2kError::config_error_with_field(
                format!("low_id_max must not exceed 0x{:x}", LOW_ID_MAX),
                "low_id_max",
            )
            .into());
        }
        if self.low_id_min > self.low_id_max {
            return Err(Ed2kError::config_error_with_field("low_id_min is above low_id_max", "low_id_min").into());
        }

        self.known_servers()?;
        Ok(())
    }

    /// MD5 of name, TCP port and version string
    pub fn server_hash(&self) -> [u8; 16] {
        md5_digest(format!("{}{}{}", self.name, self.tcp_port, SERVER_VERSION_STR).as_bytes())
    }

    pub fn packed_public_ip(&self) -> u32 {
        self.public_ip.map(pack_ipv4).unwrap_or(0)
    }

    pub fn known_servers(&self) -> Result<Vec<Endpoint>> {
        self.servers
            .iter()
            .map(|entry| {
                let addr: SocketAddrV4 = entry.parse().map_err(|_| {
                    Ed2kError::config_error_with_field(format!("Invalid server address '{}'", entry), "servers")
                })?;
                Ok(Endpoint {
                    ip: pack_ipv4(*addr.ip()),
                    port: addr.port(),
                })
            })
            .collect()
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            dynamic_ip: self.dynamic_ip.clone(),
            hash: self.server_hash(),
            ip: self.packed_public_ip(),
            tcp_port: self.tcp_port,
            tcp_obfuscated_port: self.tcp_obfuscated_port,
            udp_port: self.udp_port,
            udp_obfuscated_port: self.udp_obfuscated_port,
            obfuscation: self.obfuscation,
            udp_server_key: self.udp_server_key,
            max_connections: self.max_connections,
            soft_file_limit: self.soft_file_limit,
            hard_file_limit: self.hard_file_limit,
            login_message: self.login_message.clone(),
            low_id_message: self.low_id_message.clone(),
            udp_get_sources: self.udp_get_sources,
            udp_get_files: self.udp_get_files,
        }
    }

    /// Shared-secret handshakes are keyed by this server's hash
    pub fn handshake_strategy(&self) -> HandshakeStrategy {
        match self.handshake {
            HandshakeKind::DiffieHellman => HandshakeStrategy::DiffieHellman,
            HandshakeKind::SharedSecret => HandshakeStrategy::SharedSecret {
                hash: self.server_hash(),
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn low_id_pool(&self) -> LowIdPool {
        LowIdPool::new(self.low_id_min, self.low_id_max, self.allow_low_ids)
    }

    pub fn probe_identity(&self) -> ProbeIdentity {
        ProbeIdentity {
            hash: self.server_hash(),
            ip: self.packed_public_ip(),
            port: self.tcp_port,
            name: self.name.clone(),
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::from((self.bind_address, self.tcp_port))
    }

    pub fn tcp_obfuscated_addr(&self) -> SocketAddr {
        SocketAddr::from((self.bind_address, self.tcp_obfuscated_port))
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::from((self.bind_address, self.udp_port))
    }

    pub fn udp_obfuscated_addr(&self) -> SocketAddr {
        SocketAddr::from((self.bind_address, self.udp_obfuscated_port))
    }
}
