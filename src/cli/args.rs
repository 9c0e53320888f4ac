//! CLI arguments module
//!
//! Defines command-line argument parsing using clap. Every server setting is
//! optional here so that a flag only overrides the config file when given.

use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::cli::config::HandshakeKind;

/// CLI arguments for the ed2k server
#[derive(Debug, Default, Parser)]
#[command(name = "ed2k-server")]
#[command(about = "An eD2K server with protocol obfuscation", long_about = None)]
pub struct CliArgs {
    /// JSON config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Server name shown to clients
    #[arg(long)]
    pub name: Option<String>,

    /// Server description
    #[arg(long)]
    pub description: Option<String>,

    /// Address to bind all listeners on
    #[arg(short, long, value_name = "IP")]
    pub bind: Option<Ipv4Addr>,

    /// Public address advertised in SERVER_IDENT
    #[arg(long, value_name = "IP")]
    pub public_ip: Option<Ipv4Addr>,

    /// TCP port
    #[arg(short = 'p', long)]
    pub tcp_port: Option<u16>,

    /// TCP port for obfuscated connections
    #[arg(long)]
    pub tcp_obfuscated_port: Option<u16>,

    /// UDP port
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// UDP port for obfuscated datagrams
    #[arg(long)]
    pub udp_obfuscated_port: Option<u16>,

    /// Maximum number of client connections
    #[arg(short, long)]
    pub max_connections: Option<u32>,

    /// Enable protocol obfuscation (true/false)
    #[arg(long, value_name = "BOOL")]
    pub obfuscation: Option<bool>,

    /// Key agreement on the obfuscated TCP port
    #[arg(long, value_enum)]
    pub handshake: Option<HandshakeKind>,

    /// Handshake and reachability timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Hand out LowIDs to unreachable clients (true/false)
    #[arg(long, value_name = "BOOL")]
    pub allow_low_ids: Option<bool>,

    /// Smallest LowID handed out
    #[arg(long)]
    pub low_id_min: Option<u32>,

    /// Largest LowID handed out
    #[arg(long)]
    pub low_id_max: Option<u32>,

    /// UDP obfuscation server key
    #[arg(long)]
    pub udp_server_key: Option<u32>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
