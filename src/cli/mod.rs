//! CLI module
//!
//! Command-line arguments and server configuration.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::{Config, HandshakeKind};
