//! Error types for the ed2k server
//!
//! This module defines the error taxonomy shared by the wire layer, the
//! obfuscation layer and the session/directory plumbing.

use std::fmt;

/// Comprehensive error type for ed2k server operations
#[derive(Debug, Clone)]
pub enum Ed2kError {
    /// Stream framing errors (bad protocol byte, malformed length)
    FramingError {
        message: String,
        source: Option<String>,
    },

    /// Obfuscation handshake errors (sync mismatch, unsupported method, timeout)
    HandshakeError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Tag list decoding errors (unknown value type, unsupported tag layout)
    TagDecodeError {
        message: String,
        source: Option<String>,
    },

    /// ed2k message content errors (truncated payload, bad search tree)
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// The external directory could not serve a request
    DirectoryUnavailable {
        message: String,
        source: Option<String>,
    },

    /// A bounded resource (LowID pool) has no free slot
    ResourceExhausted {
        message: String,
        resource: String,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },
}

impl Ed2kError {
    /// Create a new FramingError
    pub fn framing_error(message: impl Into<String>) -> Self {
        Ed2kError::FramingError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new FramingError with source
    pub fn framing_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Ed2kError::FramingError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new HandshakeError
    pub fn handshake_error(message: impl Into<String>) -> Self {
        Ed2kError::HandshakeError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new HandshakeError with peer address
    pub fn handshake_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        Ed2kError::HandshakeError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new HandshakeError with peer and source
    pub fn handshake_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        Ed2kError::HandshakeError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TagDecodeError
    pub fn tag_decode_error(message: impl Into<String>) -> Self {
        Ed2kError::TagDecodeError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new TagDecodeError with source
    pub fn tag_decode_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Ed2kError::TagDecodeError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Ed2kError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Ed2kError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new DirectoryUnavailable error
    pub fn directory_unavailable(message: impl Into<String>) -> Self {
        Ed2kError::DirectoryUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new DirectoryUnavailable error with source
    pub fn directory_unavailable_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        Ed2kError::DirectoryUnavailable {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ResourceExhausted error
    pub fn resource_exhausted(message: impl Into<String>, resource: impl Into<String>) -> Self {
        Ed2kError::ResourceExhausted {
            message: message.into(),
            resource: resource.into(),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        Ed2kError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Ed2kError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        Ed2kError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        Ed2kError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        Ed2kError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Whether a connection hitting this error must be closed.
    ///
    /// Framing and tag errors only invalidate buffered data or a single
    /// message; everything that breaks the crypt stream or leaves a session
    /// half-registered ends the connection.
    pub fn closes_connection(&self) -> bool {
        match self {
            Ed2kError::FramingError { .. }
            | Ed2kError::TagDecodeError { .. }
            | Ed2kError::ProtocolError { .. }
            | Ed2kError::DirectoryUnavailable { .. } => false,
            Ed2kError::HandshakeError { .. }
            | Ed2kError::ResourceExhausted { .. }
            | Ed2kError::ConfigError { .. }
            | Ed2kError::NetworkError { .. } => true,
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            Ed2kError::FramingError { source, .. }
            | Ed2kError::HandshakeError { source, .. }
            | Ed2kError::TagDecodeError { source, .. }
            | Ed2kError::ProtocolError { source, .. }
            | Ed2kError::DirectoryUnavailable { source, .. }
            | Ed2kError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for Ed2kError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ed2kError::FramingError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Framing error: {} (source: {})", message, src)
                } else {
                    write!(f, "Framing error: {}", message)
                }
            }
            Ed2kError::HandshakeError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Handshake error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Handshake error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Handshake error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Handshake error: {}", message),
                }
            }
            Ed2kError::TagDecodeError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Tag decode error: {} (source: {})", message, src)
                } else {
                    write!(f, "Tag decode error: {}", message)
                }
            }
            Ed2kError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            Ed2kError::DirectoryUnavailable { message, source } => {
                if let Some(src) = source {
                    write!(f, "Directory unavailable: {} (source: {})", message, src)
                } else {
                    write!(f, "Directory unavailable: {}", message)
                }
            }
            Ed2kError::ResourceExhausted { message, resource } => {
                write!(f, "Resource exhausted: {} [{}]", message, resource)
            }
            Ed2kError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            Ed2kError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
        }
    }
}

impl std::error::Error for Ed2kError {}

impl From<std::io::Error> for Ed2kError {
    fn from(err: std::io::Error) -> Self {
        Ed2kError::network_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for Ed2kError {
    fn from(err: serde_json::Error) -> Self {
        Ed2kError::config_error(format!("Failed to parse JSON config: {}", err))
    }
}

impl From<std::net::AddrParseError> for Ed2kError {
    fn from(err: std::net::AddrParseError) -> Self {
        Ed2kError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Ed2kError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Ed2kError::network_error("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_error() {
        let err = Ed2kError::framing_error("Unknown protocol byte");
        assert_eq!(err.to_string(), "Framing error: Unknown protocol byte");
    }

    #[test]
    fn test_handshake_error_with_peer() {
        let err = Ed2kError::handshake_error_with_peer("Wrong sync value", "127.0.0.1:4662");
        assert!(err.to_string().contains("Handshake error"));
        assert!(err.to_string().contains("Wrong sync value"));
        assert!(err.to_string().contains("127.0.0.1:4662"));
    }

    #[test]
    fn test_resource_exhausted() {
        let err = Ed2kError::resource_exhausted("No free LowID", "lowid");
        assert_eq!(err.to_string(), "Resource exhausted: No free LowID [lowid]");
    }

    #[test]
    fn test_closes_connection_policy() {
        assert!(!Ed2kError::framing_error("x").closes_connection());
        assert!(!Ed2kError::tag_decode_error("x").closes_connection());
        assert!(!Ed2kError::directory_unavailable("x").closes_connection());
        assert!(Ed2kError::handshake_error("x").closes_connection());
        assert!(Ed2kError::resource_exhausted("x", "lowid").closes_connection());
    }

    #[test]
    fn test_with_context() {
        let err = Ed2kError::tag_decode_error("Unknown tag type").with_context("while reading OFFER_FILES");
        assert!(err.to_string().contains("while reading OFFER_FILES"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Ed2kError = io_err.into();
        assert!(matches!(err, Ed2kError::NetworkError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: Ed2kError = addr_err.into();
        assert!(matches!(err, Ed2kError::NetworkError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = Ed2kError::config_error_with_field("Invalid value", "lowid_max");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("lowid_max"));
    }
}
