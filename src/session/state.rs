//! Client session state
//!
//! Defines the per-login session record and the handle other tasks use to
//! push messages onto a connection.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::protocol::tags::{Attributes, TagValue};
use crate::protocol::{Endpoint, LoginRequest, Message};

/// Ids below this value are LowIDs
pub const LOW_ID_LIMIT: u32 = 0x0100_0000;

/// Default outbox depth per connection
pub const OUTBOX_CAPACITY: usize = 64;

/// Pack an IPv4 address the way ed2k puts it on the wire
pub fn pack_ipv4(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

pub fn unpack_ipv4(id: u32) -> Ipv4Addr {
    Ipv4Addr::from(id.to_le_bytes())
}

pub fn is_low_id(id: u32) -> bool {
    id < LOW_ID_LIMIT
}

/// A logged-in client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    pub hash: [u8; 16],
    /// HighID (packed IPv4) or LowID slot; 0 until assigned
    pub assigned_id: u32,
    /// Address the connection came from
    pub ip: Ipv4Addr,
    /// Listening port advertised at login
    pub port: u16,
    pub attributes: Attributes,
    /// Id returned by the directory on registration
    pub storage_id: Option<u64>,
}

impl ClientSession {
    /// Session from a login request. The id the client claims is ignored.
    pub fn from_login(login: &LoginRequest, ip: Ipv4Addr) -> Self {
        Self {
            hash: login.hash,
            assigned_id: 0,
            ip,
            port: login.port,
            attributes: login.attributes(),
            storage_id: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.attributes.get("name").and_then(TagValue::as_str)
    }

    pub fn is_low_id(&self) -> bool {
        is_low_id(self.assigned_id)
    }

    pub fn high_id(&self) -> u32 {
        pack_ipv4(self.ip)
    }

    /// Where other clients reach this one
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            ip: self.high_id(),
            port: self.port,
        }
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self {
            hash: [0; 16],
            assigned_id: 0,
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
            attributes: Attributes::new(),
            storage_id: None,
        }
    }
}

/// Sender side of a connection's outbox
#[derive(Debug, Clone)]
pub struct SessionHandle {
    peer: SocketAddr,
    tx: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub fn new(peer: SocketAddr) -> (Self, mpsc::Receiver<Message>) {
        Self::with_capacity(peer, OUTBOX_CAPACITY)
    }

    pub fn with_capacity(peer: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { peer, tx }, rx)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a message without waiting. Returns false when the outbox is
    /// full or the connection is gone.
    pub fn send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                trace!("Queued message for {}", self.peer);
                true
            }
            Err(mpsc::error::TrySendError::Full(message)) => {
                debug!("Outbox full for {}, dropping {}", self.peer, message.name());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbox closed for {}", self.peer);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{OP_CALLBACKFAILED, TAG_NAME};
    use crate::protocol::Tag;

    #[test]
    fn test_pack_ipv4_little_endian() {
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        assert_eq!(pack_ipv4(ip), 0x04030201);
        assert_eq!(unpack_ipv4(0x04030201), ip);
    }

    #[test]
    fn test_low_id_boundary() {
        assert!(is_low_id(1));
        assert!(is_low_id(0x00ff_ffff));
        assert!(!is_low_id(0x0100_0000));
    }

    #[test]
    fn test_session_from_login() {
        let login = LoginRequest {
            hash: [0; 16],
            client_id: 0x01020304,
            port: 5555,
            tags: vec![Tag::string(TAG_NAME, "test")],
        };
        let session = ClientSession::from_login(&login, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(session.port, 5555);
        assert_eq!(session.name(), Some("test"));
        assert_eq!(session.assigned_id, 0);
        assert_eq!(session.endpoint().ip, pack_ipv4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[tokio::test]
    async fn test_handle_send_and_close() {
        let (handle, mut rx) = SessionHandle::with_capacity("127.0.0.1:4662".parse().unwrap(), 1);
        assert!(handle.send(Message::ed2k(OP_CALLBACKFAILED, Vec::new())));
        // capacity 1, second message does not fit
        assert!(!handle.send(Message::ed2k(OP_CALLBACKFAILED, Vec::new())));
        assert_eq!(rx.recv().await.map(|m| m.opcode), Some(OP_CALLBACKFAILED));
        drop(rx);
        assert!(!handle.send(Message::ed2k(OP_CALLBACKFAILED, Vec::new())));
        assert!(handle.is_closed());
    }
}
