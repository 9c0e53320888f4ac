//! Reachability probe
//!
//! Decides HighID vs LowID by connecting back to the port a client
//! advertised at login.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, trace, warn};

use crate::crypto::{CryptState, HandshakeStrategy, TcpCrypt};
use crate::error::Ed2kError;
use crate::protocol::constants::{OP_HELLO, OP_HELLOANSWER, SERVER_VERSION_INT, TAG_NAME, TAG_VERSION};
use crate::protocol::tags::encode_tags;
use crate::protocol::{normalize, ByteCursor, Message, MessageFramer, Tag};

/// Can a client accept inbound connections?
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `hash` is the client's identity hash, used to key an obfuscated
    /// handshake
    async fn is_reachable(&self, ip: Ipv4Addr, port: u16, hash: [u8; 16]) -> bool;
}

/// How the server introduces itself in a plain HELLO
#[derive(Debug, Clone)]
pub struct ProbeIdentity {
    pub hash: [u8; 16],
    /// Packed server IPv4
    pub ip: u32,
    pub port: u16,
    pub name: String,
}

/// Outbound TCP connect, optionally obfuscated first
#[derive(Debug, Clone)]
pub struct TcpReachabilityProbe {
    identity: ProbeIdentity,
    timeout: Duration,
    obfuscation: bool,
}

impl TcpReachabilityProbe {
    pub fn new(identity: ProbeIdentity, timeout: Duration, obfuscation: bool) -> Self {
        Self {
            identity,
            timeout,
            obfuscation,
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| Ed2kError::network_error_full("Probe connection timeout", addr.to_string(), e.to_string()))?
            .map_err(|e| Ed2kError::network_error_full("Probe connection failed", addr.to_string(), e.to_string()))?;
        trace!("Probe connected to {}", addr);
        Ok(stream)
    }

    /// Ok(false) when the peer never completed the handshake in time or
    /// answered with garbage; the plain HELLO is worth a try then.
    async fn try_obfuscated(&self, addr: SocketAddr, hash: [u8; 16]) -> Result<bool> {
        let mut stream = self.connect(addr).await?;
        let mut crypt =
            TcpCrypt::initiator(HandshakeStrategy::SharedSecret { hash }, self.timeout).with_peer(addr.to_string());

        debug!("HANDSHAKE > {}", addr);
        stream.write_all(&crypt.start()?).await?;

        match timeout(self.timeout, finish_handshake(&mut stream, &mut crypt, addr)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => match e.downcast_ref::<Ed2kError>() {
                Some(Ed2kError::HandshakeError { .. }) => {
                    debug!("Bad handshake answer from {}: {}", addr, e);
                    Ok(false)
                }
                _ => Err(e),
            },
            Err(_) => {
                debug!("Handshake timeout from {}", addr);
                Ok(false)
            }
        }
    }

    fn hello(&self) -> Message {
        let id = &self.identity;
        let mut payload = ByteCursor::new();
        payload.write_u8(16).write_hash(&id.hash).write_u32(id.ip).write_u16(id.port);
        encode_tags(
            &mut payload,
            &[Tag::string(TAG_NAME, id.name.as_str()), Tag::uint32(TAG_VERSION, SERVER_VERSION_INT)],
        );
        payload.write_u32(id.ip).write_u16(id.port);
        Message::ed2k(OP_HELLO, payload.into_written())
    }

    async fn try_plain(&self, addr: SocketAddr) -> Result<bool> {
        let mut stream = self.connect(addr).await?;
        debug!("HELLO > {}", addr);
        stream.write_all(&self.hello().serialize()).await?;

        match timeout(self.timeout, await_hello_answer(&mut stream, addr)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("No HELLOANSWER from {}", addr);
                Ok(false)
            }
        }
    }
}

async fn finish_handshake(stream: &mut TcpStream, crypt: &mut TcpCrypt, addr: SocketAddr) -> Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Ed2kError::network_error_with_address("Peer closed during handshake", addr.to_string()).into());
        }
        let processed = crypt.process(&buf[..n])?;
        if let Some(reply) = processed.reply {
            stream.write_all(&reply).await?;
        }
        if crypt.state() == CryptState::Encrypting {
            return Ok(());
        }
    }
}

async fn await_hello_answer(stream: &mut TcpStream, addr: SocketAddr) -> Result<bool> {
    let mut framer = MessageFramer::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        for message in framer.feed(&buf[..n]).into_iter().filter_map(normalize) {
            if message.opcode == OP_HELLOANSWER {
                debug!("HELLOANSWER < {}", addr);
                return Ok(true);
            }
            warn!("Unexpected {} from probed client {}", message.name(), addr);
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpReachabilityProbe {
    async fn is_reachable(&self, ip: Ipv4Addr, port: u16, hash: [u8; 16]) -> bool {
        let addr = SocketAddr::from((ip, port));
        info!("Checking if {} is firewalled", addr);

        if self.obfuscation {
            match self.try_obfuscated(addr, hash).await {
                Ok(true) => return true,
                Ok(false) => debug!("Retrying {} without obfuscation", addr),
                Err(e) => {
                    debug!("Probe of {} failed: {}", addr, e);
                    return false;
                }
            }
        }

        match self.try_plain(addr).await {
            Ok(reachable) => reachable,
            Err(e) => {
                debug!("Probe of {} failed: {}", addr, e);
                false
            }
        }
    }
}

/// Probe with a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn is_reachable(&self, _ip: Ipv4Addr, _port: u16, _hash: [u8; 16]) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const CLIENT_HASH: [u8; 16] = [0x42; 16];

    fn probe(obfuscation: bool) -> TcpReachabilityProbe {
        let identity = ProbeIdentity {
            hash: [1; 16],
            ip: 0x0100007f,
            port: 4661,
            name: "test server".to_string(),
        };
        TcpReachabilityProbe::new(identity, Duration::from_millis(300), obfuscation)
    }

    fn hello_answer() -> Vec<u8> {
        let mut payload = ByteCursor::new();
        payload.write_hash(&CLIENT_HASH).write_u32(0).write_u16(4662).write_u32(0);
        payload.write_u32(0).write_u16(0);
        Message::ed2k(OP_HELLOANSWER, payload.into_written()).serialize()
    }

    /// Plain client: waits for HELLO, answers
    async fn answer_hello(listener: &TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut framer = MessageFramer::new();
        let mut buf = [0u8; 512];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
            if let Some(message) = framer.feed(&buf[..n]).into_iter().next() {
                assert_eq!(message.opcode, OP_HELLO);
                assert_eq!(message.payload_bytes()[0], 16);
                break;
            }
        }
        socket.write_all(&hello_answer()).await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_hello_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { answer_hello(&listener).await });

        assert!(probe(false).is_reachable(Ipv4Addr::LOCALHOST, port, CLIENT_HASH).await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_port_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!probe(true).is_reachable(Ipv4Addr::LOCALHOST, port, CLIENT_HASH).await);
    }

    #[tokio::test]
    async fn test_obfuscated_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut crypt = TcpCrypt::responder(
                HandshakeStrategy::SharedSecret { hash: CLIENT_HASH },
                Duration::from_secs(1),
            );
            let mut buf = [0u8; 512];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                let processed = crypt.process(&buf[..n]).unwrap();
                if let Some(reply) = processed.reply {
                    socket.write_all(&reply).await.unwrap();
                }
            }
            crypt.state()
        });

        assert!(probe(true).is_reachable(Ipv4Addr::LOCALHOST, port, CLIENT_HASH).await);
        assert_eq!(server.await.unwrap(), CryptState::Encrypting);
    }

    #[tokio::test]
    async fn test_silent_handshake_falls_back_to_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // first connection ignores the handshake
            let (silent, _) = listener.accept().await.unwrap();
            answer_hello(&listener).await;
            drop(silent);
        });

        assert!(probe(true).is_reachable(Ipv4Addr::LOCALHOST, port, CLIENT_HASH).await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_answer_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(600)).await;
            drop(socket);
        });

        assert!(!probe(false).is_reachable(Ipv4Addr::LOCALHOST, port, CLIENT_HASH).await);
        server.await.unwrap();
    }
}
