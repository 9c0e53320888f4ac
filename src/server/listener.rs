//! TCP accept loop
//!
//! One listener per port. The obfuscated port hands every socket a responder
//! crypt layer; the plain port does not.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Ed2kError;
use crate::server::connection::ClientConnection;
use crate::server::context::ServerContext;

pub struct TcpService {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    obfuscated: bool,
}

impl TcpService {
    pub async fn bind(ctx: Arc<ServerContext>, addr: SocketAddr, obfuscated: bool) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Ed2kError::network_error_full("Failed to bind TCP listener", addr.to_string(), e.to_string()))?;
        info!(
            "TCP listening on {}{}",
            addr,
            if obfuscated { " (obfuscated)" } else { "" }
        );
        Ok(Self {
            ctx,
            listener,
            obfuscated,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept forever. Accept errors are logged and the loop continues.
    pub async fn run(self) -> Result<()> {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TCP accept error: {}", e);
                    continue;
                }
            };

            let limit = self.ctx.info.max_connections as usize;
            let Some(slot) = self.ctx.registry.try_open_connection(limit) else {
                warn!("Rejecting {}: {} connections open", peer, limit);
                drop(socket);
                continue;
            };

            let connection = match ClientConnection::new(self.ctx.clone(), socket, self.obfuscated, slot) {
                Ok(connection) => connection,
                Err(e) => {
                    error!("Failed to set up connection from {}: {}", peer, e);
                    continue;
                }
            };
            debug!("Accepted {}", peer);
            tokio::spawn(async move {
                let _ = connection.run().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HandshakeStrategy;
    use crate::protocol::constants::*;
    use crate::protocol::{ClientRequest, LoginRequest, Message, MessageFramer, Tag};
    use crate::server::context::ServerInfo;
    use crate::server::directory::MemoryDirectory;
    use crate::session::{LowIdPool, SessionRegistry, StaticProbe};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn context(max_connections: u32) -> Arc<ServerContext> {
        let info = ServerInfo {
            max_connections,
            ..ServerInfo::default()
        };
        Arc::new(ServerContext {
            info,
            directory: Arc::new(MemoryDirectory::new(Vec::new())),
            registry: SessionRegistry::new(LowIdPool::new(1, 100, true)),
            probe: Arc::new(StaticProbe(true)),
            handshake: HandshakeStrategy::DiffieHellman,
            handshake_timeout: Duration::from_millis(500),
        })
    }

    async fn login(stream: &mut TcpStream, hash: u8) -> Vec<Message> {
        let bytes = ClientRequest::Login(LoginRequest {
            hash: [hash; 16],
            client_id: 0,
            port: 4662,
            tags: vec![Tag::string(TAG_NAME, "peer")],
        })
        .encode()
        .unwrap()
        .serialize();
        stream.write_all(&bytes).await.unwrap();

        let mut framer = MessageFramer::new();
        let mut messages = Vec::new();
        let mut buf = [0u8; 4096];
        while messages.len() < 5 {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0);
            messages.extend(framer.feed(&buf[..n]));
        }
        messages
    }

    #[tokio::test]
    async fn test_accepts_several_clients() {
        let ctx = context(10);
        let service = TcpService::bind(ctx.clone(), "127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        tokio::spawn(service.run());

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        let first = login(&mut a, 1).await;
        let second = login(&mut b, 2).await;
        assert_eq!(first.last().unwrap().opcode, OP_SERVERIDENT);
        assert_eq!(second.last().unwrap().opcode, OP_SERVERIDENT);
        assert_eq!(ctx.directory.client_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejects_over_connection_limit() {
        let ctx = context(1);
        let service = TcpService::bind(ctx.clone(), "127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        tokio::spawn(service.run());

        let mut first = TcpStream::connect(addr).await.unwrap();
        login(&mut first, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
        assert_eq!(ctx.registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_burst_stays_within_limit() {
        let ctx = context(2);
        let service = TcpService::bind(ctx.clone(), "127.0.0.1:0".parse().unwrap(), false)
            .await
            .unwrap();
        let addr = service.local_addr().unwrap();
        tokio::spawn(service.run());

        let mut clients = Vec::new();
        for _ in 0..6 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.registry.connection_count(), 2);

        let mut closed = 0;
        for client in &mut clients {
            let mut buf = [0u8; 16];
            if let Ok(Ok(0)) = tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await {
                closed += 1;
            }
        }
        assert_eq!(closed, 4);
    }
}
