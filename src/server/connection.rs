//! Client connection task
//!
//! Each accepted socket gets one task that owns its crypt layer, framer and
//! dispatcher. Messages relayed from other connections arrive through the
//! session outbox and are written from the same task, so the RC4 send
//! stream is only ever advanced in one place.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::crypto::{CryptState, TcpCrypt};
use crate::error::Ed2kError;
use crate::protocol::{normalize, Message, MessageFramer};
use crate::server::context::ServerContext;
use crate::server::dispatcher::ProtocolDispatcher;
use crate::session::{ConnectionSlot, SessionHandle};

const READ_BUFFER_SIZE: usize = 16 * 1024;

enum Event {
    Read(std::io::Result<usize>),
    Outbound(Message),
    HandshakeExpired,
}

/// One client connection
pub struct ClientConnection {
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    crypt: TcpCrypt,
    framer: MessageFramer,
    dispatcher: ProtocolDispatcher,
    outbox: mpsc::Receiver<Message>,
    _slot: ConnectionSlot,
}

impl ClientConnection {
    /// Wrap an accepted socket. `obfuscated` selects a responder crypt layer
    /// that accepts both handshakes and cleartext. The slot keeps the
    /// connection counted until the task ends.
    pub fn new(ctx: Arc<ServerContext>, stream: TcpStream, obfuscated: bool, slot: ConnectionSlot) -> Result<Self> {
        let peer = stream.peer_addr().map_err(|e| {
            error!("Failed to get peer address from socket: {}", e);
            Ed2kError::network_error_full("Failed to get peer address", "unknown", e.to_string())
        })?;

        let crypt = if obfuscated {
            TcpCrypt::responder(ctx.handshake.clone(), ctx.handshake_timeout).with_peer(peer.to_string())
        } else {
            TcpCrypt::disabled().with_peer(peer.to_string())
        };

        let (handle, outbox) = SessionHandle::new(peer);
        let dispatcher = ProtocolDispatcher::new(ctx.clone(), handle);

        Ok(Self {
            ctx,
            stream,
            peer,
            crypt,
            framer: MessageFramer::new(),
            dispatcher,
            outbox,
            _slot: slot,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Serve until the peer disconnects or an error ends the connection.
    /// The session is torn down either way.
    pub async fn run(mut self) -> Result<()> {
        info!("Connection from {} (open: {})", self.peer, self.ctx.registry.connection_count());

        let result = self.serve().await;

        self.dispatcher.close().await;
        match &result {
            Ok(()) => info!("Connection {} closed", self.peer),
            Err(e) => warn!("Connection {} closed: {}", self.peer, e),
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let negotiating = self.crypt.state() == CryptState::Negotiating;
            let deadline = self
                .crypt
                .deadline()
                .map(Instant::from_std)
                .unwrap_or_else(Instant::now);

            let event = tokio::select! {
                read = self.stream.read(&mut buf) => Event::Read(read),
                Some(message) = self.outbox.recv() => Event::Outbound(message),
                _ = sleep_until(deadline), if negotiating => Event::HandshakeExpired,
            };

            match event {
                Event::Read(read) => {
                    let n = read.map_err(|e| {
                        Ed2kError::network_error_full("Read failed", self.peer.to_string(), e.to_string())
                    })?;
                    if n == 0 {
                        debug!("Peer {} disconnected", self.peer);
                        return Ok(());
                    }
                    trace!("Read {} bytes from {}", n, self.peer);
                    if !self.on_data(&buf[..n]).await? {
                        return Ok(());
                    }
                }
                Event::Outbound(message) => {
                    debug!("{} > {}", message.name(), self.peer);
                    self.send(&message).await?;
                }
                Event::HandshakeExpired => {
                    return Err(Ed2kError::handshake_error_with_peer("Handshake timed out", self.peer.to_string()).into());
                }
            }
        }
    }

    /// Returns false when the connection should close
    async fn on_data(&mut self, data: &[u8]) -> Result<bool> {
        let processed = self.crypt.process(data)?;
        if let Some(reply) = processed.reply {
            self.stream.write_all(&reply).await?;
        }
        if processed.plaintext.is_empty() {
            return Ok(true);
        }

        for message in self.framer.feed(&processed.plaintext) {
            let Some(message) = normalize(message) else {
                continue;
            };
            match self.dispatcher.dispatch(&message).await {
                Ok(outcome) => {
                    for reply in &outcome.replies {
                        self.send(reply).await?;
                    }
                    if outcome.close {
                        debug!("Closing {} after {}", self.peer, message.name());
                        return Ok(false);
                    }
                }
                Err(e) => match e.downcast_ref::<Ed2kError>() {
                    Some(err) if err.closes_connection() => return Err(e),
                    _ => warn!("Dropping {} from {}: {}", message.name(), self.peer, e),
                },
            }
        }
        Ok(true)
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = self.crypt.encrypt(&message.serialize())?;
        self.stream.write_all(&bytes).await.map_err(|e| {
            Ed2kError::network_error_full("Write failed", self.peer.to_string(), e.to_string())
        })?;
        Ok(())
    }
}
