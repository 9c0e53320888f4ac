//! UDP service
//!
//! Answers global source, status, description and search queries from
//! clients and other servers. One task per bound socket; the obfuscated
//! socket shares the precomputed keyspace read-only.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::crypto::UdpObfuscation;
use crate::error::Ed2kError;
use crate::protocol::constants::SERVER_VERSION_INT;
use crate::protocol::{Endpoint, Message, Protocol, SearchExpr, ServerStatusReply, UdpRequest, UdpResponse};
use crate::server::context::ServerContext;

/// eMule never sends datagrams this large, anything longer is truncated
const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

pub struct UdpService {
    ctx: Arc<ServerContext>,
    socket: UdpSocket,
    obfuscation: Option<UdpObfuscation>,
}

impl UdpService {
    pub async fn bind(ctx: Arc<ServerContext>, addr: SocketAddr, obfuscation: Option<UdpObfuscation>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Ed2kError::network_error_full("Failed to bind UDP socket", addr.to_string(), e.to_string()))?;
        info!(
            "UDP listening on {}{}",
            addr,
            if obfuscation.is_some() { " (obfuscated)" } else { "" }
        );
        Ok(Self {
            ctx,
            socket,
            obfuscation,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop, runs until the socket fails
    pub async fn run(self) -> Result<()> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    continue;
                }
            };

            let replies = match self.handle_datagram(&buffer[..len], from).await {
                Ok(replies) => replies,
                Err(e) => {
                    debug!("Dropping datagram from {}: {}", from, e);
                    continue;
                }
            };
            for reply in replies {
                if let Err(e) = self.socket.send_to(&reply, from).await {
                    warn!("Failed to send datagram to {}: {}", from, e);
                }
            }
        }
    }

    /// Wire datagrams to send back for one received datagram
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Result<Vec<Vec<u8>>> {
        let (data, obfuscated) = match &self.obfuscation {
            Some(crypt) => {
                let payload = crypt.decrypt(datagram)?;
                (payload.data, payload.obfuscated)
            }
            None => (datagram.to_vec(), false),
        };

        let message = Message::parse_udp(&data)?;
        if message.protocol != Protocol::Ed2k {
            warn!("UDP: unsupported protocol {:?} from {}", message.protocol, from);
            return Ok(Vec::new());
        }

        let request = UdpRequest::decode(&message)?;
        debug!("{} < {}", message.name(), from);

        let responses = self.respond(request).await;
        Ok(responses
            .iter()
            .map(|response| {
                let message = response.to_message();
                debug!("{} > {}", message.name(), from);
                let bytes = message.serialize_udp();
                match (&self.obfuscation, obfuscated) {
                    (Some(crypt), true) => crypt.encrypt(&bytes),
                    _ => bytes,
                }
            })
            .collect())
    }

    async fn respond(&self, request: UdpRequest) -> Vec<UdpResponse> {
        match request {
            UdpRequest::GetSources(hashes) => {
                if !self.ctx.info.udp_get_sources {
                    trace!("UDP get sources disabled");
                    return Vec::new();
                }
                let files = hashes.into_iter().map(|hash| (hash, None)).collect();
                self.found_sources(files).await
            }
            UdpRequest::GetSourcesSized(files) => {
                let files = files.into_iter().map(|(hash, size)| (hash, Some(size))).collect();
                self.found_sources(files).await
            }
            UdpRequest::ServerStatus { challenge } => vec![self.status(challenge).await],
            UdpRequest::ServerDescription { challenge } => {
                let info = &self.ctx.info;
                let response = match challenge {
                    None => UdpResponse::DescriptionLegacy {
                        name: info.name.clone(),
                        description: info.description.clone(),
                    },
                    Some(challenge) => UdpResponse::Description {
                        challenge,
                        name: info.name.clone(),
                        description: info.description.clone(),
                        dynamic_ip: info.dynamic_ip.clone(),
                        version: SERVER_VERSION_INT,
                    },
                };
                vec![response]
            }
            UdpRequest::Search(expr) => self.search(&expr).await,
            UdpRequest::SearchExtended { tags, expr } => {
                trace!("GLOBSEARCHREQ3 with {} tags", tags.len());
                self.search(&expr).await
            }
            UdpRequest::Unknown(opcode) => {
                warn!("UDP: unknown operation code 0x{:02x}", opcode);
                Vec::new()
            }
        }
    }

    async fn found_sources(&self, files: Vec<([u8; 16], Option<u64>)>) -> Vec<UdpResponse> {
        let mut responses = Vec::new();
        for (hash, size) in files {
            match self.ctx.directory.get_sources(&hash, size).await {
                Ok(sources) if !sources.is_empty() => {
                    trace!("Got {} sources for {}", sources.len(), hex::encode(hash));
                    responses.push(UdpResponse::FoundSources {
                        hash,
                        sources: sources
                            .into_iter()
                            .map(|s| Endpoint {
                                ip: s.client_id,
                                port: s.port,
                            })
                            .collect(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!("Sources unavailable for {}: {}", hex::encode(hash), e),
            }
        }
        responses
    }

    async fn status(&self, challenge: u32) -> UdpResponse {
        let info = &self.ctx.info;
        let users = self.ctx.directory.client_count().await.unwrap_or(0);
        let files = self.ctx.directory.file_count().await.unwrap_or(0);
        UdpResponse::ServerStatus(ServerStatusReply {
            challenge,
            users,
            files,
            max_connections: info.max_connections,
            soft_file_limit: info.soft_file_limit,
            hard_file_limit: info.hard_file_limit,
            udp_flags: info.udp_flags(),
            low_id_users: self.ctx.registry.low_id_count().await as u32,
            udp_obfuscated_port: info.udp_obfuscated_port,
            tcp_obfuscated_port: info.tcp_obfuscated_port,
            udp_key: info.udp_server_key,
        })
    }

    async fn search(&self, expr: &SearchExpr) -> Vec<UdpResponse> {
        match self.ctx.directory.find(expr).await {
            Ok(hits) => hits.into_iter().map(UdpResponse::SearchResult).collect(),
            Err(e) => {
                warn!("UDP search failed: {}", e);
                Vec::new()
            }
        }
    }
}
