//! UDP requests and responses
//!
//! Datagrams have no length field; one datagram carries exactly one message.

use anyhow::Result;
use tracing::warn;

use crate::protocol::constants::*;
use crate::protocol::cursor::ByteCursor;
use crate::protocol::file::SearchHit;
use crate::protocol::message::Message;
use crate::protocol::response::Endpoint;
use crate::protocol::search::SearchExpr;
use crate::protocol::tags::{decode_tags, encode_tags, Tag};

/// Decoded inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpRequest {
    /// GLOBGETSOURCES: hashes only, size unknown
    GetSources(Vec<[u8; 16]>),
    /// GLOBGETSOURCES2: hash + size pairs
    GetSourcesSized(Vec<([u8; 16], u64)>),
    ServerStatus {
        challenge: u32,
    },
    /// `None` selects the legacy reply layout
    ServerDescription {
        challenge: Option<u32>,
    },
    Search(SearchExpr),
    /// GLOBSEARCHREQ3 carries a tag list ahead of the tree
    SearchExtended {
        tags: Vec<Tag>,
        expr: SearchExpr,
    },
    Unknown(u8),
}

impl UdpRequest {
    pub fn decode(message: &Message) -> Result<Self> {
        let mut cursor = message.reader();
        let request = match message.opcode {
            OP_GLOBGETSOURCES => {
                let mut hashes = Vec::new();
                while cursor.remaining() >= 16 {
                    hashes.push(cursor.read_hash()?);
                }
                if cursor.remaining() > 0 {
                    warn!("GLOBGETSOURCES: {} bytes of excess data", cursor.remaining());
                }
                UdpRequest::GetSources(hashes)
            }
            OP_GLOBGETSOURCES2 => {
                let mut files = Vec::new();
                while cursor.remaining() >= 20 {
                    let hash = cursor.read_hash()?;
                    let mut size = cursor.read_u32()? as u64;
                    if size == 0 {
                        size = cursor.read_u64()?;
                    }
                    files.push((hash, size));
                }
                if cursor.remaining() > 0 {
                    warn!("GLOBGETSOURCES2: {} bytes of excess data", cursor.remaining());
                }
                UdpRequest::GetSourcesSized(files)
            }
            OP_GLOBSERVSTATREQ => UdpRequest::ServerStatus {
                challenge: cursor.read_u32()?,
            },
            OP_SERVERDESCREQ => {
                let challenge = if cursor.len() < 4 {
                    None
                } else {
                    Some(cursor.read_u32()?)
                };
                UdpRequest::ServerDescription { challenge }
            }
            OP_GLOBSEARCHREQ => UdpRequest::Search(SearchExpr::parse(&mut cursor)?),
            OP_GLOBSEARCHREQ3 => {
                let tags = decode_tags(&mut cursor)?;
                let expr = SearchExpr::parse(&mut cursor)?;
                UdpRequest::SearchExtended { tags, expr }
            }
            other => UdpRequest::Unknown(other),
        };
        Ok(request)
    }

    /// Encode as a client would send it
    pub fn to_message(&self) -> Option<Message> {
        let mut cursor = ByteCursor::new();
        let opcode = match self {
            UdpRequest::GetSources(hashes) => {
                for hash in hashes {
                    cursor.write_hash(hash);
                }
                OP_GLOBGETSOURCES
            }
            UdpRequest::GetSourcesSized(files) => {
                for (hash, size) in files {
                    cursor.write_hash(hash);
                    if *size > u32::MAX as u64 {
                        cursor.write_u32(0).write_u64(*size);
                    } else {
                        cursor.write_u32(*size as u32);
                    }
                }
                OP_GLOBGETSOURCES2
            }
            UdpRequest::ServerStatus { challenge } => {
                cursor.write_u32(*challenge);
                OP_GLOBSERVSTATREQ
            }
            UdpRequest::ServerDescription { challenge } => {
                if let Some(challenge) = challenge {
                    cursor.write_u32(*challenge);
                }
                OP_SERVERDESCREQ
            }
            UdpRequest::Search(expr) => {
                expr.encode(&mut cursor);
                OP_GLOBSEARCHREQ
            }
            UdpRequest::SearchExtended { tags, expr } => {
                encode_tags(&mut cursor, tags);
                expr.encode(&mut cursor);
                OP_GLOBSEARCHREQ3
            }
            UdpRequest::Unknown(_) => return None,
        };
        Some(Message::ed2k(opcode, cursor.into_written()))
    }
}

/// GLOBSERVSTATRES body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatusReply {
    pub challenge: u32,
    pub users: u32,
    pub files: u32,
    pub max_connections: u32,
    pub soft_file_limit: u32,
    pub hard_file_limit: u32,
    pub udp_flags: u32,
    pub low_id_users: u32,
    pub udp_obfuscated_port: u16,
    pub tcp_obfuscated_port: u16,
    pub udp_key: u32,
}

/// Outbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpResponse {
    FoundSources {
        hash: [u8; 16],
        sources: Vec<Endpoint>,
    },
    ServerStatus(ServerStatusReply),
    DescriptionLegacy {
        name: String,
        description: String,
    },
    Description {
        challenge: u32,
        name: String,
        description: String,
        dynamic_ip: String,
        version: u32,
    },
    SearchResult(SearchHit),
}

impl UdpResponse {
    pub fn to_message(&self) -> Message {
        let mut cursor = ByteCursor::new();
        let opcode = match self {
            UdpResponse::FoundSources { hash, sources } => {
                let sources = &sources[..sources.len().min(u8::MAX as usize)];
                cursor.write_hash(hash).write_u8(sources.len() as u8);
                for source in sources {
                    cursor.write_u32(source.ip).write_u16(source.port);
                }
                OP_GLOBFOUNDSOURCES
            }
            UdpResponse::ServerStatus(status) => {
                cursor
                    .write_u32(status.challenge)
                    .write_u32(status.users)
                    .write_u32(status.files)
                    .write_u32(status.max_connections)
                    .write_u32(status.soft_file_limit)
                    .write_u32(status.hard_file_limit)
                    .write_u32(status.udp_flags)
                    .write_u32(status.low_id_users)
                    .write_u16(status.udp_obfuscated_port)
                    .write_u16(status.tcp_obfuscated_port)
                    .write_u32(status.udp_key);
                OP_GLOBSERVSTATRES
            }
            UdpResponse::DescriptionLegacy { name, description } => {
                cursor.write_string(name).write_string(description);
                OP_SERVERDESCRES
            }
            UdpResponse::Description {
                challenge,
                name,
                description,
                dynamic_ip,
                version,
            } => {
                cursor.write_u32(*challenge);
                encode_tags(
                    &mut cursor,
                    &[
                        Tag::string(TAG_NAME, name.clone()),
                        Tag::string(TAG_DESCRIPTION, description.clone()),
                        Tag::string(TAG_DYNIP, dynamic_ip.clone()),
                        Tag::uint32(TAG_VERSION2, *version),
                        Tag::string(TAG_AUXPORTSLIST, ""),
                    ],
                );
                OP_SERVERDESCRES
            }
            UdpResponse::SearchResult(hit) => {
                hit.write(&mut cursor);
                OP_GLOBSEARCHRES
            }
        };
        Message::ed2k(opcode, cursor.into_written())
    }
}
