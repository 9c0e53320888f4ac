//! Server → client TCP messages

use anyhow::Result;

use crate::error::Ed2kError;
use crate::protocol::constants::*;
use crate::protocol::cursor::ByteCursor;
use crate::protocol::file::SearchHit;
use crate::protocol::message::Message;
use crate::protocol::tags::{decode_tags, encode_tags, to_attributes, Tag, TagValue};

/// Address + port pair, ip packed little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: u32,
    pub port: u16,
}

/// Outbound server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Text(String),
    Status {
        users: u32,
        files: u32,
    },
    IdChange {
        id: u32,
        flags: u32,
    },
    Ident {
        hash: [u8; 16],
        ip: u32,
        port: u16,
        name: String,
        description: String,
    },
    ServerList(Vec<Endpoint>),
    FoundSources {
        hash: [u8; 16],
        sources: Vec<Endpoint>,
        obfuscated: bool,
    },
    SearchResult(Vec<SearchHit>),
    CallbackRequested(Endpoint),
    CallbackFailed,
}

impl ServerMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            ServerMessage::Text(_) => OP_SERVERMESSAGE,
            ServerMessage::Status { .. } => OP_SERVERSTATUS,
            ServerMessage::IdChange { .. } => OP_IDCHANGE,
            ServerMessage::Ident { .. } => OP_SERVERIDENT,
            ServerMessage::ServerList(_) => OP_SERVERLIST,
            ServerMessage::FoundSources { obfuscated: true, .. } => OP_FOUNDSOURCES_OBFU,
            ServerMessage::FoundSources { .. } => OP_FOUNDSOURCES,
            ServerMessage::SearchResult(_) => OP_SEARCHRESULT,
            ServerMessage::CallbackRequested(_) => OP_CALLBACKREQUESTED,
            ServerMessage::CallbackFailed => OP_CALLBACKFAILED,
        }
    }

    /// Encode as an ED2K message
    pub fn to_message(&self) -> Message {
        let mut cursor = ByteCursor::new();
        match self {
            ServerMessage::Text(text) => {
                cursor.write_string(text);
            }
            ServerMessage::Status { users, files } => {
                cursor.write_u32(*users).write_u32(*files);
            }
            ServerMessage::IdChange { id, flags } => {
                cursor.write_u32(*id).write_u32(*flags);
            }
            ServerMessage::Ident {
                hash,
                ip,
                port,
                name,
                description,
            } => {
                cursor.write_hash(hash).write_u32(*ip).write_u16(*port);
                encode_tags(
                    &mut cursor,
                    &[
                        Tag::string(TAG_SERVER_NAME, name.clone()),
                        Tag::string(TAG_SERVER_DESC, description.clone()),
                    ],
                );
            }
            ServerMessage::ServerList(servers) => {
                let servers = &servers[..servers.len().min(u8::MAX as usize)];
                cursor.write_u8(servers.len() as u8);
                for server in servers {
                    cursor.write_u32(server.ip).write_u16(server.port);
                }
            }
            ServerMessage::FoundSources { hash, sources, .. } => {
                let sources = &sources[..sources.len().min(u8::MAX as usize)];
                cursor.write_hash(hash).write_u8(sources.len() as u8);
                for source in sources {
                    cursor.write_u32(source.ip).write_u16(source.port);
                }
            }
            ServerMessage::SearchResult(hits) => {
                cursor.write_u32(hits.len() as u32);
                for hit in hits {
                    hit.write(&mut cursor);
                }
            }
            ServerMessage::CallbackRequested(endpoint) => {
                cursor.write_u32(endpoint.ip).write_u16(endpoint.port);
            }
            ServerMessage::CallbackFailed => {}
        }
        Message::ed2k(self.opcode(), cursor.into_written())
    }

    /// Decode a server message, as a client would. Search results are not
    /// decoded.
    pub fn decode(message: &Message) -> Result<Self> {
        let mut cursor = message.reader();
        let decoded = match message.opcode {
            OP_SERVERMESSAGE => ServerMessage::Text(cursor.read_string()?),
            OP_SERVERSTATUS => ServerMessage::Status {
                users: cursor.read_u32()?,
                files: cursor.read_u32()?,
            },
            OP_IDCHANGE => ServerMessage::IdChange {
                id: cursor.read_u32()?,
                flags: cursor.read_u32()?,
            },
            OP_SERVERIDENT => {
                let hash = cursor.read_hash()?;
                let ip = cursor.read_u32()?;
                let port = cursor.read_u16()?;
                let attrs = to_attributes(&decode_tags(&mut cursor)?);
                let text = |key: &str| attrs.get(key).and_then(TagValue::as_str).unwrap_or("").to_string();
                ServerMessage::Ident {
                    hash,
                    ip,
                    port,
                    name: text("name"),
                    description: text("description"),
                }
            }
            OP_SERVERLIST => {
                let count = cursor.read_u8()?;
                let mut servers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    servers.push(read_endpoint(&mut cursor)?);
                }
                ServerMessage::ServerList(servers)
            }
            OP_FOUNDSOURCES | OP_FOUNDSOURCES_OBFU => {
                let hash = cursor.read_hash()?;
                let count = cursor.read_u8()?;
                let mut sources = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    sources.push(read_endpoint(&mut cursor)?);
                }
                ServerMessage::FoundSources {
                    hash,
                    sources,
                    obfuscated: message.opcode == OP_FOUNDSOURCES_OBFU,
                }
            }
            OP_CALLBACKREQUESTED => ServerMessage::CallbackRequested(read_endpoint(&mut cursor)?),
            OP_CALLBACKFAILED => ServerMessage::CallbackFailed,
            other => {
                return Err(Ed2kError::protocol_error_with_source(
                    "Not a decodable server message",
                    format!("opcode: 0x{:02x}", other),
                )
                .into())
            }
        };
        Ok(decoded)
    }
}

fn read_endpoint(cursor: &mut ByteCursor) -> Result<Endpoint> {
    Ok(Endpoint {
        ip: cursor.read_u32()?,
        port: cursor.read_u16()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::file::FileInfo;

    #[test]
    fn test_status_layout() {
        let msg = ServerMessage::Status { users: 3, files: 7 }.to_message();
        assert_eq!(msg.opcode, OP_SERVERSTATUS);
        assert_eq!(msg.payload_bytes(), &[3, 0, 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn test_ident_round_trip() {
        let ident = ServerMessage::Ident {
            hash: [0x11; 16],
            ip: 0x0100007f,
            port: 5555,
            name: "ed2k-server".to_string(),
            description: "test server".to_string(),
        };
        assert_eq!(ServerMessage::decode(&ident.to_message()).unwrap(), ident);
    }

    #[test]
    fn test_found_sources_obfu_opcode() {
        let found = ServerMessage::FoundSources {
            hash: [9; 16],
            sources: vec![Endpoint { ip: 1, port: 2 }, Endpoint { ip: 3, port: 4 }],
            obfuscated: true,
        };
        let msg = found.to_message();
        assert_eq!(msg.opcode, OP_FOUNDSOURCES_OBFU);
        assert_eq!(msg.payload_bytes()[16], 2);
        assert_eq!(ServerMessage::decode(&msg).unwrap(), found);
    }

    #[test]
    fn test_callback_failed_is_bare() {
        let msg = ServerMessage::CallbackFailed.to_message();
        assert!(msg.payload_bytes().is_empty());
        assert_eq!(msg.serialize(), vec![PR_ED2K, 1, 0, 0, 0, OP_CALLBACKFAILED]);
    }

    #[test]
    fn test_search_result_count() {
        let hit = SearchHit {
            info: FileInfo {
                hash: [5; 16],
                name: "x.avi".to_string(),
                size: 42,
                file_type: "Video".to_string(),
                ..Default::default()
            },
            client_id: 0x0100007f,
            port: 4662,
            sources: 1,
            complete_sources: 1,
        };
        let msg = ServerMessage::SearchResult(vec![hit.clone(), hit]).to_message();
        let mut cursor = msg.reader();
        assert_eq!(cursor.read_u32().unwrap(), 2);
        assert_eq!(cursor.read_hash().unwrap(), [5; 16]);
    }
}
