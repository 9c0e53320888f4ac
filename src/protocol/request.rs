//! Client → server TCP requests

use anyhow::Result;
use tracing::trace;

use crate::error::Ed2kError;
use crate::protocol::constants::*;
use crate::protocol::cursor::ByteCursor;
use crate::protocol::file::OfferedFile;
use crate::protocol::message::Message;
use crate::protocol::search::SearchExpr;
use crate::protocol::tags::{decode_tags, encode_tags, to_attributes, Attributes, Tag};

/// LOGIN_REQUEST body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub hash: [u8; 16],
    pub client_id: u32,
    pub port: u16,
    pub tags: Vec<Tag>,
}

impl LoginRequest {
    pub fn attributes(&self) -> Attributes {
        to_attributes(&self.tags)
    }
}

/// Decoded inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Login(LoginRequest),
    OfferFiles(Vec<OfferedFile>),
    GetServerList,
    GetSources {
        hash: [u8; 16],
        size: u64,
        obfuscated: bool,
    },
    Search(SearchExpr),
    CallbackRequest {
        low_id: u32,
    },
    /// Opcode this server does not handle
    Unknown(u8),
}

impl ClientRequest {
    /// Decode an ED2K message. The payload is read from position 0.
    pub fn decode(message: &Message) -> Result<Self> {
        let mut cursor = message.reader();
        trace!("Decoding {} ({} bytes)", message.name(), cursor.len());

        let request = match message.opcode {
            OP_LOGINREQUEST => {
                let hash = cursor.read_hash()?;
                let client_id = cursor.read_u32()?;
                let port = cursor.read_u16()?;
                let tags = decode_tags(&mut cursor)?;
                ClientRequest::Login(LoginRequest {
                    hash,
                    client_id,
                    port,
                    tags,
                })
            }
            OP_OFFERFILES => {
                let count = cursor.read_u32()? as usize;
                let mut files = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    files.push(OfferedFile::read(&mut cursor)?);
                }
                ClientRequest::OfferFiles(files)
            }
            OP_GETSERVERLIST => ClientRequest::GetServerList,
            OP_GETSOURCES | OP_GETSOURCES_OBFU => {
                let hash = cursor.read_hash()?;
                let mut size = cursor.read_u32()? as u64;
                if size == 0 {
                    size = cursor.read_u64()?;
                }
                ClientRequest::GetSources {
                    hash,
                    size,
                    obfuscated: message.opcode == OP_GETSOURCES_OBFU,
                }
            }
            OP_SEARCHREQUEST => ClientRequest::Search(SearchExpr::parse(&mut cursor)?),
            OP_CALLBACKREQUEST => ClientRequest::CallbackRequest {
                low_id: cursor.read_u32()?,
            },
            other => ClientRequest::Unknown(other),
        };
        Ok(request)
    }

    /// Encode as an ED2K message, the way a client sends it
    pub fn encode(&self) -> Result<Message> {
        let mut cursor = ByteCursor::new();
        let opcode = match self {
            ClientRequest::Login(login) => {
                cursor
                    .write_hash(&login.hash)
                    .write_u32(login.client_id)
                    .write_u16(login.port);
                encode_tags(&mut cursor, &login.tags);
                OP_LOGINREQUEST
            }
            ClientRequest::OfferFiles(files) => {
                cursor.write_u32(files.len() as u32);
                for file in files {
                    file.write(&mut cursor);
                }
                OP_OFFERFILES
            }
            ClientRequest::GetServerList => OP_GETSERVERLIST,
            ClientRequest::GetSources { hash, size, obfuscated } => {
                cursor.write_hash(hash);
                if *size > u32::MAX as u64 {
                    cursor.write_u32(0).write_u64(*size);
                } else {
                    cursor.write_u32(*size as u32);
                }
                if *obfuscated {
                    OP_GETSOURCES_OBFU
                } else {
                    OP_GETSOURCES
                }
            }
            ClientRequest::Search(expr) => {
                expr.encode(&mut cursor);
                OP_SEARCHREQUEST
            }
            ClientRequest::CallbackRequest { low_id } => {
                cursor.write_u32(*low_id);
                OP_CALLBACKREQUEST
            }
            ClientRequest::Unknown(opcode) => {
                return Err(Ed2kError::protocol_error_with_source(
                    "Cannot encode unknown request",
                    format!("opcode: 0x{:02x}", opcode),
                )
                .into());
            }
        };
        Ok(Message::ed2k(opcode, cursor.into_written()))
    }
}
