//! ed2k protocol messages
//!
//! A `Message` is one complete frame: protocol byte, opcode and payload.
//! TCP frames carry a u32 length covering opcode + payload, UDP datagrams
//! carry only protocol + opcode + payload.

use std::io::Read;

use anyhow::Result;
use flate2::read::ZlibDecoder;
use tracing::{debug, error, trace};

use crate::error::Ed2kError;
use crate::protocol::constants::{opcode_name, PR_ED2K, PR_EMULE, PR_ZLIB};
use crate::protocol::cursor::ByteCursor;

/// Size of the TCP header: protocol(1) + length(4)
pub const TCP_HEADER_SIZE: usize = 5;

/// Upper bound on an inflated ZLIB payload
const MAX_INFLATED_SIZE: u64 = 16 * 1024 * 1024;

/// ed2k protocol byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Ed2k = PR_ED2K,
    Emule = PR_EMULE,
    Zlib = PR_ZLIB,
}

impl Protocol {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Protocol {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            PR_ED2K => Ok(Protocol::Ed2k),
            PR_EMULE => Ok(Protocol::Emule),
            PR_ZLIB => Ok(Protocol::Zlib),
            _ => Err(Ed2kError::framing_error_with_source(
                "Unknown protocol byte",
                format!("value: 0x{:02x}", value),
            )
            .into()),
        }
    }
}

/// One framed ed2k message. The payload cursor starts at position 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: Protocol,
    pub opcode: u8,
    pub payload: ByteCursor,
}

impl Message {
    pub fn new(protocol: Protocol, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            opcode,
            payload: ByteCursor::from_vec(payload),
        }
    }

    /// Plain ED2K message
    pub fn ed2k(opcode: u8, payload: Vec<u8>) -> Self {
        Self::new(Protocol::Ed2k, opcode, payload)
    }

    /// Opcode name for logs
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    /// Full payload regardless of the cursor position
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Fresh read cursor over the payload
    pub fn reader(&self) -> ByteCursor {
        ByteCursor::from_bytes(self.payload.as_slice())
    }

    /// Serialize as a TCP frame (header + opcode + payload)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing {} ({} bytes payload)", self.name(), self.payload.len());
        let body = self.payload.as_slice();
        let mut cursor = ByteCursor::with_capacity(TCP_HEADER_SIZE + 1 + body.len());
        cursor
            .write_u8(self.protocol.code())
            .write_u32(body.len() as u32 + 1)
            .write_u8(self.opcode)
            .write_bytes(body);
        cursor.into_written()
    }

    /// Serialize as a UDP datagram (protocol + opcode + payload)
    pub fn serialize_udp(&self) -> Vec<u8> {
        let body = self.payload.as_slice();
        let mut cursor = ByteCursor::with_capacity(2 + body.len());
        cursor
            .write_u8(self.protocol.code())
            .write_u8(self.opcode)
            .write_bytes(body);
        cursor.into_written()
    }

    /// Parse a cleartext UDP datagram
    pub fn parse_udp(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < 2 {
            return Err(Ed2kError::framing_error_with_source(
                "Datagram too short",
                format!("{} bytes", datagram.len()),
            )
            .into());
        }
        let protocol = Protocol::try_from(datagram[0])?;
        Ok(Self::new(protocol, datagram[1], datagram[2..].to_vec()))
    }

    /// Turn a ZLIB message into the equivalent ED2K message.
    ///
    /// Other protocols are returned unchanged.
    pub fn inflate(self) -> Result<Self> {
        if self.protocol != Protocol::Zlib {
            return Ok(self);
        }

        let mut decoder = ZlibDecoder::new(self.payload.as_slice()).take(MAX_INFLATED_SIZE);
        let mut inflated = Vec::new();
        if let Err(e) = decoder.read_to_end(&mut inflated) {
            error!("Cannot inflate {}: {}", self.name(), e);
            return Err(Ed2kError::protocol_error_with_source(
                "Cannot inflate ZLIB payload",
                e.to_string(),
            )
            .into());
        }

        debug!(
            "Inflated {} payload {} -> {} bytes",
            self.name(),
            self.payload.len(),
            inflated.len()
        );
        Ok(Self::new(Protocol::Ed2k, self.opcode, inflated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_protocol_from_byte() {
        assert_eq!(Protocol::try_from(0xe3).unwrap(), Protocol::Ed2k);
        assert_eq!(Protocol::try_from(0xc5).unwrap(), Protocol::Emule);
        assert_eq!(Protocol::try_from(0xd4).unwrap(), Protocol::Zlib);
        assert!(Protocol::try_from(0x00).is_err());
    }

    #[test]
    fn test_serialize_tcp_header() {
        let msg = Message::ed2k(OP_SERVERSTATUS, vec![1, 0, 0, 0, 2, 0, 0, 0]);
        let bytes = msg.serialize();
        assert_eq!(&bytes[..6], &[PR_ED2K, 9, 0, 0, 0, OP_SERVERSTATUS]);
        assert_eq!(bytes.len(), 14);
    }

    #[test]
    fn test_bare_opcode() {
        let msg = Message::ed2k(OP_CALLBACKFAILED, Vec::new());
        assert_eq!(msg.serialize(), vec![PR_ED2K, 1, 0, 0, 0, OP_CALLBACKFAILED]);
    }

    #[test]
    fn test_udp_round_trip() {
        let msg = Message::ed2k(OP_GLOBSERVSTATREQ, vec![0xaa, 0xbb, 0xcc, 0xdd]);
        let parsed = Message::parse_udp(&msg.serialize_udp()).unwrap();
        assert_eq!(parsed, msg);
        assert!(Message::parse_udp(&[PR_ED2K]).is_err());
    }

    #[test]
    fn test_inflate_zlib() {
        let plain = b"offer files payload offer files payload".to_vec();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();

        let msg = Message::new(Protocol::Zlib, OP_OFFERFILES, compressed).inflate().unwrap();
        assert_eq!(msg.protocol, Protocol::Ed2k);
        assert_eq!(msg.opcode, OP_OFFERFILES);
        assert_eq!(msg.payload_bytes(), plain.as_slice());
    }

    #[test]
    fn test_inflate_garbage_fails() {
        let msg = Message::new(Protocol::Zlib, OP_OFFERFILES, vec![1, 2, 3, 4]);
        assert!(msg.inflate().is_err());
    }
}
