//! TCP stream framing
//!
//! Turns an arbitrary sequence of socket reads into complete ed2k messages.
//! Partial headers and bodies are buffered across calls, and bytes beyond the
//! end of one message are fed back through the header state in the same call
//! so that messages come out in arrival order.

use tracing::{debug, trace, warn};

use crate::error::Ed2kError;
use crate::protocol::constants::opcode_name;
use crate::protocol::cursor::ByteCursor;
use crate::protocol::message::{Message, Protocol, TCP_HEADER_SIZE};

/// Header plus the opcode byte
const FRAME_PREFIX: usize = TCP_HEADER_SIZE + 1;

/// Largest accepted opcode + payload length
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Status of the message currently being assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    New,
    WaitingBody,
    Ready,
}

#[derive(Debug)]
struct PendingMessage {
    protocol: Protocol,
    opcode: u8,
    body: ByteCursor,
}

/// Per-connection framer
#[derive(Debug)]
pub struct MessageFramer {
    status: FrameStatus,
    header: Vec<u8>,
    pending: Option<PendingMessage>,
    framing_errors: u64,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    pub fn new() -> Self {
        Self {
            status: FrameStatus::New,
            header: Vec::with_capacity(FRAME_PREFIX),
            pending: None,
            framing_errors: 0,
        }
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    /// Bytes held for an incomplete message
    pub fn buffered(&self) -> usize {
        self.header.len() + self.pending.as_ref().map_or(0, |p| p.body.tell())
    }

    /// Number of times the buffer was discarded because of a bad header
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Drop everything buffered and start over
    pub fn reset(&mut self) {
        self.header.clear();
        self.pending = None;
        self.status = FrameStatus::New;
    }

    /// Feed received bytes, returning every message completed by them in
    /// arrival order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Message> {
        let mut ready = Vec::new();
        let mut input = data;

        while !input.is_empty() {
            let consumed = match self.status {
                FrameStatus::New => self.read_header(input),
                FrameStatus::WaitingBody => self.fill_body(input),
                FrameStatus::Ready => 0,
            };
            input = &input[consumed..];

            if self.status == FrameStatus::Ready {
                if let Some(message) = self.take_ready() {
                    ready.push(message);
                }
            }
        }

        ready
    }

    fn read_header(&mut self, input: &[u8]) -> usize {
        let take = (FRAME_PREFIX - self.header.len()).min(input.len());
        self.header.extend_from_slice(&input[..take]);
        let Some(&first) = self.header.first() else {
            return take;
        };

        // the protocol byte is checked before the rest of the header arrives
        let protocol = match Protocol::try_from(first) {
            Ok(protocol) => protocol,
            Err(e) => {
                self.discard(&e.to_string(), input.len() - take);
                return input.len();
            }
        };
        if self.header.len() < FRAME_PREFIX {
            return take;
        }

        let length = u32::from_le_bytes([self.header[1], self.header[2], self.header[3], self.header[4]]) as usize;
        if length == 0 || length > MAX_MESSAGE_SIZE {
            let err = Ed2kError::framing_error_with_source("Malformed length", format!("length: {}", length));
            self.discard(&err.to_string(), input.len() - take);
            return input.len();
        }

        let opcode = self.header[5];
        self.header.clear();
        trace!("Frame header: protocol {:?}, opcode {}, body {} bytes", protocol, opcode_name(opcode), length - 1);

        self.pending = Some(PendingMessage {
            protocol,
            opcode,
            body: ByteCursor::with_capacity(length - 1),
        });
        self.status = if length == 1 {
            FrameStatus::Ready
        } else {
            FrameStatus::WaitingBody
        };
        take
    }

    fn fill_body(&mut self, input: &[u8]) -> usize {
        let Some(pending) = self.pending.as_mut() else {
            self.status = FrameStatus::New;
            return 0;
        };

        let take = pending.body.remaining().min(input.len());
        pending.body.write_bytes(&input[..take]);
        if pending.body.remaining() == 0 {
            self.status = FrameStatus::Ready;
        }
        take
    }

    fn take_ready(&mut self) -> Option<Message> {
        self.status = FrameStatus::New;
        let pending = self.pending.take()?;
        Some(Message::new(pending.protocol, pending.opcode, pending.body.into_written()))
    }

    fn discard(&mut self, reason: &str, unread: usize) {
        self.framing_errors += 1;
        warn!(
            "{}; discarding {} buffered and {} unread bytes",
            reason,
            self.buffered(),
            unread
        );
        self.reset();
    }
}

/// Prepare a framed message for dispatch.
///
/// ZLIB payloads are inflated into ED2K messages; EMULE messages are not
/// supported and yield `None`, as does a payload that fails to inflate.
pub fn normalize(message: Message) -> Option<Message> {
    match message.protocol {
        Protocol::Ed2k => Some(message),
        Protocol::Zlib => match message.inflate() {
            Ok(inflated) => Some(inflated),
            Err(e) => {
                warn!("Dropping compressed message: {}", e);
                None
            }
        },
        Protocol::Emule => {
            debug!("Unsupported protocol EMULE for {}", message.name());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::ed2k(OP_LOGINREQUEST, (0u8..40).collect()),
            Message::ed2k(OP_GETSERVERLIST, Vec::new()),
            Message::new(Protocol::Zlib, OP_OFFERFILES, vec![9; 300]),
        ]
    }

    fn wire(messages: &[Message]) -> Vec<u8> {
        messages.iter().flat_map(|m| m.serialize()).collect()
    }

    #[test]
    fn test_single_message_whole() {
        let msg = Message::ed2k(OP_SERVERMESSAGE, b"\x05\x00hello".to_vec());
        let mut framer = MessageFramer::new();
        let out = framer.feed(&msg.serialize());
        assert_eq!(out, vec![msg]);
        assert_eq!(framer.status(), FrameStatus::New);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_byte_by_byte_matches_whole() {
        let messages = sample_messages();
        let bytes = wire(&messages);

        let mut framer = MessageFramer::new();
        let mut out = Vec::new();
        for b in &bytes {
            out.extend(framer.feed(std::slice::from_ref(b)));
        }
        assert_eq!(out, messages);
        assert_eq!(framer.buffered(), 0);
        assert_eq!(framer.status(), FrameStatus::New);
    }

    #[test]
    fn test_uneven_chunks_match_whole() {
        let messages = sample_messages();
        let bytes = wire(&messages);
        let sizes = [1usize, 4, 2, 7, 13, 3, 64, 5];

        let mut framer = MessageFramer::new();
        let mut out = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < bytes.len() {
            let end = (offset + sizes[i % sizes.len()]).min(bytes.len());
            out.extend(framer.feed(&bytes[offset..end]));
            offset = end;
            i += 1;
        }
        assert_eq!(out, messages);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let first = Message::ed2k(OP_GETSOURCES, vec![1; 20]);
        let second = Message::ed2k(OP_CALLBACKREQUEST, vec![4, 3, 2, 1]);
        let mut framer = MessageFramer::new();
        let out = framer.feed(&wire(&[first.clone(), second.clone()]));
        assert_eq!(out, vec![first, second]);
        assert_eq!(framer.status(), FrameStatus::New);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_split_header() {
        let msg = Message::ed2k(OP_SEARCHREQUEST, vec![1, 4, 0, b't', b'e', b's', b't']);
        let bytes = msg.serialize();
        let mut framer = MessageFramer::new();
        assert!(framer.feed(&bytes[..3]).is_empty());
        assert_eq!(framer.status(), FrameStatus::New);
        assert!(framer.feed(&bytes[3..8]).is_empty());
        assert_eq!(framer.status(), FrameStatus::WaitingBody);
        assert_eq!(framer.feed(&bytes[8..]), vec![msg]);
    }

    #[test]
    fn test_bad_protocol_discards_everything() {
        let good = Message::ed2k(OP_GETSERVERLIST, Vec::new());
        let mut bytes = vec![0x00, 2, 0, 0, 0, 0x01, 0xff];
        bytes.extend(good.serialize());

        let mut framer = MessageFramer::new();
        assert!(framer.feed(&bytes).is_empty());
        assert_eq!(framer.framing_errors(), 1);
        assert_eq!(framer.buffered(), 0);
        assert_eq!(framer.status(), FrameStatus::New);

        // the connection stays usable after the discard
        assert_eq!(framer.feed(&good.serialize()), vec![good]);
    }

    #[test]
    fn test_bad_protocol_byte_rejected_alone() {
        let mut framer = MessageFramer::new();
        assert!(framer.feed(&[0x99]).is_empty());
        assert_eq!(framer.framing_errors(), 1);
        assert_eq!(framer.buffered(), 0);
        assert_eq!(framer.status(), FrameStatus::New);

        let good = Message::ed2k(OP_GETSERVERLIST, Vec::new());
        assert_eq!(framer.feed(&good.serialize()), vec![good]);
    }

    #[test]
    fn test_zero_length_is_framing_error() {
        let mut framer = MessageFramer::new();
        assert!(framer.feed(&[PR_ED2K, 0, 0, 0, 0, 0x14]).is_empty());
        assert_eq!(framer.framing_errors(), 1);
    }

    #[test]
    fn test_bare_opcode_message() {
        let mut framer = MessageFramer::new();
        let out = framer.feed(&[PR_ED2K, 1, 0, 0, 0, OP_GETSERVERLIST]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, OP_GETSERVERLIST);
        assert!(out[0].payload_bytes().is_empty());
    }

    #[test]
    fn test_normalize_drops_emule() {
        let msg = Message::new(Protocol::Emule, 0x60, vec![1, 2]);
        assert!(normalize(msg).is_none());
        let msg = Message::ed2k(OP_GETSERVERLIST, Vec::new());
        assert_eq!(normalize(msg.clone()), Some(msg));
    }
}
