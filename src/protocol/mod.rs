//! ed2k wire protocol
//!
//! Byte cursor, tag lists, message framing and the typed requests and
//! replies exchanged over TCP and UDP.

pub mod constants;
pub mod cursor;
pub mod datagram;
pub mod file;
pub mod framer;
pub mod message;
pub mod request;
pub mod response;
pub mod search;
pub mod tags;

// Re-export main types
pub use cursor::ByteCursor;
pub use datagram::{ServerStatusReply, UdpRequest, UdpResponse};
pub use file::{FileInfo, OfferedFile, SearchHit};
pub use framer::{normalize, FrameStatus, MessageFramer};
pub use message::{Message, Protocol};
pub use request::{ClientRequest, LoginRequest};
pub use response::{Endpoint, ServerMessage};
pub use search::{BoolOp, Comparison, SearchExpr, SearchField};
pub use tags::{Attributes, Tag, TagValue};
