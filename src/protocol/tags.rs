//! Tag list codec
//!
//! A tag list is a u32 count followed by `count` tags. A standard tag is
//! `type(1) + name length(u16, always 1) + field code(1) + value`. When the
//! high bit of the type byte is set the tag uses the compact layout
//! `type|0x80 (1) + field code(1) + value`, and compact types at or above
//! 0x10 are strings of `type - 0x10` bytes stored without a length prefix.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{trace, warn};

use crate::error::Ed2kError;
use crate::protocol::constants::{
    tag_name, TYPE_HASH, TYPE_STRING, TYPE_TAGS, TYPE_UINT16, TYPE_UINT32, TYPE_UINT8,
};
use crate::protocol::cursor::ByteCursor;

const COMPACT_FLAG: u8 = 0x80;
const COMPACT_STRING_BASE: u8 = 0x10;
const MAX_NESTING: usize = 8;

/// Typed tag value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    Hash([u8; 16]),
    String(String),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    TagList(Vec<Tag>),
}

impl TagValue {
    /// Wire type code for this value
    pub fn type_code(&self) -> u8 {
        match self {
            TagValue::Hash(_) => TYPE_HASH,
            TagValue::String(_) => TYPE_STRING,
            TagValue::UInt8(_) => TYPE_UINT8,
            TagValue::UInt16(_) => TYPE_UINT16,
            TagValue::UInt32(_) => TYPE_UINT32,
            TagValue::TagList(_) => TYPE_TAGS,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer value widened to u32
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            TagValue::UInt8(v) => Some(*v as u32),
            TagValue::UInt16(v) => Some(*v as u32),
            TagValue::UInt32(v) => Some(*v),
            _ => None,
        }
    }
}

/// A field code plus its typed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub code: u8,
    pub value: TagValue,
}

impl Tag {
    pub fn new(code: u8, value: TagValue) -> Self {
        Self { code, value }
    }

    pub fn string(code: u8, value: impl Into<String>) -> Self {
        Self::new(code, TagValue::String(value.into()))
    }

    pub fn uint32(code: u8, value: u32) -> Self {
        Self::new(code, TagValue::UInt32(value))
    }

    /// Attribute name for this tag; unknown codes get a synthetic key
    pub fn name(&self) -> String {
        match tag_name(self.code) {
            Some(name) => name.to_string(),
            None => format!("tag_0x{:02x}", self.code),
        }
    }
}

/// Named attribute map built from a decoded tag list
pub type Attributes = BTreeMap<String, TagValue>;

/// Collect tags into named attributes. Later duplicates win.
pub fn to_attributes(tags: &[Tag]) -> Attributes {
    tags.iter().map(|tag| (tag.name(), tag.value.clone())).collect()
}

/// Write `count` + tags in the standard layout
pub fn encode_tags(cursor: &mut ByteCursor, tags: &[Tag]) {
    cursor.write_u32(tags.len() as u32);
    for tag in tags {
        encode_tag(cursor, tag);
    }
}

fn encode_tag(cursor: &mut ByteCursor, tag: &Tag) {
    cursor.write_u8(tag.value.type_code()).write_u16(1).write_u8(tag.code);
    match &tag.value {
        TagValue::Hash(hash) => {
            cursor.write_hash(hash);
        }
        TagValue::String(s) => {
            cursor.write_string(s);
        }
        TagValue::UInt8(v) => {
            cursor.write_u8(*v);
        }
        TagValue::UInt16(v) => {
            cursor.write_u16(*v);
        }
        TagValue::UInt32(v) => {
            cursor.write_u32(*v);
        }
        TagValue::TagList(inner) => encode_tags(cursor, inner),
    }
}

/// Read a full tag list. Any unsupported value type fails the whole list.
pub fn decode_tags(cursor: &mut ByteCursor) -> Result<Vec<Tag>> {
    decode_tags_nested(cursor, 0)
}

fn decode_tags_nested(cursor: &mut ByteCursor, depth: usize) -> Result<Vec<Tag>> {
    if depth > MAX_NESTING {
        return Err(Ed2kError::tag_decode_error("Tag lists nested too deeply").into());
    }
    let count = cursor.read_u32()? as usize;
    trace!("Decoding {} tags", count);
    // count comes off the wire, do not trust it for preallocation
    let mut tags = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        tags.push(decode_tag(cursor, depth)?);
    }
    Ok(tags)
}

fn decode_tag(cursor: &mut ByteCursor, depth: usize) -> Result<Tag> {
    let type_byte = cursor.read_u8()?;

    if type_byte & COMPACT_FLAG != 0 {
        let code = cursor.read_u8()?;
        let value_type = type_byte & !COMPACT_FLAG;
        if value_type >= COMPACT_STRING_BASE {
            let len = (value_type - COMPACT_STRING_BASE) as usize;
            let value = cursor.read_string_exact(len)?;
            return Ok(Tag::string(code, value));
        }
        let value = decode_value(cursor, value_type, depth)?;
        return Ok(Tag::new(code, value));
    }

    let name_len = cursor.read_u16()?;
    if name_len != 1 {
        warn!("Unsupported tag name length: {}", name_len);
        return Err(Ed2kError::tag_decode_error_with_source(
            "Unsupported tag layout",
            format!("name length {}", name_len),
        )
        .into());
    }
    let code = cursor.read_u8()?;
    let value = decode_value(cursor, type_byte, depth)?;
    Ok(Tag::new(code, value))
}

fn decode_value(cursor: &mut ByteCursor, value_type: u8, depth: usize) -> Result<TagValue> {
    let value = match value_type {
        TYPE_HASH => TagValue::Hash(cursor.read_hash()?),
        TYPE_STRING => TagValue::String(cursor.read_string()?),
        TYPE_UINT8 => TagValue::UInt8(cursor.read_u8()?),
        TYPE_UINT16 => TagValue::UInt16(cursor.read_u16()?),
        TYPE_UINT32 => TagValue::UInt32(cursor.read_u32()?),
        TYPE_TAGS => TagValue::TagList(decode_tags_nested(cursor, depth + 1)?),
        other => {
            warn!("Unknown tag value type: 0x{:02x}", other);
            return Err(Ed2kError::tag_decode_error_with_source(
                "Unknown tag value type",
                format!("type 0x{:02x}", other),
            )
            .into());
        }
    };
    Ok(value)
}
