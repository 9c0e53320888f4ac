//! Search predicate trees
//!
//! SEARCH_REQUEST payloads are a prefix-encoded binary tree. Boolean nodes
//! carry an operator and two subtrees, leaves are free text, string
//! constraints or numeric comparisons against a file attribute.

use std::fmt;

use anyhow::Result;
use tracing::warn;

use crate::error::Ed2kError;
use crate::protocol::constants::tag_name;
use crate::protocol::cursor::ByteCursor;

const TOKEN_BOOL: u8 = 0x00;
const TOKEN_TEXT: u8 = 0x01;
const TOKEN_STRING: u8 = 0x02;
const TOKEN_UINT32: u8 = 0x03;
const TOKEN_UINT64: u8 = 0x08;

/// Deepest accepted tree
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
    AndNot,
}

impl BoolOp {
    fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BoolOp::And),
            1 => Ok(BoolOp::Or),
            2 => Ok(BoolOp::AndNot),
            _ => Err(Ed2kError::protocol_error_with_source(
                "Unknown boolean operator",
                format!("value: {}", value),
            )
            .into()),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            BoolOp::And => 0,
            BoolOp::Or => 1,
            BoolOp::AndNot => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    NotEqual,
}

impl Comparison {
    fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Comparison::Equal),
            1 => Ok(Comparison::Greater),
            2 => Ok(Comparison::Less),
            3 => Ok(Comparison::GreaterEqual),
            4 => Ok(Comparison::LessEqual),
            5 => Ok(Comparison::NotEqual),
            _ => Err(Ed2kError::protocol_error_with_source(
                "Unknown comparison operator",
                format!("value: {}", value),
            )
            .into()),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Comparison::Equal => 0,
            Comparison::Greater => 1,
            Comparison::Less => 2,
            Comparison::GreaterEqual => 3,
            Comparison::LessEqual => 4,
            Comparison::NotEqual => 5,
        }
    }

    /// Evaluate `actual <op> expected`
    pub fn holds(self, actual: u64, expected: u64) -> bool {
        match self {
            Comparison::Equal => actual == expected,
            Comparison::Greater => actual > expected,
            Comparison::Less => actual < expected,
            Comparison::GreaterEqual => actual >= expected,
            Comparison::LessEqual => actual <= expected,
            Comparison::NotEqual => actual != expected,
        }
    }
}

/// Attribute a constraint applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchField {
    /// One-byte name, a tag field code
    Code(u8),
    /// Longer names are kept verbatim
    Named(String),
}

impl SearchField {
    fn read(cursor: &mut ByteCursor) -> Result<Self> {
        let len = cursor.read_u16()? as usize;
        if len == 1 {
            return Ok(SearchField::Code(cursor.read_u8()?));
        }
        Ok(SearchField::Named(cursor.read_string_exact(len)?))
    }

    fn write(&self, cursor: &mut ByteCursor) {
        match self {
            SearchField::Code(code) => {
                cursor.write_u16(1).write_u8(*code);
            }
            SearchField::Named(name) => {
                cursor.write_string(name);
            }
        }
    }

    pub fn code(&self) -> Option<u8> {
        match self {
            SearchField::Code(code) => Some(*code),
            SearchField::Named(_) => None,
        }
    }
}

impl fmt::Display for SearchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchField::Code(code) => match tag_name(*code) {
                Some(name) => write!(f, "{}", name),
                None => write!(f, "tag_0x{:02x}", code),
            },
            SearchField::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Parsed search predicate tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchExpr {
    Bool {
        op: BoolOp,
        left: Box<SearchExpr>,
        right: Box<SearchExpr>,
    },
    Text(String),
    StringMatch {
        value: String,
        field: SearchField,
    },
    Numeric {
        value: u64,
        comparison: Comparison,
        field: SearchField,
    },
}

impl SearchExpr {
    /// Parse one tree starting at the cursor
    pub fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        Self::parse_at(cursor, 0)
    }

    fn parse_at(cursor: &mut ByteCursor, depth: usize) -> Result<Self> {
        if depth >= MAX_DEPTH {
            return Err(Ed2kError::protocol_error("Search tree too deep").into());
        }

        let token = cursor.read_u8()?;
        let expr = match token {
            TOKEN_BOOL => {
                let op = BoolOp::from_byte(cursor.read_u8()?)?;
                let left = Self::parse_at(cursor, depth + 1)?;
                let right = Self::parse_at(cursor, depth + 1)?;
                SearchExpr::Bool {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            }
            TOKEN_TEXT => SearchExpr::Text(cursor.read_string()?),
            TOKEN_STRING => {
                let value = cursor.read_string()?;
                let field = SearchField::read(cursor)?;
                SearchExpr::StringMatch { value, field }
            }
            TOKEN_UINT32 => {
                let value = cursor.read_u32()? as u64;
                let comparison = Comparison::from_byte(cursor.read_u8()?)?;
                let field = SearchField::read(cursor)?;
                SearchExpr::Numeric { value, comparison, field }
            }
            TOKEN_UINT64 => {
                let value = cursor.read_u64()?;
                let comparison = Comparison::from_byte(cursor.read_u8()?)?;
                let field = SearchField::read(cursor)?;
                SearchExpr::Numeric { value, comparison, field }
            }
            other => {
                warn!("Unknown search token: 0x{:02x}", other);
                return Err(Ed2kError::protocol_error_with_source(
                    "Unknown search token",
                    format!("token: 0x{:02x}", other),
                )
                .into());
            }
        };
        Ok(expr)
    }

    /// Write the tree in wire order
    pub fn encode(&self, cursor: &mut ByteCursor) {
        match self {
            SearchExpr::Bool { op, left, right } => {
                cursor.write_u8(TOKEN_BOOL).write_u8(op.to_byte());
                left.encode(cursor);
                right.encode(cursor);
            }
            SearchExpr::Text(text) => {
                cursor.write_u8(TOKEN_TEXT).write_string(text);
            }
            SearchExpr::StringMatch { value, field } => {
                cursor.write_u8(TOKEN_STRING).write_string(value);
                field.write(cursor);
            }
            SearchExpr::Numeric { value, comparison, field } => {
                if *value > u32::MAX as u64 {
                    cursor.write_u8(TOKEN_UINT64).write_u64(*value);
                } else {
                    cursor.write_u8(TOKEN_UINT32).write_u32(*value as u32);
                }
                cursor.write_u8(comparison.to_byte());
                field.write(cursor);
            }
        }
    }

    pub fn and(left: SearchExpr, right: SearchExpr) -> Self {
        SearchExpr::Bool {
            op: BoolOp::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

impl fmt::Display for SearchExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchExpr::Bool { op, left, right } => {
                let op = match op {
                    BoolOp::And => "AND",
                    BoolOp::Or => "OR",
                    BoolOp::AndNot => "AND NOT",
                };
                write!(f, "({} {} {})", left, op, right)
            }
            SearchExpr::Text(text) => write!(f, "\"{}\"", text),
            SearchExpr::StringMatch { value, field } => write!(f, "{}=\"{}\"", field, value),
            SearchExpr::Numeric { value, comparison, field } => {
                let op = match comparison {
                    Comparison::Equal => "=",
                    Comparison::Greater => ">",
                    Comparison::Less => "<",
                    Comparison::GreaterEqual => ">=",
                    Comparison::LessEqual => "<=",
                    Comparison::NotEqual => "!=",
                };
                write!(f, "{}{}{}", field, op, value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_parse_text() {
        let mut cursor = ByteCursor::from_bytes(&[0x01, 4, 0, b'm', b'u', b's', b'e']);
        assert_eq!(SearchExpr::parse(&mut cursor).unwrap(), SearchExpr::Text("muse".to_string()));
    }

    #[test]
    fn test_parse_type_constraint() {
        // text "live" AND type = "Audio"
        let data = [
            0x00, 0x00, // AND
            0x01, 4, 0, b'l', b'i', b'v', b'e',
            0x02, 5, 0, b'A', b'u', b'd', b'i', b'o', 1, 0, TAG_TYPE,
        ];
        let mut cursor = ByteCursor::from_bytes(&data);
        let expr = SearchExpr::parse(&mut cursor).unwrap();
        assert_eq!(
            expr,
            SearchExpr::and(
                SearchExpr::Text("live".to_string()),
                SearchExpr::StringMatch {
                    value: "Audio".to_string(),
                    field: SearchField::Code(TAG_TYPE),
                }
            )
        );
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_parse_numeric_constraints() {
        // size > 1000 (u32) OR size < 2^33 (u64)
        let data = [
            0x00, 0x01,
            0x03, 0xe8, 0x03, 0, 0, 0x01, 1, 0, TAG_SIZE,
            0x08, 0, 0, 0, 0, 2, 0, 0, 0, 0x02, 1, 0, TAG_SIZE,
        ];
        let mut cursor = ByteCursor::from_bytes(&data);
        match SearchExpr::parse(&mut cursor).unwrap() {
            SearchExpr::Bool { op, left, right } => {
                assert_eq!(op, BoolOp::Or);
                assert_eq!(
                    *left,
                    SearchExpr::Numeric {
                        value: 1000,
                        comparison: Comparison::Greater,
                        field: SearchField::Code(TAG_SIZE),
                    }
                );
                assert_eq!(
                    *right,
                    SearchExpr::Numeric {
                        value: 1 << 33,
                        comparison: Comparison::Less,
                        field: SearchField::Code(TAG_SIZE),
                    }
                );
            }
            other => panic!("unexpected expression {:?}", other),
        }
    }

    #[test]
    fn test_encode_matches_parse() {
        let expr = SearchExpr::Bool {
            op: BoolOp::AndNot,
            left: Box::new(SearchExpr::Text("linux iso".to_string())),
            right: Box::new(SearchExpr::StringMatch {
                value: "Pro".to_string(),
                field: SearchField::Named("Type".to_string()),
            }),
        };
        let mut cursor = ByteCursor::new();
        expr.encode(&mut cursor);
        let mut reader = ByteCursor::from_vec(cursor.into_written());
        assert_eq!(SearchExpr::parse(&mut reader).unwrap(), expr);
    }

    #[test]
    fn test_unknown_token_is_error() {
        let mut cursor = ByteCursor::from_bytes(&[0x07, 0, 0]);
        assert!(SearchExpr::parse(&mut cursor).is_err());
    }

    #[test]
    fn test_depth_cap() {
        let mut data = Vec::new();
        for _ in 0..MAX_DEPTH {
            data.extend_from_slice(&[0x00, 0x00]);
        }
        let mut cursor = ByteCursor::from_vec(data);
        assert!(SearchExpr::parse(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_tree_is_error() {
        let mut cursor = ByteCursor::from_bytes(&[0x00, 0x00, 0x01, 2, 0, b'h', b'i']);
        assert!(SearchExpr::parse(&mut cursor).is_err());
    }

    #[test]
    fn test_display() {
        let expr = SearchExpr::and(
            SearchExpr::Text("muse".to_string()),
            SearchExpr::Numeric {
                value: 128,
                comparison: Comparison::GreaterEqual,
                field: SearchField::Code(TAG_MEDIA_BITRATE),
            },
        );
        assert_eq!(expr.to_string(), "(\"muse\" AND bitrate>=128)");
    }
}
