//! ed2k wire constants
//!
//! Protocol codes, opcodes, tag value types, tag field codes and flags, plus
//! immutable name lookup tables built once on first use.

use std::collections::HashMap;
use std::sync::OnceLock;

// Protocols
pub const PR_ED2K: u8 = 0xe3;
pub const PR_EMULE: u8 = 0xc5;
pub const PR_ZLIB: u8 = 0xd4;

// TCP opcodes
pub const OP_LOGINREQUEST: u8 = 0x01;
pub const OP_HELLO: u8 = 0x01;
pub const OP_HELLOANSWER: u8 = 0x4c;
pub const OP_SERVERMESSAGE: u8 = 0x38;
pub const OP_SERVERSTATUS: u8 = 0x34;
pub const OP_IDCHANGE: u8 = 0x40;
pub const OP_GETSERVERLIST: u8 = 0x14;
pub const OP_OFFERFILES: u8 = 0x15;
pub const OP_SERVERLIST: u8 = 0x32;
pub const OP_SERVERIDENT: u8 = 0x41;
pub const OP_GETSOURCES: u8 = 0x19;
pub const OP_FOUNDSOURCES: u8 = 0x42;
pub const OP_SEARCHREQUEST: u8 = 0x16;
pub const OP_SEARCHRESULT: u8 = 0x33;
pub const OP_CALLBACKREQUEST: u8 = 0x1c;
pub const OP_CALLBACKREQUESTED: u8 = 0x35;
pub const OP_CALLBACKFAILED: u8 = 0x36;
pub const OP_GETSOURCES_OBFU: u8 = 0x23;
pub const OP_FOUNDSOURCES_OBFU: u8 = 0x44;

// UDP opcodes
pub const OP_GLOBSEARCHREQ3: u8 = 0x90;
pub const OP_GLOBSEARCHREQ2: u8 = 0x92;
pub const OP_GLOBGETSOURCES2: u8 = 0x94;
pub const OP_GLOBSERVSTATREQ: u8 = 0x96;
pub const OP_GLOBSERVSTATRES: u8 = 0x97;
pub const OP_GLOBSEARCHREQ: u8 = 0x98;
pub const OP_GLOBSEARCHRES: u8 = 0x99;
pub const OP_GLOBGETSOURCES: u8 = 0x9a;
pub const OP_GLOBFOUNDSOURCES: u8 = 0x9b;
pub const OP_SERVERDESCREQ: u8 = 0xa2;
pub const OP_SERVERDESCRES: u8 = 0xa3;

// Tag value types
pub const TYPE_HASH: u8 = 0x01;
pub const TYPE_STRING: u8 = 0x02;
pub const TYPE_UINT32: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_UINT16: u8 = 0x08;
pub const TYPE_UINT8: u8 = 0x09;
pub const TYPE_TAGS: u8 = 0x0f;

// Tag field codes
pub const TAG_NAME: u8 = 0x01;
pub const TAG_SIZE: u8 = 0x02;
pub const TAG_TYPE: u8 = 0x03;
pub const TAG_FORMAT: u8 = 0x04;
pub const TAG_DESCRIPTION: u8 = 0x0b;
pub const TAG_SEARCHTREE: u8 = 0x0e;
pub const TAG_PORT: u8 = 0x0f;
pub const TAG_VERSION: u8 = 0x11;
pub const TAG_SOURCES: u8 = 0x15;
pub const TAG_FLAGS: u8 = 0x20;
pub const TAG_COMPLETE_SOURCES: u8 = 0x30;
pub const TAG_SIZE_HI: u8 = 0x3a;
pub const TAG_DYNIP: u8 = 0x85;
pub const TAG_VERSION2: u8 = 0x91;
pub const TAG_AUXPORTSLIST: u8 = 0x93;
pub const TAG_MEDIA_ARTIST: u8 = 0xd0;
pub const TAG_MEDIA_ALBUM: u8 = 0xd1;
pub const TAG_MEDIA_TITLE: u8 = 0xd2;
pub const TAG_MEDIA_LENGTH: u8 = 0xd3;
pub const TAG_MEDIA_BITRATE: u8 = 0xd4;
pub const TAG_MEDIA_CODEC: u8 = 0xd5;
pub const TAG_RATING: u8 = 0xf7;
pub const TAG_MULEVERSION: u8 = 0xfb;
pub const TAG_SERVER_NAME: u8 = TAG_NAME;
pub const TAG_SERVER_DESC: u8 = TAG_DESCRIPTION;

// OFFER_FILES completeness markers
pub const VAL_PARTIAL_ID: u32 = 0xfcfc_fcfc;
pub const VAL_PARTIAL_PORT: u16 = 0xfcfc;
pub const VAL_COMPLETE_ID: u32 = 0xfbfb_fbfb;
pub const VAL_COMPLETE_PORT: u16 = 0xfbfb;

// TCP server flags (ID_CHANGE)
pub const FLAG_ZLIB: u32 = 0x0001;
pub const FLAG_IPINLOGIN: u32 = 0x0002;
pub const FLAG_AUXPORT: u32 = 0x0004;
pub const FLAG_NEWTAGS: u32 = 0x0008;
pub const FLAG_UNICODE: u32 = 0x0010;
pub const FLAG_LARGEFILES: u32 = 0x0100;
pub const FLAG_SUPPORTCRYPT: u32 = 0x0200;
pub const FLAG_REQUESTCRYPT: u32 = 0x0400;
pub const FLAG_REQUIRECRYPT: u32 = 0x0800;

// UDP server flags (GLOBSERVSTATRES)
pub const FLAG_UDP_EXTGETSOURCES: u32 = 0x0001;
pub const FLAG_UDP_EXTGETFILES: u32 = 0x0002;
pub const FLAG_UDP_EXTGETSOURCES2: u32 = 0x0020;
pub const FLAG_UDP_OBFUSCATION: u32 = 0x0200;
pub const FLAG_TCP_OBFUSCATION: u32 = 0x0400;

pub const SERVER_VERSION_STR: &str = "v0.1.0";
pub const SERVER_VERSION_INT: u32 = 0x0000_0100;
pub const SERVER_NAME: &str = "ed2k-server";

/// Tag field code → attribute name
const TAG_NAMES: &[(u8, &str)] = &[
    (TAG_NAME, "name"),
    (TAG_SIZE, "size"),
    (TAG_SIZE_HI, "sizehi"),
    (TAG_TYPE, "type"),
    (TAG_FORMAT, "format"),
    (TAG_DESCRIPTION, "description"),
    (TAG_VERSION, "version"),
    (TAG_PORT, "port2"),
    (TAG_SOURCES, "sources"),
    (TAG_COMPLETE_SOURCES, "completesources"),
    (TAG_MULEVERSION, "muleversion"),
    (TAG_FLAGS, "flags"),
    (TAG_RATING, "rating"),
    (TAG_MEDIA_ARTIST, "artist"),
    (TAG_MEDIA_ALBUM, "album"),
    (TAG_MEDIA_TITLE, "title"),
    (TAG_MEDIA_LENGTH, "length"),
    (TAG_MEDIA_BITRATE, "bitrate"),
    (TAG_MEDIA_CODEC, "codec"),
    (TAG_SEARCHTREE, "searchtree"),
];

/// Opcode → name, TCP and UDP share one table
const OPCODE_NAMES: &[(u8, &str)] = &[
    (OP_LOGINREQUEST, "LOGINREQUEST"),
    (OP_HELLOANSWER, "HELLOANSWER"),
    (OP_SERVERMESSAGE, "SERVERMESSAGE"),
    (OP_SERVERSTATUS, "SERVERSTATUS"),
    (OP_IDCHANGE, "IDCHANGE"),
    (OP_GETSERVERLIST, "GETSERVERLIST"),
    (OP_OFFERFILES, "OFFERFILES"),
    (OP_SERVERLIST, "SERVERLIST"),
    (OP_SERVERIDENT, "SERVERIDENT"),
    (OP_GETSOURCES, "GETSOURCES"),
    (OP_FOUNDSOURCES, "FOUNDSOURCES"),
    (OP_SEARCHREQUEST, "SEARCHREQUEST"),
    (OP_SEARCHRESULT, "SEARCHRESULT"),
    (OP_CALLBACKREQUEST, "CALLBACKREQUEST"),
    (OP_CALLBACKREQUESTED, "CALLBACKREQUESTED"),
    (OP_CALLBACKFAILED, "CALLBACKFAILED"),
    (OP_GETSOURCES_OBFU, "GETSOURCES_OBFU"),
    (OP_FOUNDSOURCES_OBFU, "FOUNDSOURCES_OBFU"),
    (OP_GLOBSEARCHREQ3, "GLOBSEARCHREQ3"),
    (OP_GLOBSEARCHREQ2, "GLOBSEARCHREQ2"),
    (OP_GLOBGETSOURCES2, "GLOBGETSOURCES2"),
    (OP_GLOBSERVSTATREQ, "GLOBSERVSTATREQ"),
    (OP_GLOBSERVSTATRES, "GLOBSERVSTATRES"),
    (OP_GLOBSEARCHREQ, "GLOBSEARCHREQ"),
    (OP_GLOBSEARCHRES, "GLOBSEARCHRES"),
    (OP_GLOBGETSOURCES, "GLOBGETSOURCES"),
    (OP_GLOBFOUNDSOURCES, "GLOBFOUNDSOURCES"),
    (OP_SERVERDESCREQ, "SERVERDESCREQ"),
    (OP_SERVERDESCRES, "SERVERDESCRES"),
];

struct Tables {
    tag_by_code: HashMap<u8, &'static str>,
    tag_by_name: HashMap<&'static str, u8>,
    opcode_by_code: HashMap<u8, &'static str>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| Tables {
        tag_by_code: TAG_NAMES.iter().copied().collect(),
        tag_by_name: TAG_NAMES.iter().map(|&(code, name)| (name, code)).collect(),
        opcode_by_code: OPCODE_NAMES.iter().copied().collect(),
    })
}

/// Attribute name for a tag field code, if the code is known
pub fn tag_name(code: u8) -> Option<&'static str> {
    tables().tag_by_code.get(&code).copied()
}

/// Tag field code for an attribute name
pub fn tag_code(name: &str) -> Option<u8> {
    tables().tag_by_name.get(name).copied()
}

/// Human readable opcode name for logs
pub fn opcode_name(code: u8) -> &'static str {
    tables().opcode_by_code.get(&code).copied().unwrap_or("UNKNOWN")
}

/// Whether `byte` is one of the cleartext protocol codes
pub fn is_protocol(byte: u8) -> bool {
    matches!(byte, PR_ED2K | PR_EMULE | PR_ZLIB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_name_lookup() {
        assert_eq!(tag_name(TAG_NAME), Some("name"));
        assert_eq!(tag_name(TAG_MEDIA_CODEC), Some("codec"));
        assert_eq!(tag_name(0x77), None);
    }

    #[test]
    fn test_tag_code_inverse() {
        for &(code, name) in TAG_NAMES {
            assert_eq!(tag_code(name), Some(code));
        }
    }

    #[test]
    fn test_opcode_name() {
        assert_eq!(opcode_name(OP_IDCHANGE), "IDCHANGE");
        assert_eq!(opcode_name(OP_GLOBSERVSTATREQ), "GLOBSERVSTATREQ");
        assert_eq!(opcode_name(0xff), "UNKNOWN");
    }

    #[test]
    fn test_is_protocol() {
        assert!(is_protocol(PR_ED2K));
        assert!(is_protocol(PR_EMULE));
        assert!(is_protocol(PR_ZLIB));
        assert!(!is_protocol(0x00));
        assert!(!is_protocol(0xe4));
    }
}
