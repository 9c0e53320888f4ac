//! Shared file metadata
//!
//! Files arrive in OFFER_FILES as hash + id/port + tag list and leave again
//! in SEARCH_RESULT / GLOBSEARCHRES with a normalised tag set.

use anyhow::Result;

use crate::protocol::constants::*;
use crate::protocol::cursor::ByteCursor;
use crate::protocol::tags::{decode_tags, encode_tags, to_attributes, Attributes, Tag, TagValue};

const VIDEO: &[&str] = &[
    "3gp", "aaf", "asf", "avchd", "avi", "fla", "flv", "m1v", "m2v", "m4v", "mp4", "mpg", "mpe", "mpeg", "mov",
    "mkv", "ogg", "rm", "svi",
];
const AUDIO: &[&str] = &[
    "aiff", "au", "wav", "flac", "la", "pac", "m4a", "ape", "rka", "shn", "tta", "wv", "wma", "brstm", "amr", "mp2",
    "mp3", "aac", "mpc", "ra", "ots", "vox", "voc", "mid", "mod", "s3m", "xm", "it",
];
const IMAGE: &[&str] = &[
    "cr2", "pdn", "pgm", "pict", "bmp", "png", "dib", "djvu", "gif", "psd", "pdd", "icns", "ico", "rle", "tga",
    "jpeg", "jpg", "tiff", "tif", "jp2", "jps", "mng", "xbm", "xcf", "pcx",
];
const PRO: &[&str] = &[
    "7z", "ace", "arc", "arj", "bzip2", "cab", "gzip", "rar", "tar", "zip", "iso", "nrg", "img", "adf", "dmg", "cue",
    "bin", "cif", "ccd", "sub", "raw",
];

/// Lower-cased extension of a file name, empty when there is none
pub fn extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => name[idx + 1..].to_lowercase(),
        None => String::new(),
    }
}

/// ed2k file type guessed from the extension
pub fn file_type(name: &str) -> &'static str {
    let ext = extension(name);
    let ext = ext.as_str();
    if VIDEO.contains(&ext) {
        "Video"
    } else if AUDIO.contains(&ext) {
        "Audio"
    } else if IMAGE.contains(&ext) {
        "Image"
    } else if PRO.contains(&ext) {
        "Pro"
    } else {
        ""
    }
}

/// Normalised file metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub hash: [u8; 16],
    pub size: u64,
    pub name: String,
    pub file_type: String,
    pub extension: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub codec: String,
    /// Seconds
    pub length: u32,
    pub bitrate: u32,
}

impl FileInfo {
    /// Build metadata from named tag attributes. SIZE and SIZE_HI combine
    /// into the 64-bit size; a missing type is guessed from the name.
    pub fn from_attributes(hash: [u8; 16], attributes: &Attributes) -> Self {
        let text = |key: &str| {
            attributes
                .get(key)
                .and_then(TagValue::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        let number = |key: &str| attributes.get(key).and_then(TagValue::as_u32).unwrap_or(0);

        let name = text("name");
        let size = number("size") as u64 | ((number("sizehi") as u64) << 32);
        let mut file_type = text("type");
        if file_type.is_empty() {
            file_type = file_type_of(&name);
        }
        let mut ext = text("format");
        if ext.is_empty() {
            ext = extension(&name);
        }

        Self {
            hash,
            size,
            extension: ext,
            file_type,
            title: text("title"),
            artist: text("artist"),
            album: text("album"),
            codec: text("codec"),
            length: number("length"),
            bitrate: number("bitrate"),
            name,
        }
    }

    /// Tags sent back to clients in search results
    pub fn result_tags(&self, sources: u32, complete_sources: u32) -> Vec<Tag> {
        let mut tags = vec![
            Tag::string(TAG_NAME, self.name.clone()),
            Tag::uint32(TAG_SIZE, self.size as u32),
            Tag::string(TAG_TYPE, self.file_type.clone()),
            Tag::uint32(TAG_SOURCES, sources),
            Tag::uint32(TAG_COMPLETE_SOURCES, complete_sources),
        ];
        if self.size > u32::MAX as u64 {
            tags.push(Tag::uint32(TAG_SIZE_HI, (self.size >> 32) as u32));
        }
        if !self.title.is_empty() {
            tags.push(Tag::string(TAG_MEDIA_TITLE, self.title.clone()));
        }
        if !self.artist.is_empty() {
            tags.push(Tag::string(TAG_MEDIA_ARTIST, self.artist.clone()));
        }
        if !self.album.is_empty() {
            tags.push(Tag::string(TAG_MEDIA_ALBUM, self.album.clone()));
        }
        if self.length > 0 {
            tags.push(Tag::uint32(TAG_MEDIA_LENGTH, self.length));
        }
        if self.bitrate > 0 {
            tags.push(Tag::uint32(TAG_MEDIA_BITRATE, self.bitrate));
        }
        if !self.codec.is_empty() {
            tags.push(Tag::string(TAG_MEDIA_CODEC, self.codec.clone()));
        }
        tags
    }
}

fn file_type_of(name: &str) -> String {
    file_type(name).to_string()
}

/// One entry of an OFFER_FILES list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedFile {
    pub info: FileInfo,
    pub complete: bool,
}

impl OfferedFile {
    /// Read `hash + id + port + tags`. Unmarked files count as complete.
    pub fn read(cursor: &mut ByteCursor) -> Result<Self> {
        let hash = cursor.read_hash()?;
        let id = cursor.read_u32()?;
        let port = cursor.read_u16()?;
        let tags = decode_tags(cursor)?;

        let complete = !(id == VAL_PARTIAL_ID && port == VAL_PARTIAL_PORT);
        let info = FileInfo::from_attributes(hash, &to_attributes(&tags));
        Ok(Self { info, complete })
    }

    /// Write in OFFER_FILES layout using the completeness marker as id/port
    pub fn write(&self, cursor: &mut ByteCursor) {
        let (id, port) = if self.complete {
            (VAL_COMPLETE_ID, VAL_COMPLETE_PORT)
        } else {
            (VAL_PARTIAL_ID, VAL_PARTIAL_PORT)
        };
        cursor.write_hash(&self.info.hash).write_u32(id).write_u16(port);
        let mut tags = vec![
            Tag::string(TAG_NAME, self.info.name.clone()),
            Tag::uint32(TAG_SIZE, self.info.size as u32),
        ];
        if self.info.size > u32::MAX as u64 {
            tags.push(Tag::uint32(TAG_SIZE_HI, (self.info.size >> 32) as u32));
        }
        if !self.info.file_type.is_empty() {
            tags.push(Tag::string(TAG_TYPE, self.info.file_type.clone()));
        }
        encode_tags(cursor, &tags);
    }
}

/// A file matched by a search, with the source advertised in the result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub info: FileInfo,
    pub client_id: u32,
    pub port: u16,
    pub sources: u32,
    pub complete_sources: u32,
}

impl SearchHit {
    /// `hash + id + port + tags`
    pub fn write(&self, cursor: &mut ByteCursor) {
        cursor
            .write_hash(&self.info.hash)
            .write_u32(self.client_id)
            .write_u16(self.port);
        encode_tags(cursor, &self.info.result_tags(self.sources, self.complete_sources));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_extension() {
        assert_eq!(file_type("Movie.AVI"), "Video");
        assert_eq!(file_type("song.mp3"), "Audio");
        assert_eq!(file_type("debian.iso"), "Pro");
        assert_eq!(file_type("photo.jpg"), "Image");
        assert_eq!(file_type("README"), "");
        assert_eq!(extension("archive.tar.GZ"), "gz");
    }

    #[test]
    fn test_offered_file_large_size() {
        let offered = OfferedFile {
            info: FileInfo {
                hash: [7; 16],
                size: 5 * 1024 * 1024 * 1024,
                name: "big.mkv".to_string(),
                file_type: "Video".to_string(),
                ..Default::default()
            },
            complete: false,
        };
        let mut cursor = ByteCursor::new();
        offered.write(&mut cursor);

        let mut reader = ByteCursor::from_vec(cursor.into_written());
        let read = OfferedFile::read(&mut reader).unwrap();
        assert!(!read.complete);
        assert_eq!(read.info.size, 5 * 1024 * 1024 * 1024);
        assert_eq!(read.info.name, "big.mkv");
        assert_eq!(read.info.extension, "mkv");
        assert_eq!(read.info.file_type, "Video");
    }

    #[test]
    fn test_offered_file_without_marker_is_complete() {
        let mut cursor = ByteCursor::new();
        cursor.write_hash(&[1; 16]).write_u32(0x0a000001).write_u16(4662);
        encode_tags(&mut cursor, &[Tag::string(TAG_NAME, "track.flac"), Tag::uint32(TAG_SIZE, 1000)]);

        let mut reader = ByteCursor::from_vec(cursor.into_written());
        let read = OfferedFile::read(&mut reader).unwrap();
        assert!(read.complete);
        assert_eq!(read.info.file_type, "Audio");
        assert_eq!(read.info.size, 1000);
    }

    #[test]
    fn test_result_tags_optional_fields() {
        let info = FileInfo {
            name: "a.mp3".to_string(),
            size: 10,
            file_type: "Audio".to_string(),
            bitrate: 320,
            ..Default::default()
        };
        let tags = info.result_tags(3, 1);
        let codes: Vec<u8> = tags.iter().map(|t| t.code).collect();
        assert_eq!(
            codes,
            vec![TAG_NAME, TAG_SIZE, TAG_TYPE, TAG_SOURCES, TAG_COMPLETE_SOURCES, TAG_MEDIA_BITRATE]
        );
    }
}
