//! Client and file directory
//!
//! The server keeps no persistent state of its own. Who is online, which
//! files they share and the list of known servers live behind the
//! `Directory` trait. `MemoryDirectory` is the in-process implementation.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::protocol::constants::*;
use crate::protocol::{BoolOp, Endpoint, FileInfo, OfferedFile, SearchExpr, SearchField, SearchHit};
use crate::session::ClientSession;

/// Most sources returned for one file, the FOUND_SOURCES count is a u8
pub const MAX_SOURCES: usize = 255;

/// Most files returned for one search
pub const MAX_SEARCH_RESULTS: usize = 255;

/// A client sharing a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    /// HighID or LowID
    pub client_id: u32,
    pub port: u16,
}

/// Storage seen by the protocol layer. Calls may take arbitrarily long and
/// may fail with `DirectoryUnavailable`.
#[async_trait]
pub trait Directory: Send + Sync {
    // ==================== Clients ====================

    /// Is a client with this hash already online?
    async fn is_connected(&self, hash: &[u8; 16]) -> Result<bool>;

    /// Mark a client online, returning its storage id. The check and the
    /// insert are one step: `None` means the hash is already online.
    async fn register(&self, session: &ClientSession) -> Result<Option<u64>>;

    /// Forget a client and withdraw its sources
    async fn unregister(&self, storage_id: u64) -> Result<()>;

    async fn client_count(&self) -> Result<u32>;

    // ==================== Files ====================

    /// Record `source` as sharing `file`
    async fn add_source(&self, storage_id: u64, source: Source, file: &OfferedFile) -> Result<()>;

    /// Sources of a file; `None` matches any size
    async fn get_sources(&self, hash: &[u8; 16], size: Option<u64>) -> Result<Vec<Source>>;

    /// Files matching a search tree
    async fn find(&self, expr: &SearchExpr) -> Result<Vec<SearchHit>>;

    async fn file_count(&self) -> Result<u32>;

    // ==================== Servers ====================

    async fn servers(&self) -> Result<Vec<Endpoint>>;
}

#[derive(Debug, Clone)]
struct ClientRecord {
    hash: [u8; 16],
}

#[derive(Debug, Clone)]
struct SourceRecord {
    source: Source,
    complete: bool,
    /// Offer order, newest first when listing
    offered: u64,
}

#[derive(Debug, Clone)]
struct FileRecord {
    info: FileInfo,
    sources: HashMap<u64, SourceRecord>,
}

impl FileRecord {
    fn complete_sources(&self) -> u32 {
        self.sources.values().filter(|s| s.complete).count() as u32
    }

    fn newest(&self) -> Option<&SourceRecord> {
        self.sources.values().max_by_key(|s| s.offered)
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    clients: HashMap<u64, ClientRecord>,
    by_hash: HashMap<[u8; 16], u64>,
    files: HashMap<([u8; 16], u64), FileRecord>,
    next_client: u64,
    offers: u64,
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
    servers: Vec<Endpoint>,
}

impl MemoryDirectory {
    pub fn new(servers: Vec<Endpoint>) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            servers,
        }
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn is_connected(&self, hash: &[u8; 16]) -> Result<bool> {
        Ok(self.state.read().await.by_hash.contains_key(hash))
    }

    async fn register(&self, session: &ClientSession) -> Result<Option<u64>> {
        let mut state = self.state.write().await;
        if state.by_hash.contains_key(&session.hash) {
            debug!("Client {} already online", session.hash_hex());
            return Ok(None);
        }
        state.next_client += 1;
        let id = state.next_client;
        state.by_hash.insert(session.hash, id);
        state.clients.insert(id, ClientRecord { hash: session.hash });
        debug!("Client {} online as {} (total: {})", session.hash_hex(), id, state.clients.len());
        Ok(Some(id))
    }

    async fn unregister(&self, storage_id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.remove(&storage_id) else {
            return Ok(());
        };
        state.by_hash.remove(&client.hash);
        trace!("Client {} offline", hex::encode(client.hash));
        state.files.retain(|_, file| {
            file.sources.remove(&storage_id);
            !file.sources.is_empty()
        });
        Ok(())
    }

    async fn client_count(&self) -> Result<u32> {
        Ok(self.state.read().await.clients.len() as u32)
    }

    async fn add_source(&self, storage_id: u64, source: Source, file: &OfferedFile) -> Result<()> {
        let mut state = self.state.write().await;
        state.offers += 1;
        let offered = state.offers;

        let record = state
            .files
            .entry((file.info.hash, file.info.size))
            .or_insert_with(|| FileRecord {
                info: file.info.clone(),
                sources: HashMap::new(),
            });
        // latest offer wins for name and media tags
        record.info = file.info.clone();
        record.sources.insert(
            storage_id,
            SourceRecord {
                source,
                complete: file.complete,
                offered,
            },
        );
        trace!("Source {} for {} ({} sources)", storage_id, hex::encode(file.info.hash), record.sources.len());
        Ok(())
    }

    async fn get_sources(&self, hash: &[u8; 16], size: Option<u64>) -> Result<Vec<Source>> {
        let state = self.state.read().await;
        let mut records: Vec<&SourceRecord> = state
            .files
            .iter()
            .filter(|((h, s), _)| h == hash && size.map_or(true, |size| size == *s))
            .flat_map(|(_, file)| file.sources.values())
            .collect();
        records.sort_by(|a, b| b.offered.cmp(&a.offered));
        Ok(records.into_iter().take(MAX_SOURCES).map(|r| r.source).collect())
    }

    async fn find(&self, expr: &SearchExpr) -> Result<Vec<SearchHit>> {
        let state = self.state.read().await;
        let hits: Vec<SearchHit> = state
            .files
            .values()
            .filter(|file| matches(expr, file))
            .filter_map(|file| {
                let newest = file.newest()?;
                Some(SearchHit {
                    info: file.info.clone(),
                    client_id: newest.source.client_id,
                    port: newest.source.port,
                    sources: file.sources.len() as u32,
                    complete_sources: file.complete_sources(),
                })
            })
            .take(MAX_SEARCH_RESULTS)
            .collect();
        debug!("Search {} matched {} files", expr, hits.len());
        Ok(hits)
    }

    async fn file_count(&self) -> Result<u32> {
        Ok(self.state.read().await.files.len() as u32)
    }

    async fn servers(&self) -> Result<Vec<Endpoint>> {
        Ok(self.servers.clone())
    }
}

fn matches(expr: &SearchExpr, file: &FileRecord) -> bool {
    match expr {
        SearchExpr::Bool { op, left, right } => {
            let left = matches(left, file);
            match op {
                BoolOp::And => left && matches(right, file),
                BoolOp::Or => left || matches(right, file),
                BoolOp::AndNot => left && !matches(right, file),
            }
        }
        SearchExpr::Text(text) => {
            let name = file.info.name.to_lowercase();
            text.split_whitespace().all(|word| name.contains(&word.to_lowercase()))
        }
        SearchExpr::StringMatch { value, field } => {
            let info = &file.info;
            match field.code() {
                Some(TAG_NAME) => info.name.to_lowercase().contains(&value.to_lowercase()),
                Some(TAG_TYPE) => info.file_type.eq_ignore_ascii_case(value),
                Some(TAG_FORMAT) => info.extension.eq_ignore_ascii_case(value),
                Some(TAG_MEDIA_CODEC) => info.codec.eq_ignore_ascii_case(value),
                Some(TAG_MEDIA_ARTIST) => info.artist.eq_ignore_ascii_case(value),
                Some(TAG_MEDIA_ALBUM) => info.album.eq_ignore_ascii_case(value),
                Some(TAG_MEDIA_TITLE) => info.title.eq_ignore_ascii_case(value),
                _ => unsupported(field),
            }
        }
        SearchExpr::Numeric { value, comparison, field } => {
            let actual = match field.code() {
                Some(TAG_SIZE) => file.info.size,
                Some(TAG_SOURCES) => file.sources.len() as u64,
                Some(TAG_COMPLETE_SOURCES) => file.complete_sources() as u64,
                Some(TAG_MEDIA_BITRATE) => file.info.bitrate as u64,
                Some(TAG_MEDIA_LENGTH) => file.info.length as u64,
                _ => return unsupported(field),
            };
            comparison.holds(actual, *value)
        }
    }
}

/// Constraints on unknown fields do not filter
fn unsupported(field: &SearchField) -> bool {
    trace!("Ignoring search constraint on {}", field);
    true
}
