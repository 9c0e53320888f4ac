//! Session registry
//!
//! Hands out LowID slots and keeps the slot → connection map used by the
//! callback relay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::Ed2kError;
use crate::protocol::Message;
use crate::session::state::SessionHandle;

/// Largest id that still counts as a LowID
pub const LOW_ID_MAX: u32 = 0x00FF_FFFF;

/// Bounded id allocator with a wrapping cursor
#[derive(Debug)]
pub struct LowIdPool {
    min: u32,
    max: u32,
    cursor: u32,
    enabled: bool,
    used: HashSet<u32>,
}

impl LowIdPool {
    pub fn new(min: u32, max: u32, enabled: bool) -> Self {
        let min = min.max(1);
        let max = max.min(LOW_ID_MAX).max(min);
        Self {
            min,
            max,
            cursor: min,
            enabled,
            used: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Next free slot at or after the cursor, wrapping once around the range
    pub fn allocate(&mut self) -> Result<u32> {
        if !self.enabled {
            return Err(Ed2kError::resource_exhausted("LowIDs are disabled", "low_id").into());
        }
        if self.used.len() >= self.capacity() {
            warn!("LowID pool exhausted ({} in use)", self.used.len());
            return Err(Ed2kError::resource_exhausted(
                format!("No free LowID in {}..={}", self.min, self.max),
                "low_id",
            )
            .into());
        }

        loop {
            let candidate = self.cursor;
            self.cursor = if self.cursor >= self.max { self.min } else { self.cursor + 1 };
            if self.used.insert(candidate) {
                trace!("Allocated LowID {}", candidate);
                return Ok(candidate);
            }
        }
    }

    /// Returns false if `id` was not allocated
    pub fn release(&mut self, id: u32) -> bool {
        self.used.remove(&id)
    }
}

/// Shared state across all TCP connections
#[derive(Debug)]
pub struct SessionRegistry {
    pool: Mutex<LowIdPool>,
    low_ids: RwLock<HashMap<u32, SessionHandle>>,
    connections: Arc<AtomicUsize>,
}

/// One counted connection. The count drops with the slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SessionRegistry {
    pub fn new(pool: LowIdPool) -> Self {
        Self {
            pool: Mutex::new(pool),
            low_ids: RwLock::new(HashMap::new()),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate a slot and bind it to the connection's outbox
    pub async fn register_low_id(&self, handle: SessionHandle) -> Result<u32> {
        let id = self.pool.lock().await.allocate()?;
        let mut low_ids = self.low_ids.write().await;
        low_ids.insert(id, handle);
        debug!("Registered LowID {} (total: {})", id, low_ids.len());
        Ok(id)
    }

    pub async fn release_low_id(&self, id: u32) {
        let removed = self.low_ids.write().await.remove(&id).is_some();
        let freed = self.pool.lock().await.release(id);
        if removed || freed {
            debug!("Released LowID {}", id);
        }
    }

    pub async fn lookup(&self, id: u32) -> Option<SessionHandle> {
        self.low_ids.read().await.get(&id).cloned()
    }

    /// Queue `message` on the connection holding slot `id`. False when the
    /// slot is free or its outbox is unavailable.
    pub async fn relay(&self, id: u32, message: Message) -> bool {
        match self.lookup(id).await {
            Some(handle) => handle.send(message),
            None => {
                trace!("No session for LowID {}", id);
                false
            }
        }
    }

    pub async fn low_id_count(&self) -> usize {
        self.low_ids.read().await.len()
    }

    /// Count a new connection unless `limit` are already open. The check and
    /// the increment are a single atomic update.
    pub fn try_open_connection(&self, limit: usize) -> Option<ConnectionSlot> {
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| (open < limit).then_some(open + 1))
            .ok()?;
        Some(ConnectionSlot {
            connections: self.connections.clone(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}
