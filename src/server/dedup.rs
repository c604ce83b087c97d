use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{KvError, KvResponse, KvResult, MAX_VALUE_LENGTH, REQUEST_ID_SIZE, RequestId, encode_response};

/// Fixed bookkeeping bytes charged per cached entry.
pub const ENTRY_META_BYTES: usize = 12;
/// Bytes charged for a response rebuilt from a marker rather than stored bytes.
pub const REFERENCE_BYTES: usize = 8;
/// In-flight markers outlive completed entries by this many TTLs before the sweep
/// reclaims them.
pub const IN_FLIGHT_TTL_FACTOR: u32 = 4;

/// A finished response kept for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedResponse {
    Success,
    Value { value: Vec<u8>, version: i32 },
    /// Complete envelope bytes, replayed verbatim.
    Encoded(Vec<u8>),
}

impl CachedResponse {
    fn charge(&self) -> usize {
        match self {
            CachedResponse::Success => REFERENCE_BYTES,
            CachedResponse::Value { value, .. } => value.len(),
            CachedResponse::Encoded(bytes) => bytes.len(),
        }
    }

    /// Envelope bytes answering request `id`.
    pub fn to_bytes(&self, id: RequestId) -> KvResult<Vec<u8>> {
        match self {
            CachedResponse::Success => encode_response(id, &KvResponse::success()),
            CachedResponse::Value { value, version } => {
                encode_response(id, &KvResponse::with_value(value.clone(), *version))
            }
            CachedResponse::Encoded(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSlot {
    /// The request has been claimed and is being executed.
    InFlight,
    Done(CachedResponse),
}

impl CacheSlot {
    /// In-flight entries reserve room for the largest response they may produce.
    fn charge(&self) -> usize {
        match self {
            CacheSlot::InFlight => MAX_VALUE_LENGTH,
            CacheSlot::Done(response) => response.charge(),
        }
    }
}

struct CacheEntry {
    slot: CacheSlot,
    stored_at: Instant,
}

fn footprint(slot: &CacheSlot) -> usize {
    REQUEST_ID_SIZE + ENTRY_META_BYTES + slot.charge()
}

/// Byte-bounded map from request id to response, giving at-most-once execution.
///
/// Completed entries expire after the configured TTL, in-flight markers after
/// `IN_FLIGHT_TTL_FACTOR` TTLs.
pub struct DedupCache {
    capacity_bytes: usize,
    ttl: Duration,
    entries: DashMap<RequestId, CacheEntry>,
    used_bytes: Mutex<usize>,
}

impl DedupCache {
    pub fn new(capacity_bytes: usize, ttl: Duration) -> Self {
        Self {
            capacity_bytes,
            ttl,
            entries: DashMap::new(),
            used_bytes: Mutex::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lookup(&self, id: &RequestId) -> Option<CacheSlot> {
        self.entries.get(id).map(|entry| entry.slot.clone())
    }

    /// Marks `id` as in flight. Returns `Ok(false)` if the id is already known.
    pub fn claim(&self, id: RequestId) -> KvResult<bool> {
        self.install(id, CacheSlot::InFlight, false)
    }

    /// Stores the final response for `id`, replacing any in-flight marker.
    ///
    /// On capacity failure the in-flight marker is dropped as well.
    pub fn complete(&self, id: RequestId, response: CachedResponse) -> KvResult<()> {
        let result = self.install(id, CacheSlot::Done(response), true).map(|_| ());
        if result.is_err() {
            self.release(&id);
        }
        result
    }

    /// Forgets `id` so a retry with the same id is processed again.
    pub fn release(&self, id: &RequestId) {
        let mut used = self.used_bytes.lock();
        if let Some((_, entry)) = self.entries.remove(id) {
            *used -= footprint(&entry.slot);
        }
    }

    fn install(&self, id: RequestId, slot: CacheSlot, replace: bool) -> KvResult<bool> {
        let mut used = self.used_bytes.lock();
        let released = match self.entries.get(&id) {
            Some(_) if !replace => return Ok(false),
            Some(existing) => footprint(&existing.slot),
            None => 0,
        };
        let required = *used - released + footprint(&slot);
        if required > self.capacity_bytes {
            return Err(KvError::CacheFull {
                capacity: self.capacity_bytes,
            });
        }
        *used = required;
        self.entries.insert(
            id,
            CacheEntry {
                slot,
                stored_at: Instant::now(),
            },
        );
        Ok(true)
    }

    fn lifetime(&self, slot: &CacheSlot) -> Duration {
        match slot {
            CacheSlot::InFlight => self.ttl.saturating_mul(IN_FLIGHT_TTL_FACTOR),
            CacheSlot::Done(_) => self.ttl,
        }
    }

    /// Evicts entries past their lifetime. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let mut used = self.used_bytes.lock();
        let mut evicted = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.stored_at.elapsed() >= self.lifetime(&entry.slot);
            if expired {
                *used -= footprint(&entry.slot);
                evicted += 1;
            }
            !expired
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        *self.used_bytes.lock()
    }

    /// Runs `sweep` every half TTL.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let period = (cache.ttl / 2).max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = cache.len(), "Swept request cache");
                }
            }
        })
    }
}
