use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use super::vector_clock::{ClockOrdering, VectorClock};
use crate::protocol::{KvError, KvResult};
use crate::ring::NodeId;

/// Bookkeeping bytes charged per stored entry on top of key and value.
pub const ENTRY_OVERHEAD_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub version: i32,
    pub clock: VectorClock,
}

impl StoredEntry {
    fn footprint(&self, key: &[u8]) -> usize {
        key.len() + self.value.len() + ENTRY_OVERHEAD_BYTES
    }
}

/// Local replica of the keys this node owns or backs up.
///
/// Reads are lock-free. Writes serialize on the size counter so clock comparison,
/// capacity accounting and the insert happen as one step.
pub struct ReplicatedStore {
    node_id: NodeId,
    capacity_bytes: usize,
    entries: DashMap<Vec<u8>, StoredEntry>,
    used_bytes: Mutex<usize>,
}

impl ReplicatedStore {
    pub fn new(node_id: NodeId, capacity_bytes: usize) -> Self {
        Self {
            node_id,
            capacity_bytes,
            entries: DashMap::new(),
            used_bytes: Mutex::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Applies a write and returns the entry as stored afterwards.
    ///
    /// - Without an incoming clock the existing clock (or an empty one) is advanced at
    ///   this node's component and the write always wins.
    /// - With an incoming clock the write wins if it is `Larger`, is discarded if it is
    ///   `Smaller` or `Equal`, and a coin flip decides `Concurrent` writes.
    pub fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        version: i32,
        incoming: Option<VectorClock>,
    ) -> KvResult<StoredEntry> {
        let mut used = self.used_bytes.lock();
        let existing = self.entries.get(key).map(|entry| entry.value().clone());

        let clock = match (incoming, &existing) {
            (None, Some(current)) => current.clock.increment(self.node_id)?,
            (None, None) => VectorClock::new().increment(self.node_id)?,
            (Some(clock), None) => clock,
            (Some(clock), Some(current)) => {
                let accept = match clock.compare(&current.clock) {
                    ClockOrdering::Larger => true,
                    ClockOrdering::Smaller | ClockOrdering::Equal => false,
                    ClockOrdering::Concurrent => rand::thread_rng().gen_bool(0.5),
                };
                if !accept {
                    tracing::debug!(node = %self.node_id, "Discarded stale write");
                    return Ok(current.clone());
                }
                clock
            }
        };

        let entry = StoredEntry { value, version, clock };
        let released = existing.as_ref().map_or(0, |old| old.footprint(key));
        let required = *used - released + entry.footprint(key);
        if required > self.capacity_bytes {
            return Err(KvError::StoreFull {
                capacity: self.capacity_bytes,
            });
        }

        *used = required;
        self.entries.insert(key.to_vec(), entry.clone());
        Ok(entry)
    }

    pub fn get(&self, key: &[u8]) -> Option<StoredEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&self, key: &[u8]) -> bool {
        let mut used = self.used_bytes.lock();
        match self.entries.remove(key) {
            Some((key, entry)) => {
                *used -= entry.footprint(&key);
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        let mut used = self.used_bytes.lock();
        self.entries.clear();
        *used = 0;
    }

    /// Point-in-time copy of the stored keys.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
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

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}
