//! Replicated Storage Module
//!
//! Implements the node-local, byte-bounded key-value map.
//!
//! ## Core Concepts
//! - **Vector Clocks**: Every entry carries a per-node counter map so writes arriving from
//!   migration or replication can be ordered against the local copy.
//! - **Capacity**: The store charges `key + value + 8` bytes per entry and refuses writes
//!   that would exceed its configured capacity.
//! - **Conflict Policy**: Newer clocks replace, older or equal clocks are discarded and
//!   concurrent clocks are settled by a coin flip.

pub mod store;
pub mod vector_clock;

pub use store::{ENTRY_OVERHEAD_BYTES, ReplicatedStore, StoredEntry};
pub use vector_clock::{ClockOrdering, VectorClock};
