//! Key-Value Network Protocol
//!
//! Defines the messages exchanged between clients and nodes, and between nodes
//! (forwarding, replication, migration).
//!
//! ## Core Concepts
//! - **Envelope**: Every datagram carries a 16-byte request id and an opaque payload.
//!   The id is the idempotency key used by the dedup cache.
//! - **Commands**: PUT/GET/REMOVE are routed by key ownership; the remaining
//!   commands are answered by the receiving node.
//! - **Errors**: `KvError` is the internal taxonomy; each variant maps to a wire
//!   `ErrorCode` the client understands.

pub mod error;
pub mod types;

pub use error::{KvError, KvResult};
pub use types::*;
