//! Distributed Key-Value Store Library
//!
//! This library crate defines the core modules of a partitioned, replicated key-value
//! node reachable over UDP. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of loosely coupled subsystems:
//!
//! - **`config`**: Operator tunables (replication factor, virtual nodes, capacities,
//!   gossip and migration timing) loaded from TOML and CLI flags.
//! - **`protocol`**: The wire contract. Command and error codes, request/response
//!   messages, the request envelope and the error taxonomy.
//! - **`ring`**: Consistent hashing with virtual nodes. Maps every key to an owning node
//!   and answers successor/predecessor queries used by replication.
//! - **`storage`**: The local replica. A byte-bounded map whose writes are ordered by
//!   vector clocks.
//! - **`membership`**: Gossip-based failure detection (per-node liveness state machine)
//!   and the coordinator that reacts to Join/Leave events.
//! - **`distribution`**: Background data movement. Migration of keys to joining nodes,
//!   re-replication after topology change, and the periodic stale-replica sweep.
//! - **`server`**: The request path. Deduplication cache, at-most-once retrying client,
//!   the request dispatcher and the node wiring over UDP sockets.

pub mod config;
pub mod distribution;
pub mod membership;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod storage;
