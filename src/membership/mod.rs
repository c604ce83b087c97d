//! Membership & Failure Detection Module
//!
//! Implements a gossip-based failure detector over the static node table and the
//! coordinator that turns its verdicts into ring changes.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Every round a node pushes a digest of the counters of all nodes
//!   it believes alive to one random peer.
//! - **Failure Detection**: A node silent for more than `failure_mark` rounds is
//!   suspected at once (alive count drops) and removed from the ring only after
//!   `failure_mark / 2` further stale rounds.
//! - **Anti-Flapping**: A removed node must be confirmed fresh more than
//!   `alive_round_limit` times before it rejoins the ring.
//! - **Coordination**: `MembershipCoordinator` updates the ring and hands affected data
//!   to the migrator and replicator.

pub mod coordinator;
pub mod service;
pub mod types;

pub use coordinator::MembershipCoordinator;
pub use service::{GossipFailureDetector, GossipSettings};
pub use types::{MembershipEvent, MembershipListener, NodeStatus, SystemImage};

#[cfg(test)]
mod tests;
