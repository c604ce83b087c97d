//! Consistent Hashing Module
//!
//! Maps keys to owning nodes via a ring of virtual nodes.
//!
//! ## Core Concepts
//! - **Virtual Nodes**: Each physical node places a fixed number of positions on a 64-bit
//!   hash circle, smoothing the key distribution.
//! - **Ownership**: A key belongs to the first virtual node at or clockwise after its hash,
//!   wrapping at the top of the circle.
//! - **Successors**: Replicas live on the next distinct physical nodes clockwise from the
//!   owning virtual node.
//! - **Directory**: `NodeDirectory` resolves node ids to the addresses nodes talk on.

pub mod directory;
pub mod hash_ring;
pub mod types;

pub use directory::NodeDirectory;
pub use hash_ring::{HashRing, RingSnapshot, ring_hash};
pub use types::{Direction, NodeAddress, NodeId, VirtualNode};

#[cfg(test)]
mod tests;
