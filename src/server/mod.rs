//! Request Serving Module
//!
//! The request path of a node, from datagram to reply.
//!
//! ## Responsibilities
//! - **Transport**: The `Transport` seam every outbound datagram goes through, with the
//!   UDP implementation used in production.
//! - **Deduplication**: `DedupCache` gives at-most-once execution per request id and
//!   replays finished responses.
//! - **Retrying Client**: Node-to-node calls with exponential backoff on one shared
//!   timer table.
//! - **Dispatch**: `RequestDispatcher` routes keyed commands to their owner, executes
//!   locally owned ones and fans out replicas.
//! - **Wiring**: `KvNode` assembles the components and runs the socket loops.

pub mod client;
pub mod dedup;
pub mod dispatcher;
pub mod node;
pub mod transport;

pub use client::{ClientSettings, RetryingClient};
pub use dedup::{CacheSlot, CachedResponse, DedupCache};
pub use dispatcher::{DispatcherSettings, RequestDispatcher};
pub use node::{KvNode, NodeTransports};
pub use transport::{Transport, UdpTransport};

#[cfg(test)]
pub(crate) mod testing;
