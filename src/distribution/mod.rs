//! Data Distribution Module
//!
//! Background movement of keys in response to topology change.
//!
//! ## Responsibilities
//! - **Migration**: Transfer keys to a newly joined node that now owns them, then drop
//!   the local copy.
//! - **Replication**: Re-push replicas of partitions whose successor or predecessor set
//!   changed.
//! - **Consistency Sweep**: Periodically delete replicas stranded by earlier changes.
//!
//! Migration and replication are debounced: requests within one delay window share a
//! single scan, and transfers yield every `batch_size` PUTs.

use std::time::Duration;

pub mod checkup;
pub mod migrator;
pub mod replicator;

pub use checkup::ConsistencySweep;
pub use migrator::Migrator;
pub use replicator::Replicator;

/// Pacing shared by the migrator and the replicator.
#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub delay: Duration,
    pub batch_size: usize,
    pub yield_interval: Duration,
}
