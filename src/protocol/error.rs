use thiserror::Error;

use super::types::ErrorCode;
use crate::ring::NodeId;

/// Failures raised while serving a request.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key must be 1 to 32 bytes, got {len}")]
    InvalidKey { len: usize },

    #[error("value of {len} bytes exceeds the {max} byte limit")]
    InvalidValue { len: usize, max: usize },

    #[error("key does not exist")]
    NonExistentKey,

    #[error("store capacity of {capacity} bytes exhausted")]
    StoreFull { capacity: usize },

    #[error("request cache capacity of {capacity} bytes exhausted")]
    CacheFull { capacity: usize },

    #[error("node {0} is still receiving migrated keys")]
    MigrationInProgress(NodeId),

    #[error("hash ring has no members")]
    NoOwner,

    #[error("no route to node {0}")]
    NoRoute(NodeId),

    #[error("no response after {attempts} attempts")]
    DeliveryFailed { attempts: u32 },

    #[error("unrecognized command 0x{0:02x}")]
    UnrecognizedCommand(u8),

    #[error("invalid node address `{0}`")]
    InvalidAddress(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("internal failure: {0}")]
    Internal(String),
}

impl KvError {
    /// Wire code reported to the client for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            KvError::InvalidKey { .. } => ErrorCode::InvalidKey,
            KvError::InvalidValue { .. } => ErrorCode::InvalidValue,
            KvError::NonExistentKey => ErrorCode::NonExistentKey,
            KvError::StoreFull { .. }
            | KvError::CacheFull { .. }
            | KvError::MigrationInProgress(_)
            | KvError::NoOwner
            | KvError::NoRoute(_)
            | KvError::DeliveryFailed { .. } => ErrorCode::SystemOverload,
            KvError::UnrecognizedCommand(_) => ErrorCode::UnrecognizedCommand,
            KvError::InvalidAddress(_) | KvError::Codec(_) | KvError::Internal(_) => {
                ErrorCode::InternalFailure
            }
        }
    }

    /// Routing conditions expected to clear on their own. Responses for these are
    /// not cached so a retry of the same request id is served afresh.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KvError::MigrationInProgress(_) | KvError::NoOwner | KvError::NoRoute(_)
        )
    }
}

pub type KvResult<T> = Result<T, KvError>;
