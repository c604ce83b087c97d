use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::{KvError, KvResult};
use crate::storage::vector_clock::VectorClock;

// --- Limits ---

/// Maximum key length in bytes. Keys must also be non-empty.
pub const MAX_KEY_LENGTH: usize = 32;
/// Maximum value length in bytes.
pub const MAX_VALUE_LENGTH: usize = 10_000;
/// Size of the unique request identifier carried by every envelope.
pub const REQUEST_ID_SIZE: usize = 16;
/// Largest datagram a node will read from a socket.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

// --- Command Codes ---

/// Operation requested by a client or a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Put,
    Get,
    Remove,
    Shutdown,
    Wipeout,
    IsAlive,
    GetPid,
    GetMembershipCount,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Put => 0x01,
            Command::Get => 0x02,
            Command::Remove => 0x03,
            Command::Shutdown => 0x04,
            Command::Wipeout => 0x05,
            Command::IsAlive => 0x06,
            Command::GetPid => 0x07,
            Command::GetMembershipCount => 0x08,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = KvError;

    fn try_from(code: u8) -> KvResult<Self> {
        Ok(match code {
            0x01 => Command::Put,
            0x02 => Command::Get,
            0x03 => Command::Remove,
            0x04 => Command::Shutdown,
            0x05 => Command::Wipeout,
            0x06 => Command::IsAlive,
            0x07 => Command::GetPid,
            0x08 => Command::GetMembershipCount,
            other => return Err(KvError::UnrecognizedCommand(other)),
        })
    }
}

// --- Error Codes ---

/// Result code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    NonExistentKey,
    OutOfSpace,
    SystemOverload,
    InternalFailure,
    UnrecognizedCommand,
    InvalidKey,
    InvalidValue,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        match self {
            ErrorCode::Success => 0x00,
            ErrorCode::NonExistentKey => 0x01,
            ErrorCode::OutOfSpace => 0x02,
            ErrorCode::SystemOverload => 0x03,
            ErrorCode::InternalFailure => 0x04,
            ErrorCode::UnrecognizedCommand => 0x05,
            ErrorCode::InvalidKey => 0x06,
            ErrorCode::InvalidValue => 0x07,
        }
    }
}

// --- Request Identity ---

/// 16-byte unique identifier of a request.
///
/// Layout: 4 bytes IPv4 address of the issuing node, 2 bytes port, 2 random bytes,
/// 8 bytes of a process-wide strictly increasing nanosecond clock. The same id is kept
/// across forwarding hops so every node on the path deduplicates the same request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub [u8; REQUEST_ID_SIZE]);

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

fn next_stamp() -> u64 {
    let origin = CLOCK_ORIGIN.get_or_init(Instant::now);
    let now = origin.elapsed().as_nanos() as u64;
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(seen) => last = seen,
        }
    }
}

impl RequestId {
    pub fn generate(issuer: SocketAddr) -> Self {
        let mut bytes = [0u8; REQUEST_ID_SIZE];
        if let IpAddr::V4(v4) = issuer.ip() {
            bytes[0..4].copy_from_slice(&v4.octets());
        }
        bytes[4..6].copy_from_slice(&issuer.port().to_be_bytes());
        let salt: [u8; 2] = rand::thread_rng().r#gen();
        bytes[6..8].copy_from_slice(&salt);
        bytes[8..16].copy_from_slice(&next_stamp().to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// --- Envelope ---

/// Outermost framing of every client/node datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: RequestId,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(id: RequestId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn encode(&self) -> KvResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> KvResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// --- Messages ---

/// Application request carried in an envelope payload.
///
/// `is_replica` marks node-to-node replica pushes, which are stored without
/// ownership checks or further replication. `reply_to` is set by the first node
/// that forwards a request so the owner can answer the client directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRequest {
    pub command: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: i32,
    pub vector_clock: Option<VectorClock>,
    pub is_replica: bool,
    pub reply_to: Option<SocketAddr>,
}

impl KvRequest {
    pub fn new(command: Command) -> Self {
        Self {
            command: command.code(),
            key: Vec::new(),
            value: Vec::new(),
            version: 0,
            vector_clock: None,
            is_replica: false,
            reply_to: None,
        }
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, version: i32) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            ..Self::new(Command::Put)
        }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Command::Get)
        }
    }

    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Self::new(Command::Remove)
        }
    }

    /// PUT carrying an existing clock, used for migration and replica pushes.
    pub fn transfer(key: &[u8], value: &[u8], version: i32, clock: VectorClock, is_replica: bool) -> Self {
        Self {
            vector_clock: Some(clock),
            is_replica,
            ..Self::put(key, value, version)
        }
    }

    pub fn command(&self) -> KvResult<Command> {
        Command::try_from(self.command)
    }

    pub fn encode(&self) -> KvResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> KvResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Application response carried in an envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvResponse {
    pub err_code: ErrorCode,
    pub value: Option<Vec<u8>>,
    pub version: Option<i32>,
    pub pid: Option<u32>,
    pub membership_count: Option<u32>,
    pub overload_wait_ms: Option<u32>,
}

impl KvResponse {
    pub fn error(err_code: ErrorCode) -> Self {
        Self {
            err_code,
            value: None,
            version: None,
            pid: None,
            membership_count: None,
            overload_wait_ms: None,
        }
    }

    pub fn success() -> Self {
        Self::error(ErrorCode::Success)
    }

    pub fn with_value(value: Vec<u8>, version: i32) -> Self {
        Self {
            value: Some(value),
            version: Some(version),
            ..Self::success()
        }
    }

    pub fn with_pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::success()
        }
    }

    pub fn with_membership_count(count: u32) -> Self {
        Self {
            membership_count: Some(count),
            ..Self::success()
        }
    }

    pub fn overload(wait_ms: u32) -> Self {
        Self {
            overload_wait_ms: Some(wait_ms),
            ..Self::error(ErrorCode::SystemOverload)
        }
    }

    /// Response for a failed operation. Overload responses carry the wait hint.
    pub fn from_error(err: &KvError, wait_ms: u32) -> Self {
        match err.code() {
            ErrorCode::SystemOverload => Self::overload(wait_ms),
            code => Self::error(code),
        }
    }

    pub fn encode(&self) -> KvResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> KvResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

// --- Validation ---

pub fn validate_key(key: &[u8]) -> KvResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(KvError::InvalidKey { len: key.len() });
    }
    Ok(())
}

pub fn validate_value(value: &[u8]) -> KvResult<()> {
    if value.len() > MAX_VALUE_LENGTH {
        return Err(KvError::InvalidValue { len: value.len(), max: MAX_VALUE_LENGTH });
    }
    Ok(())
}

/// GET and REMOVE must not carry a value.
pub fn validate_empty_value(value: &[u8]) -> KvResult<()> {
    if !value.is_empty() {
        return Err(KvError::InvalidValue { len: value.len(), max: 0 });
    }
    Ok(())
}

/// Encodes `response` inside an envelope addressed by `id`.
pub fn encode_response(id: RequestId, response: &KvResponse) -> KvResult<Vec<u8>> {
    Envelope::new(id, response.encode()?).encode()
}
