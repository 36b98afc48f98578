//! Error taxonomy for namespace, fetch, reassembly and decryption faults.

use crate::crypto::CryptoError;
use crate::name::Name;

pub type Result<T> = std::result::Result<T, Error>;

/// Faults surfaced to the caller or to the listeners of the affected node.
///
/// Transient fetch faults are retried inside the fetcher and only appear here
/// once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("handler already attached at {0}")]
    HandlerAlreadyAttached(Name),
    #[error("no namespace node with id {0}")]
    UnknownNode(usize),
    #[error("fetch of {name} timed out after {attempts} attempts")]
    FetchTimeout { name: Name, attempts: u32 },
    #[error("fetch of {name} failed after {attempts} attempts: {reason}")]
    FetchNetworkError {
        name: Name,
        attempts: u32,
        reason: String,
    },
    #[error("reassembly of {name} inconsistent: final block id {final_block_id}, but segment {seen} exists")]
    ReassemblyInconsistency {
        name: Name,
        final_block_id: u64,
        seen: u64,
    },
    #[error("key {key_name} unavailable: {reason}")]
    KeyUnavailable { key_name: Name, reason: String },
    #[error("decrypt failed for {name}: {source}")]
    Decrypt { name: Name, source: CryptoError },
    #[error("key unwrap failed for {key_name}: {source}")]
    Unwrap { key_name: Name, source: CryptoError },
    #[error("malformed object packet {name}: {reason}")]
    MalformedObject { name: Name, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}
