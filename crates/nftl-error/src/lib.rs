#![forbid(unsafe_code)]
//! Error types for the nftl workspace.
//!
//! Defines `FtlError` and a `Result<T>` alias used throughout. Request
//! errors bubble to the host as the completion status; GC errors stay
//! local to the collector.

use nftl_types::WireError;
use thiserror::Error;

/// Unified error type for all FTL operations.
#[derive(Debug, Error)]
pub enum FtlError {
    /// No free block and no recoverable victim.
    #[error("out of space: no free block available")]
    OutOfSpace,

    /// Queue full or memory pressure; the request may be retried.
    #[error("transient: {0}")]
    Transient(String),

    /// Logical address out of range; permanent for this request.
    #[error("bad address: logical page {addr} out of range (nr_pages {nr_pages})")]
    BadAddress { addr: u64, nr_pages: u64 },

    /// Underlying device read/write/erase failure.
    #[error("device error at physical page {addr}: {detail}")]
    Device { addr: u64, detail: String },

    /// Invariant violation (double invalidation, stale reverse entry).
    /// Fatal in debug builds; logged and surfaced in release.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Hint payload rejected before reaching the I/O path.
    #[error("hint rejected: {0}")]
    HintRejected(String),

    /// Malformed wire payload.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
}

/// Result alias using `FtlError`.
pub type Result<T> = std::result::Result<T, FtlError>;
