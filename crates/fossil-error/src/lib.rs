#![forbid(unsafe_code)]
//! Error types for the fossil engine.
//!
//! Defines `FossilError` and a `Result<T>` alias used throughout the
//! workspace. Most variants are surfaced verbatim to the 9P layer, which maps
//! them onto Rerror strings.

use fossil_types::{BlockAddr, ParseError};
use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum FossilError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad path element")]
    BadPath,

    #[error("not a directory")]
    NotDir,

    #[error("not a plain file")]
    NotFile,

    #[error("file already exists")]
    Exists,

    #[error("file does not exist")]
    NoFile,

    #[error("file system is read only")]
    ReadOnly,

    #[error("file has been removed")]
    Removed,

    #[error("illegal operation on root")]
    Root,

    #[error("directory is not empty")]
    NotEmpty,

    #[error("illegal offset")]
    BadOffset,

    #[error("corrupted meta data")]
    BadMeta,

    #[error("no free blocks on device")]
    NoSpace,

    #[error("file system is halted")]
    Halted,

    #[error("corrupt {kind} at block {addr}")]
    Corrupt { kind: &'static str, addr: BlockAddr },

    #[error("on-disk format: {0}")]
    Parse(#[from] ParseError),

    #[error("venti: {0}")]
    Venti(String),

    #[error("venti session not configured")]
    NoVenti,

    #[error("snapshot already in progress")]
    SnapInProgress,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl FossilError {
    /// Whether retrying the same operation can possibly succeed.
    ///
    /// Device errors may be transient; structural errors never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Venti(_))
    }
}

/// Result alias using `FossilError`.
pub type Result<T> = std::result::Result<T, FossilError>;
