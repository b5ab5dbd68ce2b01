#![forbid(unsafe_code)]
//! Error types for SwarmFS.
//!
//! Defines `SfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the client-facing upper layer.
//!
//! Deferred work and authority misses are *not* errors here: path
//! traversal reports them through its own result enum, because they mean
//! "re-queued" or "ask someone else", not failure. Protocol invariant
//! violations are asserts, not error values.

use thiserror::Error;

/// Unified error type for all SwarmFS metadata operations.
#[derive(Debug, Error)]
pub enum SfsError {
    #[error("not a directory")]
    NotDirectory,

    #[error("not found")]
    NotFound,

    #[error("invalid wire format: {0}")]
    Decode(#[from] sfs_types::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SfsError {
    /// Convert this error into a POSIX errno for client replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotDirectory => libc::ENOTDIR,
            Self::NotFound => libc::ENOENT,
            Self::Decode(_) => libc::EINVAL,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_matches_posix() {
        assert_eq!(SfsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(SfsError::NotFound.to_errno(), libc::ENOENT);
    }
}
