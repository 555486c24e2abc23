//! Error handling for ForgeDB.
//!
//! A single error type covers the whole engine. Storage-level failures
//! bubble up to the engine boundary; duplicate-key and not-found rejections
//! are safe to retry with different inputs, while magic mismatches and pool
//! exhaustion are fatal.

use std::io;

use thiserror::Error;

use crate::types::PageId;

/// Result type alias for ForgeDB operations.
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Stable error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// General I/O error.
    Io = 0x0100,
    /// File present but the header magic is wrong.
    MagicMismatch = 0x0101,
    /// Per-page checksum mismatch on load.
    ChecksumMismatch = 0x0102,
    /// Insert of an id that already exists.
    DuplicateKey = 0x0200,
    /// Delete or lookup of an absent id.
    KeyNotFound = 0x0201,
    /// Attempt to free the header or root page.
    PageReserved = 0x0202,
    /// Every buffer pool frame is pinned.
    PoolExhausted = 0x0300,
    /// Internal consistency violation (bug or corrupt file).
    InvariantViolation = 0x0301,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(self) -> &'static str {
        match (self as u16) >> 8 {
            0x01 => "I/O",
            0x02 => "Key",
            0x03 => "Internal",
            _ => "Unknown",
        }
    }
}

/// The error type for all ForgeDB operations.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Read/write/seek failure on the database file.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// The file exists but does not carry the ForgeDB magic.
    #[error("invalid database file (bad magic 0x{found:x}); delete the file and restart")]
    MagicMismatch {
        /// The magic value actually found in the header.
        found: u32,
    },

    /// Stored and computed CRC32 disagree for a page.
    ///
    /// Loads surface this as a warning and continue on the possibly-corrupt
    /// data; the variant exists for callers that want to verify explicitly.
    #[error("checksum mismatch on page {page}: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch {
        /// The damaged page.
        page: PageId,
        /// CRC32 read from the page header.
        stored: u32,
        /// CRC32 computed over the page contents.
        computed: u32,
    },

    /// Insert of a primary key that already exists.
    #[error("duplicate key {key}")]
    DuplicateKey {
        /// The rejected key.
        key: u32,
    },

    /// Delete or lookup of a key that is not in the tree.
    #[error("key {key} not found")]
    KeyNotFound {
        /// The missing key.
        key: u32,
    },

    /// Attempt to free the header page or the root page.
    #[error("cannot free reserved page {page}")]
    PageReserved {
        /// The refused page.
        page: PageId,
    },

    /// Eviction found every frame pinned. This is a configuration fault:
    /// the pool must be larger than the page set of any single operation.
    #[error("buffer pool exhausted: all {frames} frames are pinned")]
    PoolExhausted {
        /// Number of frames in the pool.
        frames: usize,
    },

    /// The on-disk structure contradicts itself (child missing from its
    /// parent, unknown node type, broken free list).
    #[error("internal consistency error: {message}")]
    InvariantViolation {
        /// Human-readable description of the violated invariant.
        message: String,
    },
}

impl ForgeError {
    /// Creates an invariant-violation error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Returns the stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::Io,
            Self::MagicMismatch { .. } => ErrorCode::MagicMismatch,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            Self::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            Self::PageReserved { .. } => ErrorCode::PageReserved,
            Self::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            Self::InvariantViolation { .. } => ErrorCode::InvariantViolation,
        }
    }

    /// Returns true for errors that must terminate the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MagicMismatch { .. }
                | Self::PoolExhausted { .. }
                | Self::InvariantViolation { .. }
        )
    }

    /// Returns true for rejections the caller may retry with other inputs.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. } | Self::KeyNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            ForgeError::DuplicateKey { key: 1 }.code(),
            ErrorCode::DuplicateKey
        );
        assert_eq!(ErrorCode::DuplicateKey.category(), "Key");
        assert_eq!(ErrorCode::PoolExhausted.category(), "Internal");
    }

    #[test]
    fn test_fatality() {
        assert!(ForgeError::MagicMismatch { found: 0 }.is_fatal());
        assert!(ForgeError::PoolExhausted { frames: 100 }.is_fatal());
        assert!(ForgeError::invariant("child not found in parent").is_fatal());
        assert!(!ForgeError::KeyNotFound { key: 9 }.is_fatal());
    }

    #[test]
    fn test_retryable() {
        assert!(ForgeError::DuplicateKey { key: 1 }.is_retryable());
        assert!(ForgeError::KeyNotFound { key: 1 }.is_retryable());
        assert!(!ForgeError::PoolExhausted { frames: 1 }.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ForgeError::MagicMismatch { found: 0xDEAD };
        assert!(err.to_string().contains("bad magic 0xdead"));

        let err = ForgeError::DuplicateKey { key: 42 };
        assert_eq!(err.to_string(), "duplicate key 42");
    }
}
