// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Storage error taxonomy.
//
// Every backend operation returns `Result<T, StorageError>`. A returned
// error aborts the whole batched call; per-item conditions (key not found,
// buffer too small, no more keys) travel through sentinel sizes instead —
// see the constants in `backend`.

use thiserror::Error;

/// Errors that can occur when interacting with a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested backend type name is not registered.
    #[error("unknown backend type: {0}")]
    InvalidType(String),

    /// The configuration document was rejected by the backend.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The call arguments are malformed (mismatched size vectors, a
    /// zero-length key, sizes exceeding the provided buffers).
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    /// A required key was not found. Only returned for call-level failures
    /// such as a single-key `EXIST_ONLY` put; batched lookups report
    /// missing keys through the `KEY_NOT_FOUND` sentinel.
    #[error("key not found")]
    NotFound,

    /// A caller-supplied buffer is too small for a call-level result.
    #[error("buffer too small")]
    BufferSize,

    /// A single-key `NEW_ONLY` put collided with an existing key.
    #[error("key already exists")]
    KeyExists,

    /// The backend does not implement this operation.
    #[error("operation not supported by this backend")]
    Unsupported,

    /// The mode contains bits outside the backend's supported set.
    #[error("unsupported mode bits: {0:#012b}")]
    ModeUnsupported(u32),

    /// Stored data is damaged or in an unexpected format.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// An I/O error from the underlying engine or filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A `WAIT` operation gave up before the key appeared.
    #[error("timed out waiting for key")]
    TimedOut,

    /// The database has been migrated away and is terminally read-dead.
    #[error("database has been migrated")]
    Migrated,

    /// Anything the other variants do not cover.
    #[error("{0}")]
    Other(String),
}

impl From<coffer_snapshot::SnapshotError> for StorageError {
    fn from(err: coffer_snapshot::SnapshotError) -> Self {
        use coffer_snapshot::SnapshotError;
        match err {
            SnapshotError::Io(io) => StorageError::Io(io),
            other @ (SnapshotError::UnexpectedEof { .. }
            | SnapshotError::SizeOverrun { .. }) => {
                StorageError::Corruption(other.to_string())
            }
        }
    }
}

/// Convenience alias for storage results.
pub type Result<T> = std::result::Result<T, StorageError>;
