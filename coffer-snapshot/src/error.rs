// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error types for the snapshot format.

use thiserror::Error;

/// Errors that can occur while writing or consuming a snapshot file.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// An I/O error occurred on the underlying file.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file ended in the middle of a record. Snapshots are consumed
    /// whole; a truncated file invalidates the entire recovery.
    #[error("unexpected end of snapshot at offset {offset}: {context}")]
    UnexpectedEof {
        /// Byte offset at which the record began.
        offset: u64,
        /// What was being read when the file ran out.
        context: &'static str,
    },

    /// A record declares a size larger than the bytes remaining in the
    /// file, which can only happen if the snapshot was damaged in transit.
    #[error("record at offset {offset} declares {declared} bytes but only {remaining} remain")]
    SizeOverrun {
        /// Byte offset at which the record began.
        offset: u64,
        /// The declared key or value size.
        declared: u64,
        /// Bytes remaining in the file.
        remaining: u64,
    },
}

/// Convenience alias for snapshot results.
pub type SnapshotResult<T> = Result<T, SnapshotError>;
