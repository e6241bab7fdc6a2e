// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Consuming reader for snapshot files.
//
// The reader loads a snapshot file and yields its records in file order.
// A snapshot must be consumed whole: any record that runs past the end of
// the file fails the entire read, and the caller is expected to discard
// whatever it has rebuilt so far.

use std::path::Path;

use tracing::debug;

use crate::error::SnapshotResult;
use crate::record::PairRecord;

/// A reader that yields every record of one snapshot file.
pub struct SnapshotReader {
    /// The full file contents.
    data: Vec<u8>,
    /// Offset of the next unread record.
    offset: u64,
}

impl SnapshotReader {
    /// Load the snapshot file at `path` into memory.
    pub fn open(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!(path = %path.display(), bytes = data.len(), "opened snapshot");
        Ok(Self { data, offset: 0 })
    }

    /// Read a snapshot from an in-memory byte buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, offset: 0 }
    }

    /// Whether every byte of the file has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.offset as usize == self.data.len()
    }

    /// Decode every remaining record, enforcing full consumption.
    pub fn read_all(mut self) -> SnapshotResult<Vec<PairRecord>> {
        let mut records = Vec::new();
        while !self.is_exhausted() {
            let (record, next) = PairRecord::decode(&self.data, self.offset)?;
            records.push(record);
            self.offset = next;
        }
        Ok(records)
    }
}

impl Iterator for SnapshotReader {
    type Item = SnapshotResult<PairRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_exhausted() {
            return None;
        }
        match PairRecord::decode(&self.data, self.offset) {
            Ok((record, next)) => {
                self.offset = next;
                Some(Ok(record))
            }
            Err(err) => {
                // Poison the reader so iteration stops after the error.
                self.offset = self.data.len() as u64;
                Some(Err(err))
            }
        }
    }
}
