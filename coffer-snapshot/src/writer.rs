// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Append-only writer for snapshot files.
//
// The writer creates the snapshot file, buffers appended records, and
// flushes + fsyncs on `finish()`. A snapshot that was not finished must be
// treated as garbage by the consumer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SnapshotResult;
use crate::record::PairRecord;

/// An append-only writer producing one snapshot file.
pub struct SnapshotWriter {
    /// Destination path, kept for diagnostics.
    path: PathBuf,
    /// Buffered file handle.
    file: BufWriter<File>,
    /// Number of records appended so far.
    records: u64,
    /// Total bytes appended so far.
    bytes: u64,
}

impl SnapshotWriter {
    /// Create the snapshot file at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> SnapshotResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            file,
            records: 0,
            bytes: 0,
        })
    }

    /// Append one key/value pair.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> SnapshotResult<()> {
        self.file.write_all(&(key.len() as u64).to_le_bytes())?;
        self.file.write_all(key)?;
        self.file.write_all(&(value.len() as u64).to_le_bytes())?;
        self.file.write_all(value)?;
        self.records += 1;
        self.bytes += (16 + key.len() + value.len()) as u64;
        Ok(())
    }

    /// Append an already-materialized record.
    pub fn append_record(&mut self, record: &PairRecord) -> SnapshotResult<()> {
        self.append(&record.key, &record.value)
    }

    /// Flush buffers and fsync the file. Consumes the writer: a finished
    /// snapshot is immutable.
    pub fn finish(mut self) -> SnapshotResult<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        debug!(
            path = %self.path.display(),
            records = self.records,
            bytes = self.bytes,
            "finished snapshot"
        );
        Ok(())
    }

    /// Number of records appended so far.
    pub fn record_count(&self) -> u64 {
        self.records
    }
}
