// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Coffer Migration Snapshot Format
//
// This crate defines the on-disk interchange format used to move a Coffer
// database from one provider to another. A snapshot file is a plain
// concatenation of key/value records with no file header, no footer and no
// checksums:
//
//   [8 bytes: key size (u64 LE)]
//   [N bytes: key]
//   [8 bytes: value size (u64 LE)]
//   [M bytes: value]
//   ... repeated until end of file ...
//
// The format is deliberately minimal: a snapshot is written once, shipped
// to its destination, consumed exactly once and deleted. Integrity of the
// transfer is the responsibility of the transport; a file that ends in the
// middle of a record is rejected as a whole.
//
// # Modules
//
// - [`record`] -- The `PairRecord` type and its binary codec.
// - [`writer`] -- `SnapshotWriter`, an append-only buffered file writer.
// - [`reader`] -- `SnapshotReader`, a consuming iterator over records.
// - [`error`]  -- The `SnapshotError` enum.

pub mod error;
pub mod reader;
pub mod record;
pub mod writer;

pub use error::{SnapshotError, SnapshotResult};
pub use reader::SnapshotReader;
pub use record::PairRecord;
pub use writer::SnapshotWriter;
