// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Coffer Storage Backend Abstraction
//
// This crate provides a uniform, batched, buffer-oriented key/value
// interface over pluggable storage engines. A request arrives as a mode
// bitset plus packed key/value blobs described by size vectors; the
// backend validates the batch, takes its reader/writer lock, performs the
// whole batch in request order, and reports per-key outcomes through
// sentinel sizes written into the caller's size vectors. Result data is
// always written into caller-owned memory.
//
// # Modules
//
// - [`backend`]   -- The `DatabaseBackend` trait every engine implements.
// - [`buffer`]    -- The caller-memory protocol: packed blobs, output
//   buffers, bit fields, sentinel sizes, and the shared emission loops.
// - [`mode`]      -- The `Mode` bitset parameterizing each operation.
// - [`error`]     -- The `StorageError` taxonomy.
// - [`watcher`]   -- The key-presence wait primitive behind `Mode::WAIT`.
// - [`allocator`] -- Pluggable byte allocators for the in-memory engines.
// - [`registry`]  -- The process-wide backend factory registry.
// - [`migration`] -- Snapshot handles for moving a database elsewhere.
// - [`memory`]    -- Reference unordered (hash map) backend.
// - [`btree`]     -- Reference ordered (B-tree map) backend.
// - [`redb_backend`] -- Persistent B-tree backend over redb.
// - [`log`]       -- Persistent log-structured backend.
//
// # Example
//
// ```rust
// use coffer_storage::backend::DatabaseBackend;
// use coffer_storage::buffer::{OutputBuf, PackedSlice};
// use coffer_storage::mode::Mode;
// use coffer_storage::registry::create_database;
//
// # tokio_test::block_on(async {
// let db = create_database("memory", serde_json::json!({})).unwrap();
//
// let keys = PackedSlice::new(b"abb", &[1, 2]).unwrap();
// let vals = PackedSlice::new(b"122", &[1, 2]).unwrap();
// db.put(Mode::DEFAULT, keys, vals).await.unwrap();
//
// let mut out = [0u8; 8];
// let mut out = OutputBuf::new(&mut out);
// let mut vsizes = [0usize; 2];
// db.get(Mode::DEFAULT, true, keys, &mut out, &mut vsizes).await.unwrap();
// assert_eq!(vsizes, [1, 2]);
// assert_eq!(out.written(), b"122");
// # });
// ```

pub mod allocator;
pub mod backend;
pub mod btree;
pub mod buffer;
pub mod error;
pub mod log;
pub mod memory;
pub mod migration;
pub mod mode;
pub mod redb_backend;
pub mod registry;
pub mod watcher;

// Re-export the types most callers touch.
pub use backend::{DatabaseBackend, FetchCallback};
pub use buffer::{BitField, OutputBuf, PackedSlice, BUF_TOO_SMALL, KEY_NOT_FOUND, NO_MORE_KEYS};
pub use error::{Result, StorageError};
pub use migration::MigrationHandle;
pub use mode::Mode;
pub use registry::{create_database, recover_database, register_backend};
