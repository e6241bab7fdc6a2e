// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared helpers for the backend contract tests.

// Each test binary pulls in the subset of helpers it needs.
#![allow(dead_code)]

use std::sync::Arc;

use coffer_storage::{DatabaseBackend, Mode, OutputBuf, PackedSlice};
use tempfile::TempDir;

/// Pack a list of items into a contiguous blob plus its size vector.
pub fn pack(items: &[&[u8]]) -> (Vec<u8>, Vec<usize>) {
    let mut bytes = Vec::new();
    let mut sizes = Vec::with_capacity(items.len());
    for item in items {
        bytes.extend_from_slice(item);
        sizes.push(item.len());
    }
    (bytes, sizes)
}

/// Create one backend of every registered kind, each with a valid
/// configuration. The `TempDir` keeps the disk backends' files alive.
pub fn all_backends() -> (Vec<Arc<dyn DatabaseBackend>>, TempDir) {
    let dir = TempDir::new().unwrap();
    let backends = vec![
        coffer_storage::create_database("memory", serde_json::json!({})).unwrap(),
        coffer_storage::create_database("btree", serde_json::json!({})).unwrap(),
        coffer_storage::create_database(
            "redb",
            serde_json::json!({ "path": dir.path().join("pairs.redb") }),
        )
        .unwrap(),
        coffer_storage::create_database(
            "log",
            serde_json::json!({ "path": dir.path().join("log-db") }),
        )
        .unwrap(),
    ];
    (backends, dir)
}

/// The sorted subset of [`all_backends`].
pub fn sorted_backends() -> (Vec<Arc<dyn DatabaseBackend>>, TempDir) {
    let (backends, dir) = all_backends();
    (backends.into_iter().filter(|b| b.is_sorted()).collect(), dir)
}

/// Store a batch of pairs with the given mode.
pub async fn put_pairs_mode(db: &dyn DatabaseBackend, mode: Mode, pairs: &[(&[u8], &[u8])]) {
    let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| *k).collect();
    let vals: Vec<&[u8]> = pairs.iter().map(|(_, v)| *v).collect();
    let (kb, ks) = pack(&keys);
    let (vb, vs) = pack(&vals);
    db.put(
        mode,
        PackedSlice::new(&kb, &ks).unwrap(),
        PackedSlice::new(&vb, &vs).unwrap(),
    )
    .await
    .unwrap();
}

/// Store a batch of pairs with the default mode.
pub async fn put_pairs(db: &dyn DatabaseBackend, pairs: &[(&[u8], &[u8])]) {
    put_pairs_mode(db, Mode::DEFAULT, pairs).await;
}

/// Packed `get` of a batch of keys; returns `(vsizes, written bytes)`.
pub async fn get_packed(
    db: &dyn DatabaseBackend,
    mode: Mode,
    keys: &[&[u8]],
    capacity: usize,
) -> (Vec<usize>, Vec<u8>) {
    let (kb, ks) = pack(keys);
    let packed_keys = PackedSlice::new(&kb, &ks).unwrap();
    let mut buf = vec![0u8; capacity];
    let mut out = OutputBuf::new(&mut buf);
    let mut vsizes = vec![0usize; keys.len()];
    db.get(mode, true, packed_keys, &mut out, &mut vsizes)
        .await
        .unwrap();
    let written = out.written().to_vec();
    (vsizes, written)
}

/// Packed `list_keys`; returns `(ksizes, written bytes)`.
pub async fn list_keys_packed(
    db: &dyn DatabaseBackend,
    mode: Mode,
    from_key: &[u8],
    filter: &[u8],
    slots: usize,
    capacity: usize,
) -> (Vec<usize>, Vec<u8>) {
    let mut buf = vec![0u8; capacity];
    let mut out = OutputBuf::new(&mut buf);
    let mut ksizes = vec![0usize; slots];
    db.list_keys(mode, true, from_key, filter, &mut out, &mut ksizes)
        .await
        .unwrap();
    let written = out.written().to_vec();
    (ksizes, written)
}
