// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Migration and recovery tests across the registry.

mod common;

use coffer_storage::{create_database, recover_database, Mode, StorageError};
use tempfile::TempDir;

use common::{get_packed, put_pairs};

/// Snapshot a backend, recover it through the registry, and verify the
/// pair set moved and the source died.
async fn migrate_and_check(kind: &str, source_cfg: serde_json::Value, dest_cfg: serde_json::Value) {
    let db = create_database(kind, source_cfg).unwrap();
    put_pairs(
        db.as_ref(),
        &[(b"k1", b"first"), (b"k2", b"second"), (b"empty", b"")],
    )
    .await;

    let handle = db.start_migration().await.unwrap();
    let recovered = recover_database(
        kind,
        dest_cfg,
        serde_json::json!({}),
        handle.root(),
        &handle.files().to_vec(),
    )
    .unwrap();
    drop(handle);

    // Terminal state on the source.
    assert!(
        matches!(db.count(Mode::DEFAULT).await.unwrap_err(), StorageError::Migrated),
        "{kind}"
    );
    let (kb, ks) = common::pack(&[b"k1"]);
    let keys = coffer_storage::PackedSlice::new(&kb, &ks).unwrap();
    assert!(
        matches!(db.erase(Mode::DEFAULT, keys).await.unwrap_err(), StorageError::Migrated),
        "{kind}"
    );

    // Identical pair set on the destination.
    assert_eq!(recovered.count(Mode::DEFAULT).await.unwrap(), 3, "{kind}");
    let (vsizes, written) =
        get_packed(recovered.as_ref(), Mode::DEFAULT, &[b"k1", b"k2", b"empty"], 16).await;
    assert_eq!(vsizes, [5, 6, 0], "{kind}");
    assert_eq!(written, b"firstsecond", "{kind}");
}

#[tokio::test]
async fn test_memory_migration_roundtrip() {
    migrate_and_check("memory", serde_json::json!({}), serde_json::json!({})).await;
}

#[tokio::test]
async fn test_btree_migration_roundtrip() {
    migrate_and_check("btree", serde_json::json!({}), serde_json::json!({})).await;
}

#[tokio::test]
async fn test_redb_migration_roundtrip() {
    let dir = TempDir::new().unwrap();
    migrate_and_check(
        "redb",
        serde_json::json!({ "path": dir.path().join("source.redb") }),
        serde_json::json!({ "path": dir.path().join("dest.redb") }),
    )
    .await;
}

#[tokio::test]
async fn test_log_migration_roundtrip() {
    let dir = TempDir::new().unwrap();
    migrate_and_check(
        "log",
        serde_json::json!({ "path": dir.path().join("source") }),
        serde_json::json!({ "path": dir.path().join("dest") }),
    )
    .await;
}

#[tokio::test]
async fn test_memory_snapshot_recovers_into_btree() {
    // The snapshot format is engine-independent: an unordered source can
    // be recovered into the ordered engine.
    let db = create_database("memory", serde_json::json!({})).unwrap();
    put_pairs(db.as_ref(), &[(b"b", b"2"), (b"a", b"1")]).await;

    let handle = db.start_migration().await.unwrap();
    let recovered = recover_database(
        "btree",
        serde_json::json!({}),
        serde_json::json!({}),
        handle.root(),
        &handle.files().to_vec(),
    )
    .unwrap();
    drop(handle);

    assert!(recovered.is_sorted());
    assert_eq!(recovered.count(Mode::DEFAULT).await.unwrap(), 2);
}

#[tokio::test]
async fn test_truncated_snapshot_fails_recovery() {
    let db = create_database("memory", serde_json::json!({})).unwrap();
    put_pairs(db.as_ref(), &[(b"key", b"a-reasonably-long-value")]).await;

    let mut handle = db.start_migration().await.unwrap();
    let snapshot = handle.root().join(&handle.files()[0]);
    let data = std::fs::read(&snapshot).unwrap();
    std::fs::write(&snapshot, &data[..data.len() - 4]).unwrap();

    let err = recover_database(
        "memory",
        serde_json::json!({}),
        serde_json::json!({}),
        handle.root(),
        &handle.files().to_vec(),
    )
    .unwrap_err();
    assert!(matches!(err, StorageError::Corruption(_)));

    // The botched transfer is abandoned; keep the source alive.
    handle.cancel();
    drop(handle);
    assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 1);
}

#[tokio::test]
async fn test_cancelled_migration_leaves_source_untouched() {
    let db = create_database("btree", serde_json::json!({})).unwrap();
    put_pairs(db.as_ref(), &[(b"k", b"v")]).await;

    let mut handle = db.start_migration().await.unwrap();
    handle.cancel();
    drop(handle);

    assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 1);
    // A second migration is allowed after a cancelled one.
    let handle = db.start_migration().await.unwrap();
    drop(handle);
    assert!(matches!(
        db.count(Mode::DEFAULT).await.unwrap_err(),
        StorageError::Migrated
    ));
}

#[tokio::test]
async fn test_unknown_kind_cannot_recover() {
    let err = recover_database(
        "paper-tape",
        serde_json::json!({}),
        serde_json::json!({}),
        std::path::Path::new("/nonexistent"),
        &[],
    )
    .unwrap_err();
    assert!(matches!(err, StorageError::InvalidType(_)));
}

#[tokio::test]
async fn test_config_is_echoed_with_defaults() {
    let db = create_database(
        "memory",
        serde_json::json!({
            "initial_bucket_count": 101,
            "custom_deployment_tag": "blue",
        }),
    )
    .unwrap();
    let cfg = db.config();
    assert_eq!(cfg["use_lock"], serde_json::json!(true));
    assert_eq!(cfg["initial_bucket_count"], serde_json::json!(101));
    assert_eq!(cfg["wait_timeout_ms"], serde_json::json!(10_000));
    assert_eq!(cfg["allocators"]["value_allocator"], serde_json::json!("default"));
    // Unknown keys survive the round trip.
    assert_eq!(cfg["custom_deployment_tag"], serde_json::json!("blue"));
}
