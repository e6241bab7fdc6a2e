// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cross-backend contract tests.
//
// Every backend must reproduce the same batched buffer-protocol
// semantics; these tests run the shared invariants against each
// registered engine, so a new backend picks up the whole battery by
// virtue of being registered.

mod common;

use std::sync::Arc;
use std::time::Duration;

use coffer_storage::{
    create_database, BitField, DatabaseBackend, Mode, OutputBuf, PackedSlice, StorageError,
    BUF_TOO_SMALL, KEY_NOT_FOUND, NO_MORE_KEYS,
};

use common::{all_backends, get_packed, list_keys_packed, pack, put_pairs, sorted_backends};

#[tokio::test]
async fn test_round_trip_on_every_backend() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"alpha", b"1"), (b"beta", b"two"), (b"gamma", b"")]).await;
        assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 3, "{}", db.kind());

        let (vsizes, written) =
            get_packed(db.as_ref(), Mode::DEFAULT, &[b"alpha", b"beta", b"gamma"], 16).await;
        assert_eq!(vsizes, [1, 3, 0], "{}", db.kind());
        assert_eq!(written, b"1two", "{}", db.kind());
    }
}

#[tokio::test]
async fn test_absence_leaves_bytes_untouched() {
    let (backends, _dir) = all_backends();
    for db in backends {
        let (kb, ks) = pack(&[b"missing"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut buf = [0xAAu8; 4];
        let mut out = OutputBuf::new(&mut buf);
        let mut vsizes = [4usize];
        db.get(Mode::DEFAULT, false, keys, &mut out, &mut vsizes)
            .await
            .unwrap();
        assert_eq!(vsizes[0], KEY_NOT_FOUND, "{}", db.kind());
        assert_eq!(buf, [0xAA; 4], "{}", db.kind());
    }
}

#[tokio::test]
async fn test_unpacked_layout_stability() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"hit", b"ab"), (b"big", b"overflowing")]).await;

        // Mix of hit, miss, oversize; slot capacities 4 each.
        let (kb, ks) = pack(&[b"hit", b"miss", b"big"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut buf = [0u8; 12];
        let mut out = OutputBuf::new(&mut buf);
        let mut vsizes = [4usize, 4, 4];
        db.get(Mode::DEFAULT, false, keys, &mut out, &mut vsizes)
            .await
            .unwrap();

        assert_eq!(vsizes, [2, KEY_NOT_FOUND, BUF_TOO_SMALL], "{}", db.kind());
        // The cursor advanced by the input capacity per slot, never by
        // the actual size.
        assert_eq!(&buf[0..2], b"ab", "{}", db.kind());
        assert_eq!(&buf[4..8], [0u8; 4], "{}", db.kind());
    }
}

#[tokio::test]
async fn test_packed_too_small_is_monotone() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]).await;

        let (vsizes, written) = get_packed(db.as_ref(), Mode::DEFAULT, &[b"a", b"b", b"c"], 2).await;
        assert_eq!(vsizes, [1, 1, BUF_TOO_SMALL], "{}", db.kind());
        // Total written equals the sum of successfully copied sizes.
        assert_eq!(written, b"12", "{}", db.kind());
    }
}

#[tokio::test]
async fn test_erase_then_get() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"k", b"v")]).await;
        let (kb, ks) = pack(&[b"k"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        db.erase(Mode::DEFAULT, keys).await.unwrap();

        let (vsizes, _) = get_packed(db.as_ref(), Mode::DEFAULT, &[b"k"], 4).await;
        assert_eq!(vsizes, [KEY_NOT_FOUND], "{}", db.kind());
    }
}

#[tokio::test]
async fn test_consume_is_observationally_atomic() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"k1", b"a"), (b"k2", b"b")]).await;

        let (vsizes, _) = get_packed(db.as_ref(), Mode::CONSUME, &[b"k1", b"k2"], 8).await;
        assert_eq!(vsizes, [1, 1], "{}", db.kind());

        // All found keys are absent on subsequent reads.
        let (vsizes, _) = get_packed(db.as_ref(), Mode::DEFAULT, &[b"k1", b"k2"], 8).await;
        assert_eq!(vsizes, [KEY_NOT_FOUND, KEY_NOT_FOUND], "{}", db.kind());
    }
}

#[tokio::test]
async fn test_new_only_exist_only_boundary() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"present", b"v")]).await;

        let (kb, ks) = pack(&[b"present"]);
        let (vb, vs) = pack(&[b"w"]);
        let err = db
            .put(
                Mode::NEW_ONLY,
                PackedSlice::new(&kb, &ks).unwrap(),
                PackedSlice::new(&vb, &vs).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyExists), "{}", db.kind());

        let (kb, ks) = pack(&[b"absent"]);
        let err = db
            .put(
                Mode::EXIST_ONLY,
                PackedSlice::new(&kb, &ks).unwrap(),
                PackedSlice::new(&vb, &vs).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound), "{}", db.kind());

        // Batched variants skip silently.
        let (kb, ks) = pack(&[b"present", b"fresh"]);
        let (vb, vs) = pack(&[b"X", b"Y"]);
        db.put(
            Mode::NEW_ONLY,
            PackedSlice::new(&kb, &ks).unwrap(),
            PackedSlice::new(&vb, &vs).unwrap(),
        )
        .await
        .unwrap();
        let (vsizes, written) =
            get_packed(db.as_ref(), Mode::DEFAULT, &[b"present", b"fresh"], 8).await;
        assert_eq!(vsizes, [1, 1], "{}", db.kind());
        assert_eq!(written, b"vY", "{}", db.kind());
    }
}

#[tokio::test]
async fn test_append_concatenates() {
    let (backends, _dir) = all_backends();
    for db in backends {
        let (kb, ks) = pack(&[b"k"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let (v1b, v1s) = pack(&[b"hello"]);
        db.put(Mode::APPEND, keys, PackedSlice::new(&v1b, &v1s).unwrap())
            .await
            .unwrap();
        let (v2b, v2s) = pack(&[b"world"]);
        db.put(Mode::APPEND, keys, PackedSlice::new(&v2b, &v2s).unwrap())
            .await
            .unwrap();

        let (vsizes, written) = get_packed(db.as_ref(), Mode::DEFAULT, &[b"k"], 16).await;
        assert_eq!(vsizes, [10], "{}", db.kind());
        assert_eq!(written, b"helloworld", "{}", db.kind());
    }
}

#[tokio::test]
async fn test_ordered_listing_semantics() {
    let (backends, _dir) = sorted_backends();
    for db in backends {
        put_pairs(
            db.as_ref(),
            &[(b"aa", b"1"), (b"ab", b"2"), (b"ba", b"3"), (b"bb", b"4")],
        )
        .await;

        let (sizes, written) =
            list_keys_packed(db.as_ref(), Mode::INCLUSIVE, b"ab", b"", 4, 64).await;
        assert_eq!(sizes, [2, 2, 2, NO_MORE_KEYS], "{}", db.kind());
        assert_eq!(written, b"abbabb", "{}", db.kind());

        let (sizes, written) =
            list_keys_packed(db.as_ref(), Mode::DEFAULT, b"ab", b"", 4, 64).await;
        assert_eq!(sizes, [2, 2, NO_MORE_KEYS, NO_MORE_KEYS], "{}", db.kind());
        assert_eq!(written, b"babb", "{}", db.kind());

        let (sizes, written) =
            list_keys_packed(db.as_ref(), Mode::INCLUSIVE, b"ab", b"a", 4, 64).await;
        assert_eq!(sizes, [2, NO_MORE_KEYS, NO_MORE_KEYS, NO_MORE_KEYS], "{}", db.kind());
        assert_eq!(written, b"ab", "{}", db.kind());
    }
}

#[tokio::test]
async fn test_listing_prefix_scenario() {
    // Sorted backend holds {apple, apricot, banana}: prefix "ap" emits
    // two keys packed back to back, and the third slot reports the end.
    let (backends, _dir) = sorted_backends();
    for db in backends {
        put_pairs(
            db.as_ref(),
            &[(b"apple", b"1"), (b"apricot", b"2"), (b"banana", b"3")],
        )
        .await;

        let (sizes, written) = list_keys_packed(db.as_ref(), Mode::DEFAULT, b"", b"ap", 3, 20).await;
        assert_eq!(sizes, [5, 7, NO_MORE_KEYS], "{}", db.kind());
        assert_eq!(written.len(), 12, "{}", db.kind());
        assert_eq!(written, b"appleapricot", "{}", db.kind());
    }
}

#[tokio::test]
async fn test_exists_bitfield() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"here", b"v")]).await;

        let (kb, ks) = pack(&[b"here", b"gone", b"here"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut bits = [0u8; 1];
        let mut flags = BitField::new(&mut bits);
        db.exists(Mode::DEFAULT, keys, &mut flags).await.unwrap();
        assert!(flags.get(0), "{}", db.kind());
        assert!(!flags.get(1), "{}", db.kind());
        assert!(flags.get(2), "{}", db.kind());

        // A bit field that cannot hold one bit per key is rejected.
        let mut small = [0u8; 0];
        let mut flags = BitField::new(&mut small);
        let err = db.exists(Mode::DEFAULT, keys, &mut flags).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgs(_)), "{}", db.kind());
    }
}

#[tokio::test]
async fn test_fetch_streams_without_copying() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"a", b"1"), (b"c", b"3")]).await;

        let (kb, ks) = pack(&[b"a", b"b", b"c"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut seen = Vec::new();
        let mut callback = |key: &[u8], value: Option<&[u8]>| {
            seen.push((key.to_vec(), value.map(<[u8]>::to_vec)));
            Ok(())
        };
        db.fetch(Mode::DEFAULT, keys, &mut callback).await.unwrap();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"c".to_vec(), Some(b"3".to_vec())),
            ],
            "{}",
            db.kind()
        );
    }
}

#[tokio::test]
async fn test_advertised_modes_never_fail_with_mode_unsupported() {
    // supportsMode closure: any single advertised bit must be accepted by
    // the operations (OK or sentinel outcomes, never ModeUnsupported).
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"k", b"v")]).await;
        for bit in 0..17u32 {
            let mode = Mode::from_bits(1 << bit);
            if !db.supports(mode) {
                continue;
            }
            let result = db.count(mode).await;
            assert!(
                !matches!(result, Err(StorageError::ModeUnsupported(_))),
                "{} rejected advertised mode {mode}",
                db.kind()
            );
            let (kb, ks) = pack(&[b"k"]);
            let keys = PackedSlice::new(&kb, &ks).unwrap();
            let mut lengths = [0usize];
            let result = db.length(mode, keys, &mut lengths).await;
            assert!(
                !matches!(result, Err(StorageError::ModeUnsupported(_))),
                "{} rejected advertised mode {mode}",
                db.kind()
            );
        }
    }
}

#[tokio::test]
async fn test_watcher_liveness_between_tasks() {
    // Task A reads with WAIT; task B stores with NOTIFY 50ms later; A
    // must return the value well within the wait budget.
    let db = create_database("memory", serde_json::json!({})).unwrap();
    let reader: Arc<dyn DatabaseBackend> = Arc::clone(&db);

    let task = tokio::spawn(async move {
        let (kb, ks) = pack(&[b"pending"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut buf = [0u8; 4];
        let mut out = OutputBuf::new(&mut buf);
        let mut vsizes = [0usize];
        reader
            .get(Mode::WAIT, true, keys, &mut out, &mut vsizes)
            .await
            .unwrap();
        assert_eq!(vsizes[0], 1);
        assert_eq!(out.written(), b"X");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (kb, ks) = pack(&[b"pending"]);
    let (vb, vs) = pack(&[b"X"]);
    db.put(
        Mode::NOTIFY,
        PackedSlice::new(&kb, &ks).unwrap(),
        PackedSlice::new(&vb, &vs).unwrap(),
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("waiter did not wake in time")
        .unwrap();
}

#[tokio::test]
async fn test_wait_and_consume_compose() {
    // A waiting consumer and a notifying producer: the consumer takes the
    // value and leaves the key absent.
    let db = create_database("btree", serde_json::json!({})).unwrap();
    let consumer: Arc<dyn DatabaseBackend> = Arc::clone(&db);

    let task = tokio::spawn(async move {
        let (kb, ks) = pack(&[b"queue-item"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut buf = [0u8; 8];
        let mut out = OutputBuf::new(&mut buf);
        let mut vsizes = [0usize];
        consumer
            .get(Mode::WAIT | Mode::CONSUME, true, keys, &mut out, &mut vsizes)
            .await
            .unwrap();
        assert_eq!(out.written(), b"payload");
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    let (kb, ks) = pack(&[b"queue-item"]);
    let (vb, vs) = pack(&[b"payload"]);
    db.put(
        Mode::NOTIFY,
        PackedSlice::new(&kb, &ks).unwrap(),
        PackedSlice::new(&vb, &vs).unwrap(),
    )
    .await
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer did not wake in time")
        .unwrap();

    assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 0);
}

#[tokio::test]
async fn test_length_scenario() {
    let (backends, _dir) = all_backends();
    for db in backends {
        put_pairs(db.as_ref(), &[(b"a", b"1"), (b"bb", b"22")]).await;

        let (kb, ks) = pack(&[b"a", b"bb"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut lengths = [0usize; 2];
        db.length(Mode::DEFAULT, keys, &mut lengths).await.unwrap();
        assert_eq!(lengths, [1, 2], "{}", db.kind());

        let (vsizes, written) = get_packed(db.as_ref(), Mode::DEFAULT, &[b"a", b"bb"], 3).await;
        assert_eq!(vsizes, [1, 2], "{}", db.kind());
        assert_eq!(written, b"122", "{}", db.kind());
    }
}
