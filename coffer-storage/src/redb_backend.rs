// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// redb-backed persistent backend.
//
// A thin adapter mapping the batched buffer protocol onto redb (pure Rust,
// copy-on-write B-tree, single-file, ACID). One table of byte slices holds
// the pairs; every call runs inside a single redb transaction, so batches
// commit atomically -- a single-key `NEW_ONLY`/`EXIST_ONLY` failure aborts
// the transaction and leaves nothing applied. redb iterates keys in
// lexicographic order, so the listing operations are fully implemented.
//
// No `WAIT`/`NOTIFY`: blocking reads are an in-memory-engine feature.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::{check_batch, filter_matches, scan_start, DatabaseBackend, FetchCallback};
use crate::buffer::{BitField, OutputBuf, PackedSlice, SizedEmitter, KEY_NOT_FOUND};
use crate::error::{Result, StorageError};
use crate::migration::{BackendMigration, MigrationHandle};
use crate::mode::Mode;

/// The single table holding all pairs. Keys and values are byte slices,
/// matching the opaque interface.
const PAIRS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pairs");

fn default_create_if_missing() -> bool {
    true
}

/// Configuration of the `redb` backend. Unknown keys are accepted and
/// echoed back by `config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedbConfig {
    /// Path of the database file. Required.
    pub path: PathBuf,
    /// Create the file if it does not exist.
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
    /// Refuse to open a file that already exists.
    #[serde(default)]
    pub error_if_exists: bool,
    /// redb page-cache budget in bytes; engine default when absent.
    #[serde(default)]
    pub cache_size_bytes: Option<usize>,
    /// Per-read tuning knobs, accepted and echoed for compatibility.
    #[serde(default)]
    pub read_options: serde_json::Map<String, serde_json::Value>,
    /// Per-write tuning knobs, accepted and echoed for compatibility.
    #[serde(default)]
    pub write_options: serde_json::Map<String, serde_json::Value>,
    /// Unrecognized configuration keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Marker state behind the backend's reader/writer lock. redb does its own
/// internal synchronization; this lock enforces the contract's discipline
/// (writers exclusive, migration handle blocks writers).
#[derive(Debug, Default)]
pub(crate) struct DiskState;

/// Persistent backend over a redb database file.
#[derive(Debug)]
pub struct RedbBackend {
    config: RedbConfig,
    db: Database,
    state: Arc<RwLock<DiskState>>,
    migrated: Arc<AtomicBool>,
}

const SUPPORTED_MODES: Mode = Mode::from_bits(
    Mode::INCLUSIVE.bits()
        | Mode::APPEND.bits()
        | Mode::CONSUME.bits()
        | Mode::NEW_ONLY.bits()
        | Mode::EXIST_ONLY.bits()
        | Mode::NO_PREFIX.bits()
        | Mode::SUFFIX.bits()
        | Mode::IGNORE_KEYS.bits()
        | Mode::KEEP_LAST.bits(),
);

fn engine_err(context: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("redb {context}: {err}"))
}

fn data_err(context: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Corruption(format!("redb {context}: {err}"))
}

impl RedbBackend {
    /// Open or create a database file from a JSON configuration document.
    pub fn create(config: serde_json::Value) -> Result<Arc<Self>> {
        let cfg: RedbConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        Self::open(cfg)
    }

    /// Rebuild a backend from the files of a completed migration: the
    /// source database file is copied under the configured path and
    /// opened.
    pub fn recover(
        config: serde_json::Value,
        _migration_config: serde_json::Value,
        root: &Path,
        files: &[String],
    ) -> Result<Arc<Self>> {
        let mut cfg: RedbConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        let file = files.first().ok_or(StorageError::InvalidArgs(
            "migration produced no database file",
        ))?;
        if let Some(parent) = cfg.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(root.join(file), &cfg.path)?;
        cfg.create_if_missing = false;
        cfg.error_if_exists = false;
        Self::open(cfg)
    }

    fn open(cfg: RedbConfig) -> Result<Arc<Self>> {
        let exists = cfg.path.exists();
        if exists && cfg.error_if_exists {
            return Err(StorageError::InvalidConfig(format!(
                "database already exists at {}",
                cfg.path.display()
            )));
        }
        if !exists && !cfg.create_if_missing {
            return Err(StorageError::InvalidConfig(format!(
                "no database at {} and create_if_missing is off",
                cfg.path.display()
            )));
        }
        if let Some(parent) = cfg.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut builder = redb::Builder::new();
        if let Some(cache) = cfg.cache_size_bytes {
            builder.set_cache_size(cache);
        }
        let db = builder
            .create(&cfg.path)
            .map_err(|e| engine_err("open", e))?;
        debug!(path = %cfg.path.display(), "opened redb backend");

        Ok(Arc::new(Self {
            config: cfg,
            db,
            state: Arc::new(RwLock::new(DiskState)),
            migrated: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.migrated.load(Ordering::Acquire) {
            return Err(StorageError::Migrated);
        }
        Ok(())
    }

    /// Open the pairs table of a read transaction; a missing table means
    /// no data has ever been written.
    fn read_table(
        txn: &redb::ReadTransaction,
    ) -> Result<Option<redb::ReadOnlyTable<&'static [u8], &'static [u8]>>> {
        match txn.open_table(PAIRS) {
            Ok(table) => Ok(Some(table)),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(data_err("open table", e)),
        }
    }
}

#[async_trait]
impl DatabaseBackend for RedbBackend {
    fn kind(&self) -> &'static str {
        "redb"
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn is_sorted(&self) -> bool {
        true
    }

    fn supports(&self, mode: Mode) -> bool {
        mode.is_subset_of(SUPPORTED_MODES)
    }

    async fn count(&self, mode: Mode) -> Result<u64> {
        if !self.supports(mode) {
            return Err(StorageError::ModeUnsupported(mode.bits()));
        }
        let _guard = self.state.read().await;
        self.ensure_live()?;
        let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
        match Self::read_table(&txn)? {
            Some(table) => table.len().map_err(|e| data_err("count", e)),
            None => Ok(0),
        }
    }

    async fn exists(
        &self,
        mode: Mode,
        keys: PackedSlice<'_>,
        flags: &mut BitField<'_>,
    ) -> Result<()> {
        check_batch(self, mode, &keys, None)?;
        if keys.len() > flags.capacity() {
            return Err(StorageError::InvalidArgs(
                "bit field too small for the key batch",
            ));
        }
        let _guard = self.state.read().await;
        self.ensure_live()?;
        let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
        let table = Self::read_table(&txn)?;
        for (i, key) in keys.iter().enumerate() {
            let present = match &table {
                Some(table) => table.get(key).map_err(|e| data_err("get", e))?.is_some(),
                None => false,
            };
            flags.set(i, present);
        }
        Ok(())
    }

    async fn length(
        &self,
        mode: Mode,
        keys: PackedSlice<'_>,
        vsizes: &mut [usize],
    ) -> Result<()> {
        check_batch(self, mode, &keys, Some(vsizes.len()))?;
        let _guard = self.state.read().await;
        self.ensure_live()?;
        let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
        let table = Self::read_table(&txn)?;
        for (i, key) in keys.iter().enumerate() {
            let found = match &table {
                Some(table) => table.get(key).map_err(|e| data_err("get", e))?,
                None => None,
            };
            vsizes[i] = match found {
                Some(value) => value.value().len(),
                None => KEY_NOT_FOUND,
            };
        }
        Ok(())
    }

    async fn put(&self, mode: Mode, keys: PackedSlice<'_>, vals: PackedSlice<'_>) -> Result<()> {
        check_batch(self, mode, &keys, Some(vals.len()))?;
        let new_only = mode.contains(Mode::NEW_ONLY);
        let exist_only = mode.contains(Mode::EXIST_ONLY);
        let append = mode.contains(Mode::APPEND);
        let single = keys.len() == 1;

        let _guard = self.state.write().await;
        self.ensure_live()?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| engine_err("write txn", e))?;
        {
            let mut table = txn.open_table(PAIRS).map_err(|e| data_err("open table", e))?;
            for (key, value) in keys.iter().zip(vals.iter()) {
                let existing = table
                    .get(key)
                    .map_err(|e| data_err("get", e))?
                    .map(|v| v.value().to_vec());
                match existing {
                    Some(_) if new_only => {
                        if single {
                            // Dropping the uncommitted transaction aborts
                            // the whole batch.
                            return Err(StorageError::KeyExists);
                        }
                        continue;
                    }
                    None if exist_only => {
                        if single {
                            return Err(StorageError::NotFound);
                        }
                        continue;
                    }
                    Some(old) if append => {
                        let mut extended = Vec::with_capacity(old.len() + value.len());
                        extended.extend_from_slice(&old);
                        extended.extend_from_slice(value);
                        table
                            .insert(key, extended.as_slice())
                            .map_err(|e| data_err("insert", e))?;
                    }
                    _ => {
                        table.insert(key, value).map_err(|e| data_err("insert", e))?;
                    }
                }
            }
        }
        txn.commit().map_err(|e| data_err("commit", e))?;
        Ok(())
    }

    async fn get(
        &self,
        mode: Mode,
        packed: bool,
        keys: PackedSlice<'_>,
        vals: &mut OutputBuf<'_>,
        vsizes: &mut [usize],
    ) -> Result<()> {
        check_batch(self, mode, &keys, Some(vsizes.len()))?;
        if !packed {
            let mut total: usize = 0;
            for &capacity in vsizes.iter() {
                total = total
                    .checked_add(capacity)
                    .ok_or(StorageError::InvalidArgs("value capacities overflow"))?;
            }
            if total > vals.capacity() {
                return Err(StorageError::InvalidArgs(
                    "value capacities exceed the output buffer",
                ));
            }
        }

        {
            let _guard = self.state.read().await;
            self.ensure_live()?;
            let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
            let table = Self::read_table(&txn)?;
            let mut emitter = SizedEmitter::new(packed, vals.data, vsizes);
            for key in keys.iter() {
                let found = match &table {
                    Some(table) => table.get(key).map_err(|e| data_err("get", e))?,
                    None => None,
                };
                match found {
                    Some(value) => emitter.push(value.value()),
                    None => emitter.push_missing(),
                }
            }
            vals.len = emitter.finish();
        }

        if mode.contains(Mode::CONSUME) {
            self.erase(mode, keys).await?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        mode: Mode,
        keys: PackedSlice<'_>,
        callback: &mut FetchCallback<'_>,
    ) -> Result<()> {
        check_batch(self, mode, &keys, None)?;
        {
            let _guard = self.state.read().await;
            self.ensure_live()?;
            let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
            let table = Self::read_table(&txn)?;
            for key in keys.iter() {
                let found = match &table {
                    Some(table) => table.get(key).map_err(|e| data_err("get", e))?,
                    None => None,
                };
                match found {
                    Some(value) => callback(key, Some(value.value()))?,
                    None => callback(key, None)?,
                }
            }
        }

        if mode.contains(Mode::CONSUME) {
            self.erase(mode, keys).await?;
        }
        Ok(())
    }

    async fn erase(&self, mode: Mode, keys: PackedSlice<'_>) -> Result<()> {
        check_batch(self, mode, &keys, None)?;
        let _guard = self.state.write().await;
        self.ensure_live()?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| engine_err("write txn", e))?;
        {
            let mut table = txn.open_table(PAIRS).map_err(|e| data_err("open table", e))?;
            for key in keys.iter() {
                table.remove(key).map_err(|e| data_err("remove", e))?;
            }
        }
        txn.commit().map_err(|e| data_err("commit", e))?;
        Ok(())
    }

    async fn list_keys(
        &self,
        mode: Mode,
        packed: bool,
        from_key: &[u8],
        filter: &[u8],
        keys: &mut OutputBuf<'_>,
        ksizes: &mut [usize],
    ) -> Result<()> {
        if !self.supports(mode) {
            return Err(StorageError::ModeUnsupported(mode.bits()));
        }
        let ignore_keys = mode.contains(Mode::IGNORE_KEYS);
        let keep_last = mode.contains(Mode::KEEP_LAST);

        let _guard = self.state.read().await;
        self.ensure_live()?;
        let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
        let mut emitter = SizedEmitter::new(packed, keys.data, ksizes);
        let mut last_key: Option<Vec<u8>> = None;
        if let Some(table) = Self::read_table(&txn)? {
            let range = table
                .range::<&[u8]>((scan_start(mode, from_key), std::ops::Bound::Unbounded))
                .map_err(|e| data_err("range", e))?;
            for entry in range {
                if emitter.is_full() {
                    break;
                }
                let (key, _) = entry.map_err(|e| data_err("scan", e))?;
                let key = key.value();
                if !filter_matches(mode, filter, key) {
                    continue;
                }
                if ignore_keys {
                    emitter.push_size_only(key.len());
                    if keep_last {
                        last_key = Some(key.to_vec());
                    }
                } else {
                    emitter.push(key);
                }
            }
        }
        keys.len = emitter.finish_listing();

        if let Some(last) = last_key {
            if last.len() <= keys.data.len() {
                keys.data[..last.len()].copy_from_slice(&last);
                keys.len = last.len();
            }
        }
        Ok(())
    }

    async fn list_key_values(
        &self,
        mode: Mode,
        packed: bool,
        from_key: &[u8],
        filter: &[u8],
        keys: &mut OutputBuf<'_>,
        ksizes: &mut [usize],
        vals: &mut OutputBuf<'_>,
        vsizes: &mut [usize],
    ) -> Result<()> {
        if !self.supports(mode) {
            return Err(StorageError::ModeUnsupported(mode.bits()));
        }
        if ksizes.len() != vsizes.len() {
            return Err(StorageError::InvalidArgs(
                "key and value size vectors differ in length",
            ));
        }
        let ignore_keys = mode.contains(Mode::IGNORE_KEYS);
        let keep_last = mode.contains(Mode::KEEP_LAST);

        let _guard = self.state.read().await;
        self.ensure_live()?;
        let txn = self.db.begin_read().map_err(|e| engine_err("read txn", e))?;
        let mut key_emitter = SizedEmitter::new(packed, keys.data, ksizes);
        let mut value_emitter = SizedEmitter::new(packed, vals.data, vsizes);
        let mut last_key: Option<Vec<u8>> = None;
        if let Some(table) = Self::read_table(&txn)? {
            let range = table
                .range::<&[u8]>((scan_start(mode, from_key), std::ops::Bound::Unbounded))
                .map_err(|e| data_err("range", e))?;
            for entry in range {
                if key_emitter.is_full() {
                    break;
                }
                let (key, value) = entry.map_err(|e| data_err("scan", e))?;
                let key = key.value();
                if !filter_matches(mode, filter, key) {
                    continue;
                }
                if ignore_keys {
                    key_emitter.push_size_only(key.len());
                    if keep_last {
                        last_key = Some(key.to_vec());
                    }
                } else {
                    key_emitter.push(key);
                }
                value_emitter.push(value.value());
            }
        }
        keys.len = key_emitter.finish_listing();
        vals.len = value_emitter.finish_listing();

        if let Some(last) = last_key {
            if last.len() <= keys.data.len() {
                keys.data[..last.len()].copy_from_slice(&last);
                keys.len = last.len();
            }
        }
        Ok(())
    }

    async fn start_migration(&self) -> Result<Box<dyn MigrationHandle>> {
        let root = self
            .config
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file = self
            .config
            .path
            .file_name()
            .ok_or(StorageError::InvalidArgs("database path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let handle = BackendMigration::over_live_files(
            Arc::clone(&self.state),
            Arc::clone(&self.migrated),
            root,
            vec![file],
            false,
        )
        .await?;
        Ok(Box::new(handle))
    }

    async fn destroy(&self) -> Result<()> {
        let _guard = self.state.write().await;
        self.ensure_live()?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| engine_err("write txn", e))?;
        match txn.delete_table(PAIRS) {
            Ok(_) => {}
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(data_err("delete table", e)),
        }
        txn.commit().map_err(|e| data_err("commit", e))?;
        std::fs::remove_file(&self.config.path)?;
        debug!(path = %self.config.path.display(), "destroyed redb backend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{pack, BUF_TOO_SMALL, NO_MORE_KEYS};
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_backend() -> (Arc<RedbBackend>, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::create(json!({
            "path": dir.path().join("pairs.redb"),
        }))
        .unwrap();
        (backend, dir)
    }

    async fn put_pairs(db: &RedbBackend, pairs: &[(&[u8], &[u8])]) {
        let keys: Vec<&[u8]> = pairs.iter().map(|(k, _)| *k).collect();
        let vals: Vec<&[u8]> = pairs.iter().map(|(_, v)| *v).collect();
        let (kb, ks) = pack(&keys);
        let (vb, vs) = pack(&vals);
        db.put(
            Mode::DEFAULT,
            PackedSlice::new(&kb, &ks).unwrap(),
            PackedSlice::new(&vb, &vs).unwrap(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_basic_roundtrip() {
        let (db, _dir) = temp_backend();
        assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 0);
        put_pairs(&db, &[(b"a", b"1"), (b"bb", b"22")]).await;
        assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 2);

        let (kb, ks) = pack(&[b"a", b"bb", b"missing"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut out = [0u8; 8];
        let mut out = OutputBuf::new(&mut out);
        let mut vsizes = [0usize; 3];
        db.get(Mode::DEFAULT, true, keys, &mut out, &mut vsizes)
            .await
            .unwrap();
        assert_eq!(vsizes, [1, 2, KEY_NOT_FOUND]);
        assert_eq!(out.written(), b"122");
    }

    #[tokio::test]
    async fn test_length_and_exists() {
        let (db, _dir) = temp_backend();
        put_pairs(&db, &[(b"k", b"value")]).await;

        let (kb, ks) = pack(&[b"k", b"nope"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();

        let mut lengths = [0usize; 2];
        db.length(Mode::DEFAULT, keys, &mut lengths).await.unwrap();
        assert_eq!(lengths, [5, KEY_NOT_FOUND]);

        let mut bits = [0u8; 1];
        let mut flags = BitField::new(&mut bits);
        db.exists(Mode::DEFAULT, keys, &mut flags).await.unwrap();
        assert!(flags.get(0));
        assert!(!flags.get(1));
    }

    #[tokio::test]
    async fn test_single_key_new_only_aborts_transaction() {
        let (db, _dir) = temp_backend();
        put_pairs(&db, &[(b"k", b"old")]).await;

        let (kb, ks) = pack(&[b"k"]);
        let (vb, vs) = pack(&[b"new"]);
        let err = db
            .put(
                Mode::NEW_ONLY,
                PackedSlice::new(&kb, &ks).unwrap(),
                PackedSlice::new(&vb, &vs).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::KeyExists));

        // The aborted transaction left the old value in place.
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut out = [0u8; 8];
        let mut out = OutputBuf::new(&mut out);
        let mut vsizes = [0usize];
        db.get(Mode::DEFAULT, true, keys, &mut out, &mut vsizes)
            .await
            .unwrap();
        assert_eq!(out.written(), b"old");
    }

    #[tokio::test]
    async fn test_append_and_erase() {
        let (db, _dir) = temp_backend();
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

        let mut lengths = [0usize];
        db.length(Mode::DEFAULT, keys, &mut lengths).await.unwrap();
        assert_eq!(lengths, [10]);

        db.erase(Mode::DEFAULT, keys).await.unwrap();
        db.length(Mode::DEFAULT, keys, &mut lengths).await.unwrap();
        assert_eq!(lengths, [KEY_NOT_FOUND]);
    }

    #[tokio::test]
    async fn test_ordered_listing() {
        let (db, _dir) = temp_backend();
        put_pairs(&db, &[(b"bb", b"3"), (b"aa", b"1"), (b"ab", b"2")]).await;

        let mut out = [0u8; 32];
        let mut out = OutputBuf::new(&mut out);
        let mut ksizes = [0usize; 4];
        db.list_keys(Mode::INCLUSIVE, true, b"ab", b"", &mut out, &mut ksizes)
            .await
            .unwrap();
        assert_eq!(ksizes, [2, 2, NO_MORE_KEYS, NO_MORE_KEYS]);
        assert_eq!(out.written(), b"abbb");

        let mut out2 = [0u8; 32];
        let mut out2 = OutputBuf::new(&mut out2);
        let mut ksizes2 = [0usize; 4];
        db.list_keys(Mode::DEFAULT, true, b"ab", b"", &mut out2, &mut ksizes2)
            .await
            .unwrap();
        assert_eq!(out2.written(), b"bb");
    }

    #[tokio::test]
    async fn test_listing_prefix_and_values() {
        let (db, _dir) = temp_backend();
        put_pairs(&db, &[(b"apple", b"1"), (b"apricot", b"22"), (b"banana", b"3")]).await;

        let mut kout = [0u8; 32];
        let mut kout = OutputBuf::new(&mut kout);
        let mut ksizes = [0usize; 3];
        let mut vout = [0u8; 32];
        let mut vout = OutputBuf::new(&mut vout);
        let mut vsizes = [0usize; 3];
        db.list_key_values(
            Mode::DEFAULT,
            true,
            b"",
            b"ap",
            &mut kout,
            &mut ksizes,
            &mut vout,
            &mut vsizes,
        )
        .await
        .unwrap();
        assert_eq!(ksizes, [5, 7, NO_MORE_KEYS]);
        assert_eq!(vsizes, [1, 2, NO_MORE_KEYS]);
        assert_eq!(kout.written(), b"appleapricot");
        assert_eq!(vout.written(), b"122");
    }

    #[tokio::test]
    async fn test_packed_get_exhaustion() {
        let (db, _dir) = temp_backend();
        put_pairs(&db, &[(b"a", b"1"), (b"bb", b"22")]).await;

        let (kb, ks) = pack(&[b"a", b"bb"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut out = [0u8; 2];
        let mut out = OutputBuf::new(&mut out);
        let mut vsizes = [0usize; 2];
        db.get(Mode::DEFAULT, true, keys, &mut out, &mut vsizes)
            .await
            .unwrap();
        assert_eq!(vsizes, [1, BUF_TOO_SMALL]);
        assert_eq!(out.len, 1);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.redb");

        {
            let db = RedbBackend::create(json!({ "path": path })).unwrap();
            put_pairs(&db, &[(b"durable", b"yes")]).await;
        }

        let db = RedbBackend::create(json!({ "path": path })).unwrap();
        let (kb, ks) = pack(&[b"durable"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut lengths = [0usize];
        db.length(Mode::DEFAULT, keys, &mut lengths).await.unwrap();
        assert_eq!(lengths, [3]);
    }

    #[tokio::test]
    async fn test_create_if_missing_off() {
        let dir = TempDir::new().unwrap();
        let err = RedbBackend::create(json!({
            "path": dir.path().join("absent.redb"),
            "create_if_missing": false,
        }))
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_error_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pairs.redb");
        drop(RedbBackend::create(json!({ "path": path })).unwrap());

        let err = RedbBackend::create(json!({
            "path": path,
            "error_if_exists": true,
        }))
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_missing_path_rejected() {
        let err = RedbBackend::create(json!({})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_no_wait_support() {
        let (db, _dir) = temp_backend();
        assert!(!db.supports(Mode::WAIT));
        let (kb, ks) = pack(&[b"k"]);
        let keys = PackedSlice::new(&kb, &ks).unwrap();
        let mut lengths = [0usize];
        let err = db.length(Mode::WAIT, keys, &mut lengths).await.unwrap_err();
        assert!(matches!(err, StorageError::ModeUnsupported(_)));
    }

    #[tokio::test]
    async fn test_migration_roundtrip() {
        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join("source.redb");
        let db = RedbBackend::create(json!({ "path": source_path })).unwrap();
        put_pairs(&db, &[(b"k1", b"v1"), (b"k2", b"v2")]).await;

        let handle = db.start_migration().await.unwrap();
        let recovered = RedbBackend::recover(
            json!({ "path": dir.path().join("dest.redb") }),
            json!({}),
            handle.root(),
            &handle.files().to_vec(),
        )
        .unwrap();
        drop(handle);

        assert!(matches!(
            db.count(Mode::DEFAULT).await.unwrap_err(),
            StorageError::Migrated
        ));
        // The source file was removed by the completed migration.
        assert!(!dir.path().join("source.redb").exists());
        assert_eq!(recovered.count(Mode::DEFAULT).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_destroy_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pairs.redb");
        let db = RedbBackend::create(json!({ "path": path })).unwrap();
        put_pairs(&db, &[(b"k", b"v")]).await;

        db.destroy().await.unwrap();
        assert!(!dir.path().join("pairs.redb").exists());
    }
}
