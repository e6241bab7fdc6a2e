// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Log-structured persistent backend.
//
// Mutations append framed, checksummed records to a single segment file;
// the live key set is a `BTreeMap` index rebuilt by replaying the segment
// on open. Reads never touch the disk.
//
// Record framing (all integers little-endian):
//
//   [4 bytes: record length (u32)]  -- length of everything after this field
//   [4 bytes: crc32]                -- over everything after this field
//   [1 byte:  op]                   -- 0 = put, 1 = erase
//   [4 bytes: key length (u32)]
//   [N bytes: key]
//   [4 bytes: value length (u32)]   -- zero for erase records
//   [M bytes: value]
//
// A record torn at the end of the segment is the signature of a crash
// during append and is dropped silently; a checksum failure anywhere else
// fails the open with `Corruption`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::{check_batch, filter_matches, scan_start, DatabaseBackend, FetchCallback};
use crate::buffer::{BitField, OutputBuf, PackedSlice, SizedEmitter, KEY_NOT_FOUND};
use crate::error::{Result, StorageError};
use crate::migration::{BackendMigration, MigrationHandle};
use crate::mode::Mode;

/// Name of the segment file inside the backend's directory.
const SEGMENT_FILE: &str = "segment.log";

/// Any record declaring more than this is treated as corruption.
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

const OP_PUT: u8 = 0;
const OP_ERASE: u8 = 1;

fn default_create_if_missing() -> bool {
    true
}

fn default_use_lock() -> bool {
    true
}

/// Configuration of the `log` backend. Unknown keys are accepted and
/// echoed back by `config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding the segment file. Required.
    pub path: PathBuf,
    /// Create the directory if it does not exist.
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
    /// Refuse to open a directory that already exists.
    #[serde(default)]
    pub error_if_exists: bool,
    /// Engage the reader/writer lock (see the note on `MemoryConfig`).
    #[serde(default = "default_use_lock")]
    pub use_lock: bool,
    /// fsync the segment after every write batch.
    #[serde(default)]
    pub sync: bool,
    /// Unrecognized configuration keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Lock-protected state: the replayed index plus the append handle.
#[derive(Debug, Default)]
pub(crate) struct LogState {
    pub(crate) index: BTreeMap<Box<[u8]>, Box<[u8]>>,
    file: Option<File>,
}

/// Log-structured persistent backend.
#[derive(Debug)]
pub struct LogBackend {
    config: LogConfig,
    state: Arc<RwLock<LogState>>,
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

/// Frame one mutation record.
fn encode_record(op: u8, key: &[u8], value: &[u8]) -> Vec<u8> {
    let inner_len = 1 + 4 + key.len() + 4 + value.len();
    let mut inner = Vec::with_capacity(inner_len);
    inner.push(op);
    inner.extend_from_slice(&(key.len() as u32).to_le_bytes());
    inner.extend_from_slice(key);
    inner.extend_from_slice(&(value.len() as u32).to_le_bytes());
    inner.extend_from_slice(&value[..]);

    let crc = crc32fast::hash(&inner);
    let mut record = Vec::with_capacity(4 + 4 + inner.len());
    record.extend_from_slice(&((4 + inner.len()) as u32).to_le_bytes());
    record.extend_from_slice(&crc.to_le_bytes());
    record.extend_from_slice(&inner);
    record
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Replay a segment into an index. A truncated record at the tail is
/// dropped; a checksum or framing failure anywhere else is corruption.
///
/// Returns the index plus the offset of the first dropped byte, so the
/// caller can truncate the torn tail before appending new records after
/// it.
fn replay_segment(data: &[u8]) -> Result<(BTreeMap<Box<[u8]>, Box<[u8]>>, u64)> {
    let mut index = BTreeMap::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let Some(record_len) = read_u32(data, offset) else {
            warn!(offset, "torn record length at end of segment, dropping tail");
            break;
        };
        if record_len < 4 || record_len > MAX_RECORD_SIZE {
            return Err(StorageError::Corruption(format!(
                "record at offset {offset} declares {record_len} bytes"
            )));
        }
        let record_end = offset + 4 + record_len as usize;
        if record_end > data.len() {
            warn!(offset, "torn record at end of segment, dropping tail");
            break;
        }

        let stored_crc = read_u32(data, offset + 4).ok_or_else(|| {
            StorageError::Corruption(format!("unreadable checksum at offset {offset}"))
        })?;
        let inner = &data[offset + 8..record_end];
        let actual_crc = crc32fast::hash(inner);
        if stored_crc != actual_crc {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch at offset {offset}: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }

        let parse = || -> Option<(u8, &[u8], &[u8])> {
            let op = *inner.first()?;
            let klen = u32::from_le_bytes(inner.get(1..5)?.try_into().ok()?) as usize;
            let key = inner.get(5..5 + klen)?;
            let vstart = 5 + klen;
            let vlen =
                u32::from_le_bytes(inner.get(vstart..vstart + 4)?.try_into().ok()?) as usize;
            let value = inner.get(vstart + 4..vstart + 4 + vlen)?;
            Some((op, key, value))
        };
        let Some((op, key, value)) = parse() else {
            return Err(StorageError::Corruption(format!(
                "malformed record at offset {offset}"
            )));
        };

        match op {
            OP_PUT => {
                index.insert(key.into(), value.into());
            }
            OP_ERASE => {
                index.remove(key);
            }
            other => {
                return Err(StorageError::Corruption(format!(
                    "unknown record op {other} at offset {offset}"
                )));
            }
        }
        offset = record_end;
    }

    Ok((index, offset as u64))
}

impl LogBackend {
    /// Open or create a log directory from a JSON configuration document.
    pub fn create(config: serde_json::Value) -> Result<Arc<Self>> {
        let cfg: LogConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        Self::open(cfg)
    }

    /// Rebuild a backend from the files of a completed migration: the
    /// source segment is copied into the configured directory and
    /// replayed.
    pub fn recover(
        config: serde_json::Value,
        _migration_config: serde_json::Value,
        root: &Path,
        files: &[String],
    ) -> Result<Arc<Self>> {
        let cfg: LogConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        std::fs::create_dir_all(&cfg.path)?;
        for file in files {
            std::fs::copy(root.join(file), cfg.path.join(file))?;
        }
        Self::open(LogConfig {
            create_if_missing: false,
            error_if_exists: false,
            ..cfg
        })
    }

    fn open(cfg: LogConfig) -> Result<Arc<Self>> {
        let exists = cfg.path.is_dir();
        if exists && cfg.error_if_exists {
            return Err(StorageError::InvalidConfig(format!(
                "log directory already exists at {}",
                cfg.path.display()
            )));
        }
        if !exists {
            if !cfg.create_if_missing {
                return Err(StorageError::InvalidConfig(format!(
                    "no log directory at {} and create_if_missing is off",
                    cfg.path.display()
                )));
            }
            std::fs::create_dir_all(&cfg.path)?;
        }

        let segment_path = cfg.path.join(SEGMENT_FILE);
        let index = if segment_path.is_file() {
            let data = std::fs::read(&segment_path)?;
            let (index, valid_len) = replay_segment(&data)?;
            if valid_len < data.len() as u64 {
                // New records must not land after the torn bytes, or the
                // next replay would misframe them.
                let file = OpenOptions::new().write(true).open(&segment_path)?;
                file.set_len(valid_len)?;
            }
            index
        } else {
            BTreeMap::new()
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)?;
        debug!(
            path = %cfg.path.display(),
            pairs = index.len(),
            "opened log backend"
        );

        Ok(Arc::new(Self {
            config: cfg,
            state: Arc::new(RwLock::new(LogState {
                index,
                file: Some(file),
            })),
            migrated: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.migrated.load(Ordering::Acquire) {
            return Err(StorageError::Migrated);
        }
        Ok(())
    }

    /// Append one framed record to the segment.
    fn append(state: &mut LogState, sync: bool, op: u8, key: &[u8], value: &[u8]) -> Result<()> {
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Other("log segment is closed".to_string()))?;
        file.write_all(&encode_record(op, key, value))?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for LogBackend {
    fn kind(&self) -> &'static str {
        "log"
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
        let guard = self.state.read().await;
        self.ensure_live()?;
        Ok(guard.index.len() as u64)
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
        let guard = self.state.read().await;
        self.ensure_live()?;
        for (i, key) in keys.iter().enumerate() {
            flags.set(i, guard.index.contains_key(key));
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
        let guard = self.state.read().await;
        self.ensure_live()?;
        for (i, key) in keys.iter().enumerate() {
            vsizes[i] = match guard.index.get(key) {
                Some(value) => value.len(),
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
        let sync = self.config.sync;

        let mut guard = self.state.write().await;
        self.ensure_live()?;
        for (key, value) in keys.iter().zip(vals.iter()) {
            let existing = guard.index.get(key);
            if new_only && existing.is_some() {
                if single {
                    return Err(StorageError::KeyExists);
                }
                continue;
            }
            if exist_only && existing.is_none() {
                if single {
                    return Err(StorageError::NotFound);
                }
                continue;
            }
            let stored: Box<[u8]> = match existing {
                Some(old) if append => {
                    let mut extended = Vec::with_capacity(old.len() + value.len());
                    extended.extend_from_slice(old);
                    extended.extend_from_slice(value);
                    extended.into()
                }
                _ => value.into(),
            };
            Self::append(&mut guard, sync, OP_PUT, key, &stored)?;
            guard.index.insert(key.into(), stored);
        }
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
            let guard = self.state.read().await;
            self.ensure_live()?;
            let mut emitter = SizedEmitter::new(packed, vals.data, vsizes);
            for key in keys.iter() {
                match guard.index.get(key) {
                    Some(value) => emitter.push(value),
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
            let guard = self.state.read().await;
            self.ensure_live()?;
            for key in keys.iter() {
                match guard.index.get(key) {
                    Some(value) => callback(key, Some(value))?,
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
        let sync = self.config.sync;
        let mut guard = self.state.write().await;
        self.ensure_live()?;
        for key in keys.iter() {
            if guard.index.remove(key).is_some() {
                Self::append(&mut guard, sync, OP_ERASE, key, b"")?;
            }
        }
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

        let guard = self.state.read().await;
        self.ensure_live()?;
        let mut emitter = SizedEmitter::new(packed, keys.data, ksizes);
        let mut last_key: Option<&[u8]> = None;
        for (key, _) in guard
            .index
            .range::<[u8], _>((scan_start(mode, from_key), Bound::Unbounded))
        {
            if emitter.is_full() {
                break;
            }
            if !filter_matches(mode, filter, key) {
                continue;
            }
            if ignore_keys {
                emitter.push_size_only(key.len());
                last_key = Some(key);
            } else {
                emitter.push(key);
            }
        }
        keys.len = emitter.finish_listing();

        if keep_last {
            if let Some(last) = last_key {
                if last.len() <= keys.data.len() {
                    keys.data[..last.len()].copy_from_slice(last);
                    keys.len = last.len();
                }
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

        let guard = self.state.read().await;
        self.ensure_live()?;
        let mut key_emitter = SizedEmitter::new(packed, keys.data, ksizes);
        let mut value_emitter = SizedEmitter::new(packed, vals.data, vsizes);
        let mut last_key: Option<&[u8]> = None;
        for (key, value) in guard
            .index
            .range::<[u8], _>((scan_start(mode, from_key), Bound::Unbounded))
        {
            if key_emitter.is_full() {
                break;
            }
            if !filter_matches(mode, filter, key) {
                continue;
            }
            if ignore_keys {
                key_emitter.push_size_only(key.len());
                last_key = Some(key);
            } else {
                key_emitter.push(key);
            }
            value_emitter.push(value);
        }
        keys.len = key_emitter.finish_listing();
        vals.len = value_emitter.finish_listing();

        if keep_last {
            if let Some(last) = last_key {
                if last.len() <= keys.data.len() {
                    keys.data[..last.len()].copy_from_slice(last);
                    keys.len = last.len();
                }
            }
        }
        Ok(())
    }

    async fn start_migration(&self) -> Result<Box<dyn MigrationHandle>> {
        // Everything appended so far was written straight to the file; an
        // explicit sync makes the copy crash-consistent on the other side.
        {
            let mut guard = self.state.write().await;
            self.ensure_live()?;
            if let Some(file) = guard.file.as_mut() {
                file.sync_data()?;
            }
        }
        let handle = BackendMigration::over_live_files(
            Arc::clone(&self.state),
            Arc::clone(&self.migrated),
            self.config.path.clone(),
            vec![SEGMENT_FILE.to_string()],
            true,
        )
        .await?;
        Ok(Box::new(handle))
    }

    async fn destroy(&self) -> Result<()> {
        let mut guard = self.state.write().await;
        self.ensure_live()?;
        guard.index.clear();
        guard.file = None;
        std::fs::remove_dir_all(&self.config.path)?;
        debug!(path = %self.config.path.display(), "destroyed log backend");
        Ok(())
    }
}

// TODO: compact the segment once erase records dominate; replay cost
// currently grows with every dead record.
