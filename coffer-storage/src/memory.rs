// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reference unordered backend.
//
// A hash-map engine exercising every feature of the backend contract:
// batched buffer-protocol operations, the key watcher behind
// `Mode::WAIT`/`Mode::NOTIFY`, pluggable allocators, and snapshot
// migration. Listings are unsupported -- the map has no useful iteration
// order; use the `btree` backend when ordered scans matter.
//
// Batches commit per item: a failure mid-batch leaves the items before it
// applied.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coffer_snapshot::SnapshotReader;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::allocator::{resolve_allocator, AllocatorsConfig, ChunkAllocator};
use crate::backend::{check_batch, DatabaseBackend, FetchCallback};
use crate::buffer::{BitField, OutputBuf, PackedSlice, SizedEmitter, KEY_NOT_FOUND};
use crate::error::{Result, StorageError};
use crate::migration::{BackendMigration, MigrationHandle};
use crate::mode::Mode;
use crate::watcher::{KeyWatcher, WaitOutcome};

fn default_use_lock() -> bool {
    true
}

fn default_initial_bucket_count() -> usize {
    23
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

/// Configuration of the `memory` backend. Unknown keys are accepted and
/// echoed back by `config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Engage the reader/writer lock. Accepted for compatibility with
    /// single-threaded deployments; the Rust engine locks regardless, as
    /// an unsynchronized shared map would be unsound.
    #[serde(default = "default_use_lock")]
    pub use_lock: bool,
    /// Initial hash-table capacity.
    #[serde(default = "default_initial_bucket_count")]
    pub initial_bucket_count: usize,
    /// Per-component allocator selection.
    #[serde(default)]
    pub allocators: AllocatorsConfig,
    /// Accepted for the document-mixin layer; unused by the core.
    #[serde(default)]
    pub disable_doc_mixin_lock: bool,
    /// How long a `Mode::WAIT` operation waits for a key before failing
    /// the batch with `TimedOut`.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Unrecognized configuration keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The lock-protected map state.
#[derive(Debug, Default)]
pub(crate) struct PairMap {
    pub(crate) map: HashMap<Box<[u8]>, Box<[u8]>>,
}

/// The reference unordered backend.
///
/// # Example
///
/// ```rust
/// use coffer_storage::backend::DatabaseBackend;
/// use coffer_storage::buffer::{OutputBuf, PackedSlice};
/// use coffer_storage::memory::MemoryBackend;
/// use coffer_storage::mode::Mode;
///
/// # tokio_test::block_on(async {
/// let db = MemoryBackend::create(serde_json::json!({})).unwrap();
///
/// let keys = PackedSlice::new(b"abb", &[1, 2]).unwrap();
/// let vals = PackedSlice::new(b"122", &[1, 2]).unwrap();
/// db.put(Mode::DEFAULT, keys, vals).await.unwrap();
/// assert_eq!(db.count(Mode::DEFAULT).await.unwrap(), 2);
///
/// let mut buf = [0u8; 8];
/// let mut out = OutputBuf::new(&mut buf);
/// let mut vsizes = [0usize; 2];
/// db.get(Mode::DEFAULT, true, keys, &mut out, &mut vsizes).await.unwrap();
/// assert_eq!(out.written(), b"122");
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryBackend {
    config: MemoryConfig,
    state: Arc<RwLock<PairMap>>,
    watcher: KeyWatcher,
    migrated: Arc<AtomicBool>,
    key_allocator: Arc<dyn ChunkAllocator>,
    value_allocator: Arc<dyn ChunkAllocator>,
    wait_timeout: Duration,
}

const SUPPORTED_MODES: Mode = Mode::from_bits(
    Mode::APPEND.bits()
        | Mode::CONSUME.bits()
        | Mode::WAIT.bits()
        | Mode::NOTIFY.bits()
        | Mode::NEW_ONLY.bits()
        | Mode::EXIST_ONLY.bits()
        | Mode::UPDATE_NEW.bits(),
);

impl MemoryBackend {
    /// Build a backend from a JSON configuration document.
    pub fn create(config: serde_json::Value) -> Result<Arc<Self>> {
        let cfg: MemoryConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        Self::with_map(cfg, None)
    }

    /// Rebuild a backend from the snapshot files of a completed migration.
    ///
    /// Every file must parse completely; a truncated or damaged snapshot
    /// fails the recovery and the partial state is discarded.
    pub fn recover(
        config: serde_json::Value,
        _migration_config: serde_json::Value,
        root: &Path,
        files: &[String],
    ) -> Result<Arc<Self>> {
        let cfg: MemoryConfig = serde_json::from_value(config)
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        let key_allocator = resolve_allocator(
            &cfg.allocators.key_allocator,
            &cfg.allocators.key_allocator_config,
        )?;
        let value_allocator = resolve_allocator(
            &cfg.allocators.value_allocator,
            &cfg.allocators.value_allocator_config,
        )?;

        let mut map = HashMap::with_capacity(cfg.initial_bucket_count);
        for file in files {
            let records = SnapshotReader::open(root.join(file))?.read_all()?;
            for record in records {
                if record.key.is_empty() {
                    return Err(StorageError::Corruption(
                        "zero-length key in snapshot".to_string(),
                    ));
                }
                map.insert(
                    key_allocator.materialize(&record.key),
                    value_allocator.materialize(&record.value),
                );
            }
        }
        debug!(pairs = map.len(), "recovered memory backend from snapshot");
        Self::with_map(cfg, Some(map))
    }

    fn with_map(cfg: MemoryConfig, map: Option<HashMap<Box<[u8]>, Box<[u8]>>>) -> Result<Arc<Self>> {
        let key_allocator = resolve_allocator(
            &cfg.allocators.key_allocator,
            &cfg.allocators.key_allocator_config,
        )?;
        let value_allocator = resolve_allocator(
            &cfg.allocators.value_allocator,
            &cfg.allocators.value_allocator_config,
        )?;
        // The node allocator cannot rebind std map nodes; resolving it
        // still validates the name so misconfigurations fail loudly.
        resolve_allocator(
            &cfg.allocators.node_allocator,
            &cfg.allocators.node_allocator_config,
        )?;

        let map = map.unwrap_or_else(|| HashMap::with_capacity(cfg.initial_bucket_count));
        let wait_timeout = Duration::from_millis(cfg.wait_timeout_ms);
        Ok(Arc::new(Self {
            config: cfg,
            state: Arc::new(RwLock::new(PairMap { map })),
            watcher: KeyWatcher::new(),
            migrated: Arc::new(AtomicBool::new(false)),
            key_allocator,
            value_allocator,
            wait_timeout,
        }))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.migrated.load(Ordering::Acquire) {
            return Err(StorageError::Migrated);
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn is_sorted(&self) -> bool {
        false
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
        Ok(guard.map.len() as u64)
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
        let wait = mode.contains(Mode::WAIT);
        let mut guard = self.state.read().await;
        self.ensure_live()?;
        for (i, key) in keys.iter().enumerate() {
            loop {
                if guard.map.contains_key(key) {
                    flags.set(i, true);
                    break;
                }
                if !wait {
                    flags.set(i, false);
                    break;
                }
                let waiter = self.watcher.add_key(key);
                drop(guard);
                match waiter.wait(self.wait_timeout).await {
                    WaitOutcome::KeyPresent => {
                        guard = self.state.read().await;
                        self.ensure_live()?;
                    }
                    WaitOutcome::TimedOut => return Err(StorageError::TimedOut),
                }
            }
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
        let wait = mode.contains(Mode::WAIT);
        let mut guard = self.state.read().await;
        self.ensure_live()?;
        for (i, key) in keys.iter().enumerate() {
            loop {
                if let Some(value) = guard.map.get(key) {
                    vsizes[i] = value.len();
                    break;
                }
                if !wait {
                    vsizes[i] = KEY_NOT_FOUND;
                    break;
                }
                let waiter = self.watcher.add_key(key);
                drop(guard);
                match waiter.wait(self.wait_timeout).await {
                    WaitOutcome::KeyPresent => {
                        guard = self.state.read().await;
                        self.ensure_live()?;
                    }
                    WaitOutcome::TimedOut => return Err(StorageError::TimedOut),
                }
            }
        }
        Ok(())
    }

    async fn put(&self, mode: Mode, keys: PackedSlice<'_>, vals: PackedSlice<'_>) -> Result<()> {
        check_batch(self, mode, &keys, Some(vals.len()))?;
        let new_only = mode.contains(Mode::NEW_ONLY);
        let exist_only = mode.contains(Mode::EXIST_ONLY);
        let append = mode.contains(Mode::APPEND);
        let notify = mode.contains(Mode::NOTIFY);
        let update_new = mode.contains(Mode::UPDATE_NEW);
        let single = keys.len() == 1;

        let mut guard = self.state.write().await;
        self.ensure_live()?;
        for (key, value) in keys.iter().zip(vals.iter()) {
            let existed = guard.map.contains_key(key);
            if new_only && existed {
                if single {
                    return Err(StorageError::KeyExists);
                }
                continue;
            }
            if exist_only && !existed {
                if single {
                    return Err(StorageError::NotFound);
                }
                continue;
            }
            if append && existed {
                if let Some(stored) = guard.map.get_mut(key) {
                    let mut extended = Vec::with_capacity(stored.len() + value.len());
                    extended.extend_from_slice(stored);
                    extended.extend_from_slice(value);
                    *stored = self.value_allocator.materialize(&extended);
                }
            } else {
                guard.map.insert(
                    self.key_allocator.materialize(key),
                    self.value_allocator.materialize(value),
                );
            }
            if notify && (!update_new || !existed) {
                self.watcher.notify_key(key);
            }
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

        let wait = mode.contains(Mode::WAIT);
        let mut guard = self.state.read().await;
        self.ensure_live()?;
        let mut emitter = SizedEmitter::new(packed, vals.data, vsizes);
        for key in keys.iter() {
            loop {
                if let Some(value) = guard.map.get(key) {
                    emitter.push(value);
                    break;
                }
                if !wait {
                    emitter.push_missing();
                    break;
                }
                let waiter = self.watcher.add_key(key);
                drop(guard);
                match waiter.wait(self.wait_timeout).await {
                    WaitOutcome::KeyPresent => {
                        guard = self.state.read().await;
                        self.ensure_live()?;
                    }
                    WaitOutcome::TimedOut => return Err(StorageError::TimedOut),
                }
            }
        }
        vals.len = emitter.finish();
        drop(guard);

        if mode.contains(Mode::CONSUME) {
            // The consume happens after the whole scan; a key some racer
            // already consumed must not re-suspend the call, so WAIT is
            // stripped from the forwarded erase.
            self.erase(mode.without(Mode::WAIT), keys).await?;
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
        let wait = mode.contains(Mode::WAIT);
        let mut guard = self.state.read().await;
        self.ensure_live()?;
        for key in keys.iter() {
            loop {
                if let Some(value) = guard.map.get(key) {
                    callback(key, Some(value))?;
                    break;
                }
                if !wait {
                    callback(key, None)?;
                    break;
                }
                let waiter = self.watcher.add_key(key);
                drop(guard);
                match waiter.wait(self.wait_timeout).await {
                    WaitOutcome::KeyPresent => {
                        guard = self.state.read().await;
                        self.ensure_live()?;
                    }
                    WaitOutcome::TimedOut => return Err(StorageError::TimedOut),
                }
            }
        }
        drop(guard);

        if mode.contains(Mode::CONSUME) {
            self.erase(mode.without(Mode::WAIT), keys).await?;
        }
        Ok(())
    }

    async fn erase(&self, mode: Mode, keys: PackedSlice<'_>) -> Result<()> {
        check_batch(self, mode, &keys, None)?;
        let wait = mode.contains(Mode::WAIT);
        let mut guard = self.state.write().await;
        self.ensure_live()?;
        for key in keys.iter() {
            loop {
                if guard.map.remove(key).is_some() {
                    break;
                }
                if !wait {
                    break;
                }
                let waiter = self.watcher.add_key(key);
                drop(guard);
                match waiter.wait(self.wait_timeout).await {
                    WaitOutcome::KeyPresent => {
                        guard = self.state.write().await;
                        self.ensure_live()?;
                    }
                    WaitOutcome::TimedOut => return Err(StorageError::TimedOut),
                }
            }
        }
        Ok(())
    }

    async fn start_migration(&self) -> Result<Box<dyn MigrationHandle>> {
        let handle = BackendMigration::snapshot_to_temp(
            Arc::clone(&self.state),
            Arc::clone(&self.migrated),
            |state, writer| {
                for (key, value) in &state.map {
                    writer.append(key, value)?;
                }
                Ok(())
            },
        )
        .await?;
        Ok(Box::new(handle))
    }

    async fn destroy(&self) -> Result<()> {
        let mut guard = self.state.write().await;
        self.ensure_live()?;
        guard.map.clear();
        Ok(())
    }
}
