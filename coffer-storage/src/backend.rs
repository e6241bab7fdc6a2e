// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core storage backend trait.
//
// `DatabaseBackend` is the contract every storage engine implements. All
// operations are batched: a call carries packed key (and value) blobs plus
// size vectors, and reports per-key outcomes through sentinel sizes in the
// caller's size vectors. Data always flows through caller memory -- a
// backend never allocates result buffers and never retains references past
// the call.
//
// Operations a backend does not implement fall through to the default
// bodies, which return `StorageError::Unsupported`.

use async_trait::async_trait;

use crate::buffer::{BitField, OutputBuf, PackedSlice};
use crate::error::{Result, StorageError};
use crate::migration::MigrationHandle;
use crate::mode::Mode;

/// Callback used by [`DatabaseBackend::fetch`]. Receives the key and, if
/// the key is present, a borrowed view of its value. Returning an error
/// aborts the remainder of the batch.
pub type FetchCallback<'a> = dyn FnMut(&[u8], Option<&[u8]>) -> Result<()> + Send + 'a;

/// A pluggable key/value storage engine.
///
/// Keys are opaque byte strings of length >= 1; values are opaque byte
/// strings of length >= 0. Keys are unique within a backend. Ordered
/// backends (`is_sorted() == true`) compare keys lexicographically and
/// additionally implement the listing operations.
///
/// # Locking
///
/// Each backend owns one reader/writer lock. `count`, `exists`, `length`,
/// `get`, `fetch` and the listings take the read side; `put`, `erase` and
/// `destroy` take the write side; a migration handle holds the read side
/// for its whole lifetime. Operations carrying `Mode::WAIT` release the
/// lock around the suspension and re-check after waking.
///
/// # Batching
///
/// Items are processed in index order. A call-level failure aborts the
/// batch and the output buffers are undefined; per-item conditions (key
/// not found, buffer too small, no more keys) are reported through the
/// sentinels and do not abort the call. The in-memory backends commit
/// per item and do not roll back; the redb backend commits each call as
/// one transaction.
impl std::fmt::Debug for dyn DatabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBackend").field("kind", &self.kind()).finish()
    }
}

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// The backend type name this instance was created under (e.g.
    /// "memory").
    fn kind(&self) -> &'static str;

    /// The effective configuration, including defaulted and unknown keys.
    fn config(&self) -> serde_json::Value;

    /// Whether listings return keys in lexicographic order. Unordered
    /// backends return `Unsupported` from the listing operations.
    fn is_sorted(&self) -> bool;

    /// Whether every bit of `mode` is in this backend's supported set.
    fn supports(&self, mode: Mode) -> bool;

    /// Number of key/value pairs stored.
    async fn count(&self, _mode: Mode) -> Result<u64> {
        Err(StorageError::Unsupported)
    }

    /// Set `flags[i]` to whether the i-th key exists. Requires
    /// `keys.len() <= flags.capacity()`. With `Mode::WAIT`, a missing key
    /// suspends the call until the key appears.
    async fn exists(
        &self,
        _mode: Mode,
        _keys: PackedSlice<'_>,
        _flags: &mut BitField<'_>,
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Write each value's length into `vsizes`, or `KEY_NOT_FOUND` for
    /// missing keys (honors `Mode::WAIT`).
    async fn length(
        &self,
        _mode: Mode,
        _keys: PackedSlice<'_>,
        _vsizes: &mut [usize],
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Insert or update pairs. Honors `Mode::APPEND`, `Mode::NEW_ONLY`,
    /// `Mode::EXIST_ONLY`, `Mode::NOTIFY` and `Mode::UPDATE_NEW`.
    async fn put(
        &self,
        _mode: Mode,
        _keys: PackedSlice<'_>,
        _vals: PackedSlice<'_>,
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Copy values into `vals` under the packed or unpacked layout
    /// (see [`crate::buffer::SizedEmitter`]); `vsizes` carries per-slot
    /// capacities in (unpacked only) and actual sizes or sentinels out.
    /// Honors `Mode::WAIT` and `Mode::CONSUME`.
    async fn get(
        &self,
        _mode: Mode,
        _packed: bool,
        _keys: PackedSlice<'_>,
        _vals: &mut OutputBuf<'_>,
        _vsizes: &mut [usize],
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Stream each `(key, value)` to `callback` without copying into
    /// caller buffers; missing keys are streamed as `None`. A callback
    /// error aborts the batch. Honors `Mode::WAIT` and `Mode::CONSUME`.
    async fn fetch(
        &self,
        _mode: Mode,
        _keys: PackedSlice<'_>,
        _callback: &mut FetchCallback<'_>,
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Delete each key if present; absent keys are no-ops unless
    /// `Mode::WAIT` is set.
    async fn erase(&self, _mode: Mode, _keys: PackedSlice<'_>) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Ordered scan of keys starting at `from_key` (the first key when
    /// empty), filtered by `filter` (prefix by default, suffix under
    /// `Mode::SUFFIX`, disabled under `Mode::NO_PREFIX`). Without
    /// `Mode::INCLUSIVE` an exact landing on `from_key` advances one
    /// entry. Emits up to `ksizes.len()` keys; trailing slots receive
    /// `NO_MORE_KEYS`.
    async fn list_keys(
        &self,
        _mode: Mode,
        _packed: bool,
        _from_key: &[u8],
        _filter: &[u8],
        _keys: &mut OutputBuf<'_>,
        _ksizes: &mut [usize],
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Same as [`DatabaseBackend::list_keys`], with parallel value output
    /// under identical packing rules and sentinels.
    #[allow(clippy::too_many_arguments)]
    async fn list_key_values(
        &self,
        _mode: Mode,
        _packed: bool,
        _from_key: &[u8],
        _filter: &[u8],
        _keys: &mut OutputBuf<'_>,
        _ksizes: &mut [usize],
        _vals: &mut OutputBuf<'_>,
        _vsizes: &mut [usize],
    ) -> Result<()> {
        Err(StorageError::Unsupported)
    }

    /// Take a consistent snapshot for migration. The returned handle owns
    /// the snapshot files and holds this backend's read lock for its
    /// lifetime; dropping it without `cancel()` transitions the backend
    /// into the terminal migrated state.
    async fn start_migration(&self) -> Result<Box<dyn MigrationHandle>> {
        Err(StorageError::Unsupported)
    }

    /// Remove all stored data and any backing files.
    async fn destroy(&self) -> Result<()> {
        Err(StorageError::Unsupported)
    }
}

/// Whether `key` passes a listing filter under `mode`: prefix match by
/// default, suffix match under `SUFFIX`, everything under `NO_PREFIX` or
/// an empty filter.
pub(crate) fn filter_matches(mode: Mode, filter: &[u8], key: &[u8]) -> bool {
    if mode.contains(Mode::NO_PREFIX) || filter.is_empty() {
        return true;
    }
    if mode.contains(Mode::SUFFIX) {
        key.ends_with(filter)
    } else {
        key.starts_with(filter)
    }
}

/// The starting bound of a listing scan. An empty `from_key` starts at the
/// first key; otherwise `INCLUSIVE` keeps an exact landing on `from_key`,
/// and its absence steps past it.
pub(crate) fn scan_start(mode: Mode, from_key: &[u8]) -> std::ops::Bound<&[u8]> {
    use std::ops::Bound;
    if from_key.is_empty() {
        Bound::Unbounded
    } else if mode.contains(Mode::INCLUSIVE) {
        Bound::Included(from_key)
    } else {
        Bound::Excluded(from_key)
    }
}

/// Shared argument checks for the lookup-style operations.
///
/// Verifies the mode against the backend's supported set, the minimum key
/// size, and (when a parallel size vector is involved) the one-size-per-key
/// invariant.
pub(crate) fn check_batch(
    backend: &dyn DatabaseBackend,
    mode: Mode,
    keys: &PackedSlice<'_>,
    parallel_len: Option<usize>,
) -> Result<()> {
    if !backend.supports(mode) {
        return Err(StorageError::ModeUnsupported(mode.bits()));
    }
    keys.check_min_key_size()?;
    if let Some(len) = parallel_len {
        if keys.len() != len {
            return Err(StorageError::InvalidArgs(
                "key and value size vectors differ in length",
            ));
        }
    }
    Ok(())
}
