// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Migration handles.
//
// `start_migration` returns a handle that owns a consistent snapshot of
// the backend's state: a root directory plus a list of file names the
// destination provider pulls. The handle holds the backend's read lock for
// its whole lifetime so no writer can tear the snapshot. Dropping the
// handle without cancelling performs the terminal transition: the migrated
// flag is raised (every later operation fails with `Migrated`) and the
// live data is discarded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coffer_snapshot::SnapshotWriter;
use tempfile::TempDir;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// Name of the single snapshot file produced by the in-memory backends.
pub const SNAPSHOT_FILE: &str = "data.snapshot";

/// A live migration of one backend.
impl std::fmt::Debug for dyn MigrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationHandle").field("root", &self.root()).finish()
    }
}

pub trait MigrationHandle: Send {
    /// Directory containing the snapshot files.
    fn root(&self) -> &Path;

    /// File names within [`MigrationHandle::root`].
    fn files(&self) -> &[String];

    /// Abort the migration: the backend stays live and keeps its data.
    fn cancel(&mut self);
}

/// Where a migration's files live.
enum SnapshotLocation {
    /// A temporary directory owned by the handle (in-memory backends dump
    /// their pairs into it). Removed on drop regardless of outcome.
    Temp(TempDir),
    /// The backend's own backing files (disk backends expose them in
    /// place). Removed on a completed migration; `remove_root_dir`
    /// distinguishes engines that own their whole directory from engines
    /// whose file sits in a shared one.
    Live {
        root: PathBuf,
        remove_root_dir: bool,
    },
}

/// Shared migration-handle implementation, generic over the backend's
/// lock-protected state.
///
/// Holding the `OwnedRwLockReadGuard` is what blocks writers; the state
/// `Arc` is kept separately so the terminal transition can clear the data
/// once the guard is released.
pub(crate) struct BackendMigration<S: Default + Send + Sync + 'static> {
    location: SnapshotLocation,
    files: Vec<String>,
    guard: Option<OwnedRwLockReadGuard<S>>,
    state: Arc<RwLock<S>>,
    migrated: Arc<AtomicBool>,
    cancelled: bool,
}

impl<S: Default + Send + Sync + 'static> std::fmt::Debug for BackendMigration<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendMigration")
            .field("files", &self.files)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl<S: Default + Send + Sync + 'static> BackendMigration<S> {
    /// Dump the backend's pairs into a fresh temporary directory using the
    /// snapshot record format. Used by the in-memory backends.
    pub(crate) async fn snapshot_to_temp(
        state: Arc<RwLock<S>>,
        migrated: Arc<AtomicBool>,
        dump: impl FnOnce(&S, &mut SnapshotWriter) -> Result<()>,
    ) -> Result<Self> {
        let guard = Arc::clone(&state).read_owned().await;
        if migrated.load(Ordering::Acquire) {
            return Err(StorageError::Migrated);
        }
        let dir = TempDir::new()?;
        let mut writer = SnapshotWriter::create(dir.path().join(SNAPSHOT_FILE))?;
        dump(&guard, &mut writer)?;
        writer.finish()?;
        debug!(root = %dir.path().display(), "snapshot migration started");
        Ok(Self {
            location: SnapshotLocation::Temp(dir),
            files: vec![SNAPSHOT_FILE.to_string()],
            guard: Some(guard),
            state,
            migrated,
            cancelled: false,
        })
    }

    /// Expose the backend's own backing files. Used by the disk backends,
    /// whose on-disk representation is already migration-ready.
    pub(crate) async fn over_live_files(
        state: Arc<RwLock<S>>,
        migrated: Arc<AtomicBool>,
        root: PathBuf,
        files: Vec<String>,
        remove_root_dir: bool,
    ) -> Result<Self> {
        let guard = Arc::clone(&state).read_owned().await;
        if migrated.load(Ordering::Acquire) {
            return Err(StorageError::Migrated);
        }
        debug!(root = %root.display(), ?files, "live-file migration started");
        Ok(Self {
            location: SnapshotLocation::Live {
                root,
                remove_root_dir,
            },
            files,
            guard: Some(guard),
            state,
            migrated,
            cancelled: false,
        })
    }
}

impl<S: Default + Send + Sync + 'static> MigrationHandle for BackendMigration<S> {
    fn root(&self) -> &Path {
        match &self.location {
            SnapshotLocation::Temp(dir) => dir.path(),
            SnapshotLocation::Live { root, .. } => root,
        }
    }

    fn files(&self) -> &[String] {
        &self.files
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }
}

impl<S: Default + Send + Sync + 'static> Drop for BackendMigration<S> {
    fn drop(&mut self) {
        if self.cancelled {
            // Aborted: release the lock, keep the backend live. A Temp
            // location removes its directory on its own drop.
            return;
        }

        // Raise the terminal flag while the read lock is still held, so
        // any writer that acquires the lock next already observes it.
        self.migrated.store(true, Ordering::Release);
        self.guard.take();

        // Discard live data opportunistically. Drop cannot block on the
        // lock; if a straggling reader still holds it, the flag alone
        // keeps the data unreachable.
        if let Ok(mut state) = self.state.try_write() {
            *state = S::default();
        }

        if let SnapshotLocation::Live {
            root,
            remove_root_dir,
        } = &self.location
        {
            let result = if *remove_root_dir {
                std::fs::remove_dir_all(root)
            } else {
                self.files
                    .iter()
                    .try_for_each(|f| std::fs::remove_file(root.join(f)))
            };
            if let Err(err) = result {
                warn!(root = %root.display(), %err, "failed to remove migrated files");
            }
        }
    }
}
