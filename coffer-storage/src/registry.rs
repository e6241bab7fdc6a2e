// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Backend factory registry.
//
// A process-wide map from backend type name to its factory functions: one
// that builds an instance from a configuration document, and one that
// recovers an instance from migration snapshot files. The registry is a
// lazily-initialized static; the built-in backends are registered on first
// access, and embedders can add their own engines with `register_backend`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use crate::backend::DatabaseBackend;
use crate::error::{Result, StorageError};

/// Builds a backend from a configuration document.
pub type CreateFn = fn(serde_json::Value) -> Result<Arc<dyn DatabaseBackend>>;

/// Rebuilds a backend from migration snapshot files:
/// `(config, migration_config, root, files)`.
pub type RecoverFn =
    fn(serde_json::Value, serde_json::Value, &Path, &[String]) -> Result<Arc<dyn DatabaseBackend>>;

struct BackendEntry {
    create: CreateFn,
    recover: Option<RecoverFn>,
}

static REGISTRY: OnceLock<RwLock<HashMap<String, BackendEntry>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, BackendEntry>> {
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            "memory".to_string(),
            BackendEntry {
                create: make_memory,
                recover: Some(recover_memory),
            },
        );
        map.insert(
            "btree".to_string(),
            BackendEntry {
                create: make_btree,
                recover: Some(recover_btree),
            },
        );
        map.insert(
            "redb".to_string(),
            BackendEntry {
                create: make_redb,
                recover: Some(recover_redb),
            },
        );
        map.insert(
            "log".to_string(),
            BackendEntry {
                create: make_log,
                recover: Some(recover_log),
            },
        );
        RwLock::new(map)
    })
}

fn make_memory(config: serde_json::Value) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::memory::MemoryBackend::create(config)?)
}

fn recover_memory(
    config: serde_json::Value,
    migration_config: serde_json::Value,
    root: &Path,
    files: &[String],
) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::memory::MemoryBackend::recover(config, migration_config, root, files)?)
}

fn make_btree(config: serde_json::Value) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::btree::BTreeBackend::create(config)?)
}

fn recover_btree(
    config: serde_json::Value,
    migration_config: serde_json::Value,
    root: &Path,
    files: &[String],
) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::btree::BTreeBackend::recover(config, migration_config, root, files)?)
}

fn make_redb(config: serde_json::Value) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::redb_backend::RedbBackend::create(config)?)
}

fn recover_redb(
    config: serde_json::Value,
    migration_config: serde_json::Value,
    root: &Path,
    files: &[String],
) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::redb_backend::RedbBackend::recover(config, migration_config, root, files)?)
}

fn make_log(config: serde_json::Value) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::log::LogBackend::create(config)?)
}

fn recover_log(
    config: serde_json::Value,
    migration_config: serde_json::Value,
    root: &Path,
    files: &[String],
) -> Result<Arc<dyn DatabaseBackend>> {
    Ok(crate::log::LogBackend::recover(config, migration_config, root, files)?)
}

fn read_lock() -> std::sync::RwLockReadGuard<'static, HashMap<String, BackendEntry>> {
    registry().read().unwrap_or_else(|e| e.into_inner())
}

/// Register a backend type. Returns `false` (and leaves the registry
/// unchanged) if the name is already taken.
pub fn register_backend(name: &str, create: CreateFn, recover: Option<RecoverFn>) -> bool {
    let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
    if map.contains_key(name) {
        return false;
    }
    debug!(name, "registered backend type");
    map.insert(name.to_string(), BackendEntry { create, recover });
    true
}

/// Whether `kind` names a registered backend type.
pub fn has_backend(kind: &str) -> bool {
    read_lock().contains_key(kind)
}

/// The registered backend type names, sorted.
pub fn registered_backends() -> Vec<String> {
    let mut names: Vec<String> = read_lock().keys().cloned().collect();
    names.sort();
    names
}

/// Create a backend of type `kind` from `config`.
pub fn create_database(kind: &str, config: serde_json::Value) -> Result<Arc<dyn DatabaseBackend>> {
    let create = {
        let map = read_lock();
        match map.get(kind) {
            Some(entry) => entry.create,
            None => return Err(StorageError::InvalidType(kind.to_string())),
        }
    };
    create(config)
}

/// Recover a backend of type `kind` from the files of a completed
/// migration.
pub fn recover_database(
    kind: &str,
    config: serde_json::Value,
    migration_config: serde_json::Value,
    root: &Path,
    files: &[String],
) -> Result<Arc<dyn DatabaseBackend>> {
    let recover = {
        let map = read_lock();
        match map.get(kind) {
            Some(entry) => entry.recover,
            None => return Err(StorageError::InvalidType(kind.to_string())),
        }
    };
    match recover {
        Some(recover) => recover(config, migration_config, root, files),
        None => Err(StorageError::Unsupported),
    }
}
