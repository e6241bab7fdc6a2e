// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Pluggable byte allocators for the in-memory backends.
//
// The in-memory backends copy key and value bytes out of caller memory
// into their own storage. Which allocator materializes those copies is a
// configuration choice: the `allocators` section names one allocator per
// component (keys, values, map nodes), each with an optional configuration
// payload. Allocators are small dependency-injected objects resolved by
// name at backend creation time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

impl std::fmt::Debug for dyn ChunkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAllocator").field("name", &self.name()).finish()
    }
}

/// A named strategy for materializing owned byte buffers.
pub trait ChunkAllocator: Send + Sync {
    /// The name this allocator is registered under.
    fn name(&self) -> &'static str;

    /// Produce an owned copy of `bytes`.
    fn materialize(&self, bytes: &[u8]) -> Box<[u8]>;
}

/// The default allocator: plain heap allocations through the system
/// allocator.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl ChunkAllocator for SystemAllocator {
    fn name(&self) -> &'static str {
        "default"
    }

    fn materialize(&self, bytes: &[u8]) -> Box<[u8]> {
        bytes.into()
    }
}

/// An allocator that counts the bytes it has materialized. Useful for
/// sizing experiments and for verifying that the allocator plumbing is
/// actually exercised.
#[derive(Debug, Default)]
pub struct TrackingAllocator {
    allocated: AtomicU64,
}

impl TrackingAllocator {
    /// Total bytes materialized through this allocator.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl ChunkAllocator for TrackingAllocator {
    fn name(&self) -> &'static str {
        "tracking"
    }

    fn materialize(&self, bytes: &[u8]) -> Box<[u8]> {
        self.allocated.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        bytes.into()
    }
}

/// Resolve an allocator by name.
///
/// `config` is the allocator-specific payload from the backend
/// configuration; the built-in allocators take none, but it must at least
/// be a JSON object or null.
pub fn resolve_allocator(
    name: &str,
    config: &serde_json::Value,
) -> Result<Arc<dyn ChunkAllocator>> {
    if !(config.is_null() || config.is_object()) {
        return Err(StorageError::InvalidConfig(format!(
            "allocator config for {name:?} must be an object"
        )));
    }
    match name {
        "default" => Ok(Arc::new(SystemAllocator)),
        "tracking" => Ok(Arc::new(TrackingAllocator::default())),
        other => Err(StorageError::InvalidConfig(format!(
            "unknown allocator: {other:?}"
        ))),
    }
}

fn default_allocator_name() -> String {
    "default".to_string()
}

/// The `allocators` configuration section of the in-memory backends.
///
/// Every field defaults so an absent section means "system allocator
/// everywhere"; the effective values are echoed back by `config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorsConfig {
    /// Allocator for key bytes.
    #[serde(default = "default_allocator_name")]
    pub key_allocator: String,
    /// Configuration payload for the key allocator.
    #[serde(default)]
    pub key_allocator_config: serde_json::Value,
    /// Allocator for value bytes.
    #[serde(default = "default_allocator_name")]
    pub value_allocator: String,
    /// Configuration payload for the value allocator.
    #[serde(default)]
    pub value_allocator_config: serde_json::Value,
    /// Allocator for map nodes. Resolved and echoed; std collections own
    /// their node allocations, so this cannot rebind them on stable Rust.
    #[serde(default = "default_allocator_name")]
    pub node_allocator: String,
    /// Configuration payload for the node allocator.
    #[serde(default)]
    pub node_allocator_config: serde_json::Value,
}

impl Default for AllocatorsConfig {
    fn default() -> Self {
        Self {
            key_allocator: default_allocator_name(),
            key_allocator_config: serde_json::Value::Null,
            value_allocator: default_allocator_name(),
            value_allocator_config: serde_json::Value::Null,
            node_allocator: default_allocator_name(),
            node_allocator_config: serde_json::Value::Null,
        }
    }
}
