// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Key-presence wait primitive.
//
// A task expecting a key to appear registers interest with
// `KeyWatcher::add_key` *while still holding the database lock*, then
// releases the lock and awaits the returned `KeyWaiter`. A writer that
// inserts the key calls `notify_key`, which wakes every task waiting for a
// byte-equal key. Wake-ups are edge-triggered and may be spurious: a woken
// task must re-acquire the database lock, re-check for the key, and either
// proceed or register again.
//
// The register-then-unlock ordering is what makes the primitive lossless:
// a notification that happens after `add_key` is buffered by the waiter's
// channel even if the task has not started awaiting yet.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

/// Result of waiting for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A writer announced the key. The caller must still re-check under
    /// the database lock.
    KeyPresent,
    /// The wait elapsed (or the watcher was torn down) before any writer
    /// announced the key.
    TimedOut,
}

#[derive(Default)]
#[derive(Debug)]
struct WatcherInner {
    /// Monotonic ticket ids, used to deregister individual waiters.
    next_id: u64,
    /// Registered waiters, per exact key bytes.
    waiters: HashMap<Vec<u8>, Vec<(u64, oneshot::Sender<()>)>>,
}

/// A shared map from key bytes to the tasks waiting for them.
///
/// One watcher instance serves a whole backend; waking is O(waiters for
/// that key).
#[derive(Debug, Default)]
pub struct KeyWatcher {
    inner: Mutex<WatcherInner>,
}

impl KeyWatcher {
    /// Create an empty watcher.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatcherInner> {
        // A poisoned watcher mutex only means a panic elsewhere; the map
        // itself is still structurally sound.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register interest in `key`. Must be called before the caller drops
    /// the database lock, so that no insertion can slip between the check
    /// and the registration.
    pub fn add_key(&self, key: &[u8]) -> KeyWaiter<'_> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiters.entry(key.to_vec()).or_default().push((id, tx));
        trace!(key = ?key, id, "registered key waiter");
        KeyWaiter {
            watcher: self,
            key: key.to_vec(),
            id,
            rx: Some(rx),
        }
    }

    /// Wake every task currently registered for a key byte-equal to `key`.
    pub fn notify_key(&self, key: &[u8]) {
        let mut inner = self.lock();
        if let Some(entries) = inner.waiters.remove(key) {
            trace!(key = ?key, woken = entries.len(), "notifying key waiters");
            for (_, tx) in entries {
                // A waiter that already timed out has dropped its receiver;
                // the failed send is harmless.
                let _ = tx.send(());
            }
        }
    }

    /// Number of registered waiters, across all keys.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.values().map(Vec::len).sum()
    }
}

/// A registration ticket returned by [`KeyWatcher::add_key`].
///
/// Await it with [`KeyWaiter::wait`]; dropping the ticket (after a wait or
/// without one) deregisters it.
pub struct KeyWaiter<'w> {
    watcher: &'w KeyWatcher,
    key: Vec<u8>,
    id: u64,
    rx: Option<oneshot::Receiver<()>>,
}

impl KeyWaiter<'_> {
    /// Suspend the current task until the key is announced or `timeout`
    /// elapses.
    pub async fn wait(mut self, timeout: Duration) -> WaitOutcome {
        let Some(rx) = self.rx.take() else {
            return WaitOutcome::TimedOut;
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => WaitOutcome::KeyPresent,
            // Sender dropped without notifying: the watcher went away.
            Ok(Err(_)) => WaitOutcome::TimedOut,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

impl Drop for KeyWaiter<'_> {
    fn drop(&mut self) {
        let mut inner = self.watcher.lock();
        if let Some(entries) = inner.waiters.get_mut(&self.key) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                inner.waiters.remove(&self.key);
            }
        }
    }
}
