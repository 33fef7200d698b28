//! Correlation table: in-flight request id → waiting caller.
//!
//! Each registered id owns a `oneshot` slot that the response router fills
//! exactly once. The table is the only mutable state shared between the
//! router and caller tasks; every operation holds the lock for a single map
//! operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::{error_codes, CorrelationId, Outcome, RpcError};

// ─── Pending Entry ───────────────────────────────────────────────────────────

struct PendingEntry {
    /// Registration sequence; distinguishes reuses of the same id.
    seq: u64,
    method: String,
    registered_at: Instant,
    slot: oneshot::Sender<Outcome>,
}

// ─── PendingTable ────────────────────────────────────────────────────────────

/// Concurrency-safe map from correlation id to pending entry.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
    next_seq: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` and return the handle the caller waits on.
    ///
    /// Fails with [`McpError::DuplicateId`] if `id` is already in flight.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        method: &str,
    ) -> Result<PendingCall, McpError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.lock();
            if entries.contains_key(&id) {
                return Err(McpError::DuplicateId { id });
            }
            entries.insert(
                id.clone(),
                PendingEntry {
                    seq,
                    method: method.to_string(),
                    registered_at: Instant::now(),
                    slot: tx,
                },
            );
        }

        Ok(PendingCall {
            id,
            seq,
            rx,
            table: Arc::clone(self),
            armed: true,
        })
    }

    /// Deliver `outcome` to the caller waiting on `id` and remove the entry.
    ///
    /// Returns `false` (and logs) when no such entry exists.
    pub fn resolve(&self, id: &CorrelationId, outcome: Outcome) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                tracing::trace!(
                    id = %id,
                    method = %entry.method,
                    elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "resolving pending request"
                );
                if entry.slot.send(outcome).is_err() {
                    tracing::debug!(id = %id, "caller stopped waiting before resolution");
                }
                true
            }
            None => {
                tracing::warn!(id = %id, "no pending request for response id, discarding");
                false
            }
        }
    }

    /// Remove the registration behind `call` without resolving it, so a late
    /// response becomes stale. A newer registration that reuses the same id
    /// is left alone.
    pub fn cancel(&self, call: &PendingCall) -> bool {
        let mut entries = self.lock();
        match entries.get(&call.id) {
            Some(entry) if entry.seq == call.seq => {
                entries.remove(&call.id);
                true
            }
            _ => false,
        }
    }

    /// Resolve every pending entry with an internal-error failure.
    ///
    /// Returns how many callers were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(CorrelationId, PendingEntry)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(id = %id, method = %entry.method, reason, "failing pending request");
            let _ = entry.slot.send(Outcome::Failure(RpcError::new(
                error_codes::INTERNAL_ERROR,
                reason,
            )));
        }
        count
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Age of the longest-waiting entry, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lock()
            .values()
            .map(|entry| entry.registered_at.elapsed())
            .max()
    }
}

// ─── PendingCall ─────────────────────────────────────────────────────────────

/// Caller-side handle for one registered request.
///
/// Dropping the handle before it resolves cancels the registration, so a
/// caller that gives up (timeout, dropped future) never leaves a stale entry.
pub struct PendingCall {
    id: CorrelationId,
    seq: u64,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<PendingTable>,
    armed: bool,
}

impl PendingCall {
    /// Wait for the outcome, bounded by `timeout`.
    ///
    /// `Ok(None)` means the slot was dropped without an outcome (the table
    /// was torn down). On timeout the entry is cancelled before returning.
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<Outcome>, tokio::time::error::Elapsed> {
        let result = tokio::time::timeout(timeout, &mut self.rx).await;
        match result {
            Ok(Ok(outcome)) => {
                self.armed = false;
                Ok(Some(outcome))
            }
            Ok(Err(_)) => {
                self.armed = false;
                Ok(None)
            }
            Err(elapsed) => {
                self.armed = false;
                if self.table.cancel(&self) {
                    tracing::debug!(id = %self.id, "pending request cancelled after timeout");
                }
                Err(elapsed)
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.armed && self.table.cancel(self) {
            tracing::debug!(id = %self.id, "pending request dropped by caller");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
