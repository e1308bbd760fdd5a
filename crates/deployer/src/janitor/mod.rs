//! Janitor — expiry monitoring and periodic reclamation.
//!
//! Two cooperating workers share this module:
//! - the expiry dispatcher ([`monitor`]): a min-heap of deadlines drained
//!   by a single task, with reclamations bounded by a semaphore;
//! - the sweeper ([`sweeper`]): a periodic batch pass that catches
//!   anything the dispatcher missed and cleans auxiliary state.
//!
//! Both paths funnel into [`reclaim`]; Stop and Release are idempotent, so
//! double-reclamation is harmless.

pub mod monitor;
pub mod sweeper;

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::state::SharedState;
use crate::store::containers::{ContainerRow, ContainerStatus};

/// Cancellation handles for active per-container monitors.
#[derive(Default)]
pub struct Monitors {
    tokens: DashMap<String, CancellationToken>,
}

impl Monitors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a monitor for a container, replacing any previous handle.
    pub fn register(&self, container_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .tokens
            .insert(container_id.to_string(), token.clone())
        {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget a container's monitor. No-op when absent.
    pub fn cancel(&self, container_id: &str) {
        if let Some((_, token)) = self.tokens.remove(container_id) {
            token.cancel();
        }
    }

    pub fn is_cancelled(&self, container_id: &str) -> bool {
        self.tokens
            .get(container_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Min-heap of `(expiration_time, container_id)` deadlines.
///
/// Entries are cheap value snapshots; the authoritative expiration lives
/// in the store and is re-read when an entry fires, so stale entries after
/// an Extend or Stop are harmless.
#[derive(Default)]
pub struct ExpiryQueue {
    heap: Mutex<BinaryHeap<Reverse<(i64, String)>>>,
    notify: Notify,
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a deadline and wake the dispatcher.
    pub fn schedule(&self, at: i64, container_id: &str) {
        self.heap
            .lock()
            .push(Reverse((at, container_id.to_string())));
        self.notify.notify_one();
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<(i64, String)> {
        self.heap.lock().peek().map(|Reverse((at, id))| (*at, id.clone()))
    }

    /// Pop the earliest entry if its deadline has passed.
    pub fn pop_due(&self, now: i64) -> Option<(i64, String)> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(Reverse((at, _))) if *at <= now => {
                heap.pop().map(|Reverse((at, id))| (at, id))
            }
            _ => None,
        }
    }

    /// Wait until the dispatcher is poked (schedule/extend/cancel).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

/// Reclamation phases, for structured failure logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimPhase {
    Remove,
    Mark,
    Release,
}

impl ReclaimPhase {
    fn as_str(&self) -> &'static str {
        match self {
            ReclaimPhase::Remove => "remove",
            ReclaimPhase::Mark => "mark",
            ReclaimPhase::Release => "release",
        }
    }
}

/// Reclaim one expired container: force-remove the engine container
/// (NotFound is success), mark the row removed, release its port.
///
/// Idempotent; both the dispatcher and the sweeper may call this for the
/// same container.
pub async fn reclaim(state: &SharedState, row: &ContainerRow) -> Result<(), ReclaimPhase> {
    let fail = |phase: ReclaimPhase, error: String| {
        tracing::error!(
            container_id = %row.id,
            phase = phase.as_str(),
            error = %error,
            "Reclamation step failed"
        );
        state
            .metrics
            .errors_total
            .with_label_values(&[match phase {
                ReclaimPhase::Remove => "reclaim_remove",
                ReclaimPhase::Mark => "reclaim_mark",
                ReclaimPhase::Release => "reclaim_release",
            }])
            .inc();
        phase
    };

    match state.docker.remove_container(&row.id, true).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            tracing::debug!(container_id = %row.id, "Container already gone");
        }
        Err(e) => return Err(fail(ReclaimPhase::Remove, e.to_string())),
    }

    match state
        .store
        .set_container_status(&row.id, ContainerStatus::Removed)
        .await
    {
        Ok(changed) => {
            if changed {
                let lifetime = (chrono::Utc::now().timestamp() - row.start_time).max(0);
                state.metrics.container_lifetime.observe(lifetime as f64);
            }
        }
        Err(e) => return Err(fail(ReclaimPhase::Mark, e.to_string())),
    }

    if let Err(e) = state.ports.release(row.port as u16).await {
        return Err(fail(ReclaimPhase::Release, e.to_string()));
    }

    state.monitors.cancel(&row.id);
    tracing::info!(
        container_id = %row.id,
        port = row.port,
        "Reclaimed expired container"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_orders_by_deadline() {
        let queue = ExpiryQueue::new();
        queue.schedule(300, "c");
        queue.schedule(100, "a");
        queue.schedule(200, "b");

        assert_eq!(queue.next_deadline(), Some((100, "a".to_string())));
        assert_eq!(queue.pop_due(150), Some((100, "a".to_string())));
        assert_eq!(queue.next_deadline(), Some((200, "b".to_string())));
    }

    #[test]
    fn test_pop_due_respects_future_deadlines() {
        let queue = ExpiryQueue::new();
        queue.schedule(500, "future");
        assert_eq!(queue.pop_due(499), None);
        assert_eq!(queue.pop_due(500), Some((500, "future".to_string())));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_entries_both_pop() {
        // Extend pushes a second entry for the same container; the
        // dispatcher re-reads the row, so both firing is fine.
        let queue = ExpiryQueue::new();
        queue.schedule(100, "x");
        queue.schedule(200, "x");
        assert_eq!(queue.pop_due(250), Some((100, "x".to_string())));
        assert_eq!(queue.pop_due(250), Some((200, "x".to_string())));
    }

    #[test]
    fn test_monitors_register_and_cancel() {
        let monitors = Monitors::new();
        let token = monitors.register("c1");
        assert!(!token.is_cancelled());
        assert_eq!(monitors.len(), 1);

        monitors.cancel("c1");
        assert!(token.is_cancelled());
        assert!(monitors.is_empty());
    }

    #[test]
    fn test_monitors_reregister_cancels_previous() {
        let monitors = Monitors::new();
        let first = monitors.register("c1");
        let second = monitors.register("c1");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(monitors.len(), 1);
    }

    #[test]
    fn test_unknown_monitor_counts_as_cancelled() {
        let monitors = Monitors::new();
        assert!(monitors.is_cancelled("ghost"));
    }
}
