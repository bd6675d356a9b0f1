//! Bounded priority queue of deferred maintenance work: anti-value pruning,
//! deferred joins that a single-shot remove couldn't finish inline, page
//! deallocation, and directory-tree compaction. A single worker thread polls
//! the queue at a configured interval and asks the host to run whatever it
//! pops.
//!
//! The manager holds its host behind a [`std::sync::Weak`] rather than an
//! `Arc`, matching the no-owning-cycles rule: an engine shutting down (or
//! dropped after a crash) must be free to reclaim its memory even with
//! actions still queued, so the queue must never be the reason the engine
//! stays alive.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::types::{PageId, TreeHandle, VolumeId};
use crate::btree::Key;

/// One deferred unit of work. Variants carry just enough addressing
/// information for the host to re-derive and perform the action; the queue
/// itself never touches a page or a tree.
#[derive(Clone, Debug)]
pub enum Action {
    /// Collapse aborted/invisible versions out of the MVV at `key`.
    PruneMvv { volume: VolumeId, tree: TreeHandle, key: Key },
    /// A remove left `left`/`right` joinable but the inline attempt signalled
    /// "rebalance required"; join them when the queue gets to it.
    DeferredJoin { volume: VolumeId, tree: TreeHandle, left: PageId, right: PageId },
    /// Return a page emptied by a join or a tree removal to the garbage chain.
    DeallocatePage { volume: VolumeId, page: PageId },
    /// Reclaim directory-tree entries left behind by a removed tree.
    CompactDirectory { volume: VolumeId },
}

impl Action {
    /// Higher runs first. Deallocation is cheapest and frees space other
    /// actions may need, so it goes first; directory compaction is the
    /// least urgent since a zombie entry is only cosmetic until the next
    /// tree-creation collision.
    fn priority(&self) -> u8 {
        match self {
            Action::DeallocatePage { .. } => 3,
            Action::PruneMvv { .. } => 2,
            Action::DeferredJoin { .. } => 1,
            Action::CompactDirectory { .. } => 0,
        }
    }
}

struct Queued {
    priority: u8,
    seq: u64,
    action: Action,
}

/// Counters surfaced to the stat/dump surface and exercised by the overflow
/// test (`accepted + refused == offered`).
#[derive(Default)]
pub struct CleanupStats {
    pub offered: AtomicU64,
    pub accepted: AtomicU64,
    pub refused: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

/// Implemented by whatever owns the engine's subsystems; the cleanup manager
/// only ever reaches the host through this seam.
pub trait CleanupHost: Send + Sync {
    fn run_cleanup_action(&self, action: &Action) -> Result<()>;
}

struct Inner {
    queue: Vec<Queued>,
    next_seq: u64,
}

/// Owns the deferred-action queue and its worker thread.
pub struct CleanupManager {
    inner: Mutex<Inner>,
    capacity: usize,
    interval: Duration,
    host: Mutex<Weak<dyn CleanupHost>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pub stats: CleanupStats,
}

impl CleanupManager {
    pub fn new(capacity: usize, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner { queue: Vec::new(), next_seq: 0 }),
            capacity,
            interval,
            host: Mutex::new(Weak::<NoHost>::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            stats: CleanupStats::default(),
        })
    }

    /// Binds the (weak) host that actions run against. Must be called once,
    /// after the host itself is wrapped in an `Arc`, before [`Self::start`].
    pub fn bind_host(&self, host: Weak<dyn CleanupHost>) {
        *self.host.lock() = host;
    }

    /// Number of actions currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued action without running it.
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }

    /// Enqueues `action`. Returns `true` if it (or, on overflow, something
    /// lower-priority) was accepted into the queue; `false` if `action`
    /// itself was the one dropped.
    pub fn enqueue(&self, action: Action) -> bool {
        self.stats.offered.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let queued = Queued { priority: action.priority(), seq, action };

        if inner.queue.len() < self.capacity {
            inner.queue.push(queued);
            self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        // Overflow: find the current lowest-priority (oldest among ties)
        // entry and evict it in favor of `queued`, unless `queued` itself is
        // the lowest.
        let min_index = inner
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| (q.priority, q.seq))
            .map(|(i, _)| i);

        match min_index {
            Some(i) if (inner.queue[i].priority, inner.queue[i].seq) < (queued.priority, queued.seq) => {
                inner.queue[i] = queued;
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                debug!("cleanup.queue_overflow_evicted_lower_priority");
                true
            }
            _ => {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
                warn!("cleanup.queue_overflow_refused");
                false
            }
        }
    }

    fn pop_highest(&self) -> Option<Action> {
        let mut inner = self.inner.lock();
        let max_index = inner
            .queue
            .iter()
            .enumerate()
            .max_by_key(|(_, q)| (q.priority, std::cmp::Reverse(q.seq)))
            .map(|(i, _)| i);
        max_index.map(|i| inner.queue.remove(i).action)
    }

    /// Spawns the worker thread. Safe to call once; `self` must already be
    /// wrapped in the `Arc` returned by [`Self::new`].
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("heartwood-cleanup".into())
            .spawn(move || this.run(shutdown))
            .expect("failed to spawn cleanup worker thread");
        *self.worker.lock() = Some(handle);
    }

    fn run(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(self.interval);
            let Some(host) = self.host.lock().upgrade() else {
                trace!("cleanup.host_gone_exiting_worker");
                return;
            };
            while let Some(action) = self.pop_highest() {
                match host.run_cleanup_action(&action) {
                    Ok(()) => {
                        self.stats.executed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %err, "cleanup.action_failed");
                    }
                }
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Only used to give `Weak::<NoHost>::new()` a concrete, uninhabited type to
/// coerce from before a real host is bound.
struct NoHost;
impl CleanupHost for NoHost {
    fn run_cleanup_action(&self, _action: &Action) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHost(AtomicUsize);
    impl CleanupHost for CountingHost {
        fn run_cleanup_action(&self, _action: &Action) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample(v: u64) -> Action {
        Action::DeallocatePage { volume: VolumeId(1), page: PageId(v) }
    }

    #[test]
    fn overflow_accounting_balances() {
        let mgr = CleanupManager::new(4, Duration::from_secs(3600));
        for i in 0..10 {
            mgr.enqueue(sample(i));
        }
        let offered = mgr.stats.offered.load(Ordering::SeqCst);
        let accepted = mgr.stats.accepted.load(Ordering::SeqCst);
        let refused = mgr.stats.refused.load(Ordering::SeqCst);
        assert_eq!(offered, 10);
        assert_eq!(accepted + refused, offered);
        assert!(mgr.len() <= 4);
    }

    #[test]
    fn clear_resets_queue_depth() {
        let mgr = CleanupManager::new(4, Duration::from_secs(3600));
        mgr.enqueue(sample(1));
        mgr.enqueue(sample(2));
        assert_eq!(mgr.len(), 2);
        mgr.clear();
        assert_eq!(mgr.len(), 0);
    }

    #[test]
    fn higher_priority_action_runs_before_lower() {
        let mgr = CleanupManager::new(8, Duration::from_secs(3600));
        mgr.enqueue(Action::CompactDirectory { volume: VolumeId(1) });
        mgr.enqueue(Action::DeallocatePage { volume: VolumeId(1), page: PageId(1) });
        let first = mgr.pop_highest().unwrap();
        assert!(matches!(first, Action::DeallocatePage { .. }));
    }

    #[test]
    fn worker_exits_quietly_once_host_is_dropped() {
        let mgr = CleanupManager::new(8, Duration::from_millis(5));
        {
            let host: Arc<dyn CleanupHost> = Arc::new(CountingHost(AtomicUsize::new(0)));
            mgr.bind_host(Arc::downgrade(&host));
            mgr.enqueue(sample(1));
            mgr.start();
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(mgr.len(), 0);
        }
        // host dropped; worker should notice on its next wake and return
        // without holding the manager open.
        std::thread::sleep(Duration::from_millis(30));
        mgr.shutdown();
    }
}
