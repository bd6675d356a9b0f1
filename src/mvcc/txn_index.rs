//! Transaction index: per-`ts` status tracking, commit/abort bookkeeping,
//! write-write conflict locks, and the bucketed floor used to bound pruning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::mvcc::mvv::VisibilityOracle;
use crate::types::Timestamp;

/// Lifecycle state of one transaction's status record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
    /// Committed or aborted and every interested reader has already observed it.
    Notified,
}

struct TxnStatus {
    ts: Timestamp,
    tc: Timestamp,
    state: TxnState,
    /// Versions still carrying this `ts` somewhere in an MVV; the status is
    /// only recyclable once this reaches zero and `tc` is below the floor.
    mvv_refs: u64,
    wwlock: Arc<(Mutex<bool>, Condvar)>,
}

impl TxnStatus {
    fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            tc: crate::types::TIMESTAMP_MAX,
            state: TxnState::Active,
            mvv_refs: 0,
            wwlock: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }
}

struct Bucket {
    statuses: HashMap<Timestamp, TxnStatus>,
    /// Cached lower bound on `ts` values that could still matter to a reader,
    /// refreshed by `refresh_active_cache` rather than recomputed per read.
    cached_floor: Timestamp,
}

impl Bucket {
    fn new() -> Self {
        Self {
            statuses: HashMap::new(),
            cached_floor: 0,
        }
    }
}

/// Bucketed registry of every in-flight or recently-finished transaction.
pub struct TransactionIndex {
    buckets: Vec<Mutex<Bucket>>,
    bucket_count: u64,
    ww_timeout: Duration,
}

impl TransactionIndex {
    /// Builds an index with `bucket_count` buckets, each transaction hashed
    /// into bucket `ts mod bucket_count`.
    pub fn new(bucket_count: u32, ww_timeout: Duration) -> Self {
        let bucket_count = bucket_count.max(1) as u64;
        let buckets = (0..bucket_count).map(|_| Mutex::new(Bucket::new())).collect();
        Self {
            buckets,
            bucket_count,
            ww_timeout,
        }
    }

    fn bucket_for(&self, ts: Timestamp) -> &Mutex<Bucket> {
        &self.buckets[(ts % self.bucket_count) as usize]
    }

    /// Registers a newly begun transaction.
    pub fn begin(&self, ts: Timestamp) {
        let mut bucket = self.bucket_for(ts).lock();
        bucket.statuses.insert(ts, TxnStatus::new(ts));
    }

    /// Marks `ts` committed at `tc`. Idempotent: committing an already
    /// committed transaction at the same `tc` is a no-op.
    pub fn commit(&self, ts: Timestamp, tc: Timestamp) -> Result<()> {
        let mut bucket = self.bucket_for(ts).lock();
        let status = bucket
            .statuses
            .get_mut(&ts)
            .ok_or(Error::CorruptJournal(format!("commit of unknown ts {ts}")))?;
        match status.state {
            TxnState::Active => {
                status.tc = tc;
                status.state = TxnState::Committed;
            }
            TxnState::Committed if status.tc == tc => {}
            TxnState::Committed => {
                return Err(Error::CorruptJournal(format!(
                    "duplicate commit of ts {ts} with differing tc"
                )))
            }
            TxnState::Aborted | TxnState::Notified => {
                return Err(Error::Fatal(format!("commit of already-finalized ts {ts}")))
            }
        }
        self.wake_wwlock(status);
        Ok(())
    }

    /// Marks `ts` aborted.
    pub fn abort(&self, ts: Timestamp) -> Result<()> {
        let mut bucket = self.bucket_for(ts).lock();
        let status = bucket
            .statuses
            .get_mut(&ts)
            .ok_or(Error::CorruptJournal(format!("abort of unknown ts {ts}")))?;
        if status.state == TxnState::Committed {
            return Err(Error::Fatal(format!("abort of already-committed ts {ts}")));
        }
        status.state = TxnState::Aborted;
        self.wake_wwlock(status);
        Ok(())
    }

    fn wake_wwlock(&self, status: &TxnStatus) {
        let (lock, cvar) = &*status.wwlock;
        *lock.lock() = true;
        cvar.notify_all();
    }

    /// Blocks the caller until `ts` finishes (commits or aborts) or the
    /// configured write-write timeout elapses.
    pub fn wait_for_resolution(&self, ts: Timestamp) -> Result<()> {
        let wwlock = {
            let bucket = self.bucket_for(ts).lock();
            match bucket.statuses.get(&ts) {
                Some(status) if status.state == TxnState::Active => status.wwlock.clone(),
                _ => return Ok(()),
            }
        };
        let (lock, cvar) = &*wwlock;
        let mut resolved = lock.lock();
        let deadline = Instant::now() + self.ww_timeout;
        while !*resolved {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout("write-write lock"));
            }
            let result = cvar.wait_for(&mut resolved, remaining);
            if result.timed_out() && !*resolved {
                return Err(Error::Timeout("write-write lock"));
            }
        }
        Ok(())
    }

    /// Increments the MVV reference count for `ts` (a new version carrying it
    /// was just written).
    pub fn add_mvv_ref(&self, ts: Timestamp) {
        let mut bucket = self.bucket_for(ts).lock();
        if let Some(status) = bucket.statuses.get_mut(&ts) {
            status.mvv_refs += 1;
        }
    }

    /// Decrements the MVV reference count for `ts` (pruning removed a version).
    pub fn release_mvv_ref(&self, ts: Timestamp) {
        let mut bucket = self.bucket_for(ts).lock();
        if let Some(status) = bucket.statuses.get_mut(&ts) {
            status.mvv_refs = status.mvv_refs.saturating_sub(1);
        }
    }

    /// Recomputes a bucket's cached floor: the smallest `ts` of any status
    /// still active, or `tc` of the oldest unreclaimed finished status.
    pub fn refresh_active_cache(&self, bucket_index: usize) {
        let mut bucket = self.buckets[bucket_index].lock();
        let floor = bucket
            .statuses
            .values()
            .map(|s| if s.state == TxnState::Active { s.ts } else { s.tc })
            .min()
            .unwrap_or(Timestamp::MAX);
        bucket.cached_floor = floor;
        trace!(bucket_index, floor, "refreshed transaction index floor");
    }

    /// The cached floor across every bucket: the lowest timestamp still
    /// potentially visible to an active reader.
    pub fn global_floor(&self) -> Timestamp {
        self.buckets
            .iter()
            .map(|b| b.lock().cached_floor)
            .min()
            .unwrap_or(0)
    }

    /// Number of configured buckets (for iterating `refresh_active_cache`).
    pub fn bucket_count(&self) -> usize {
        self.bucket_count as usize
    }

    /// Removes statuses below the floor with zero remaining MVV references.
    pub fn reap(&self, bucket_index: usize) -> usize {
        let mut bucket = self.buckets[bucket_index].lock();
        let floor = bucket.cached_floor;
        let before = bucket.statuses.len();
        bucket.statuses.retain(|_, status| {
            let finished = matches!(status.state, TxnState::Committed | TxnState::Aborted | TxnState::Notified);
            !(finished && status.mvv_refs == 0 && status.tc < floor)
        });
        let reaped = before - bucket.statuses.len();
        if reaped > 0 {
            trace!(bucket_index, reaped, "reclaimed transaction statuses");
        }
        reaped
    }

    /// Current state of a transaction, if its status record still exists.
    pub fn state(&self, ts: Timestamp) -> Option<TxnState> {
        self.bucket_for(ts).lock().statuses.get(&ts).map(|s| s.state)
    }
}

impl VisibilityOracle for TransactionIndex {
    fn commit_timestamp(&self, ts: Timestamp) -> Option<Timestamp> {
        let bucket = self.bucket_for(ts).lock();
        match bucket.statuses.get(&ts) {
            Some(status) if status.state == TxnState::Committed || status.state == TxnState::Notified => {
                Some(status.tc)
            }
            _ => None,
        }
    }
}

/// Logs and swallows a reap-overflow-style condition; used by the cleanup
/// manager's periodic pass rather than by the index itself.
pub fn warn_if_stalled(bucket_index: usize, age: Duration, threshold: Duration) {
    if age > threshold {
        warn!(bucket_index, ?age, "transaction index bucket floor has not advanced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_idempotent_for_matching_tc() {
        let index = TransactionIndex::new(4, Duration::from_millis(50));
        index.begin(10);
        index.commit(10, 20).unwrap();
        index.commit(10, 20).unwrap();
        assert_eq!(index.commit_timestamp(10), Some(20));
    }

    #[test]
    fn commit_with_different_tc_is_rejected() {
        let index = TransactionIndex::new(4, Duration::from_millis(50));
        index.begin(10);
        index.commit(10, 20).unwrap();
        assert!(index.commit(10, 21).is_err());
    }

    #[test]
    fn abort_then_commit_fails() {
        let index = TransactionIndex::new(4, Duration::from_millis(50));
        index.begin(5);
        index.abort(5).unwrap();
        assert!(index.commit(5, 6).is_err());
    }

    #[test]
    fn floor_tracks_oldest_active_transaction() {
        let index = TransactionIndex::new(1, Duration::from_millis(50));
        index.begin(5);
        index.begin(9);
        index.refresh_active_cache(0);
        assert_eq!(index.global_floor(), 5);
        index.abort(5).unwrap();
        index.refresh_active_cache(0);
        assert!(index.global_floor() <= 9);
    }

    #[test]
    fn wait_for_resolution_times_out_on_stuck_writer() {
        let index = TransactionIndex::new(2, Duration::from_millis(20));
        index.begin(1);
        let err = index.wait_for_resolution(1).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn reap_removes_finished_statuses_below_floor() {
        let index = TransactionIndex::new(1, Duration::from_millis(50));
        index.begin(1);
        index.commit(1, 2).unwrap();
        index.begin(100);
        index.refresh_active_cache(0);
        let reaped = index.reap(0);
        assert_eq!(reaped, 1);
        assert_eq!(index.state(1), None);
    }
}
