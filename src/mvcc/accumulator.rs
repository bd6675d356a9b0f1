//! Per-tree aggregate accumulators (SUM, MIN, MAX, SEQ) reconciled through MVCC.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::Timestamp;

/// The four accumulator flavors a tree may register, each with its own
/// reconciliation rule for combining a transaction's delta into the base.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AccumulatorKind {
    Sum,
    Min,
    Max,
    /// Allocates strictly increasing values; deltas are always additive and
    /// never rolled back even on abort, since handed-out sequence numbers
    /// must not be reused.
    Seq,
}

impl AccumulatorKind {
    fn combine(self, base: i64, delta: i64) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => base + delta,
            AccumulatorKind::Min => base.min(delta),
            AccumulatorKind::Max => base.max(delta),
        }
    }

    fn identity(self) -> i64 {
        match self {
            AccumulatorKind::Sum | AccumulatorKind::Seq => 0,
            AccumulatorKind::Min => i64::MAX,
            AccumulatorKind::Max => i64::MIN,
        }
    }
}

struct PendingDelta {
    value: i64,
    /// Commit timestamp once known; `None` while the owning transaction is active.
    tc: Option<Timestamp>,
}

struct AccumulatorState {
    kind: AccumulatorKind,
    /// Value as of the last checkpoint (or creation).
    base_value: i64,
    base_as_of: Timestamp,
    /// Deltas from transactions not yet reconciled into `base_value`.
    pending: HashMap<Timestamp, PendingDelta>,
}

impl AccumulatorState {
    fn live_value(&self) -> i64 {
        let mut value = self.base_value;
        for delta in self.pending.values() {
            value = self.kind.combine(value, delta.value);
        }
        value
    }

    fn snapshot_value(&self, at: Timestamp) -> i64 {
        let mut value = self.base_value;
        for delta in self.pending.values() {
            if delta.tc.is_some_and(|tc| tc <= at) {
                value = self.kind.combine(value, delta.value);
            }
        }
        value
    }
}

/// One (type, index) aggregate slot on a tree. Up to 64 may be registered per
/// tree; this type models a single slot's lifecycle.
pub struct Accumulator {
    state: Mutex<AccumulatorState>,
}

impl Accumulator {
    /// Creates a fresh accumulator of `kind`, seeded to its identity value.
    pub fn new(kind: AccumulatorKind) -> Self {
        Self {
            state: Mutex::new(AccumulatorState {
                kind,
                base_value: kind.identity(),
                base_as_of: 0,
                pending: HashMap::new(),
            }),
        }
    }

    /// Records a transactional update from `ts`, replacing any earlier delta
    /// from the same transaction (repeated updates within a transaction
    /// coalesce rather than stack).
    pub fn update(&self, ts: Timestamp, delta: i64) {
        let mut state = self.state.lock();
        let combined = match state.kind {
            AccumulatorKind::Sum | AccumulatorKind::Seq => {
                state.pending.get(&ts).map(|p| p.value).unwrap_or(0) + delta
            }
            AccumulatorKind::Min | AccumulatorKind::Max => delta,
        };
        state.pending.insert(ts, PendingDelta { value: combined, tc: None });
    }

    /// The current live value, combining the base with every pending delta
    /// regardless of whether its transaction has committed yet.
    pub fn live_value(&self) -> i64 {
        self.state.lock().live_value()
    }

    /// The value visible to a reader at snapshot `at`: base plus every
    /// committed delta with `tc <= at`.
    pub fn snapshot_value(&self, at: Timestamp) -> i64 {
        self.state.lock().snapshot_value(at)
    }

    /// Stamps a pending delta with its transaction's commit timestamp,
    /// making it visible to future snapshot reads at or after `tc`.
    pub fn commit(&self, ts: Timestamp, tc: Timestamp) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.get_mut(&ts) {
            pending.tc = Some(tc);
        }
    }

    /// Discards a transaction's delta entirely.
    pub fn abort(&self, ts: Timestamp) {
        self.state.lock().pending.remove(&ts);
    }

    /// Folds every delta committed at or before `checkpoint_ts` into the base
    /// value and drops them from `pending`, bounding its growth over time.
    pub fn reconcile(&self, checkpoint_ts: Timestamp) {
        let mut state = self.state.lock();
        let kind = state.kind;
        let to_fold: Vec<Timestamp> = state
            .pending
            .iter()
            .filter(|(_, d)| d.tc.is_some_and(|tc| tc <= checkpoint_ts))
            .map(|(ts, _)| *ts)
            .collect();
        for ts in to_fold {
            if let Some(delta) = state.pending.remove(&ts) {
                state.base_value = kind.combine(state.base_value, delta.value);
            }
        }
        state.base_as_of = checkpoint_ts;
    }

    /// Timestamp through which `base_value` already accounts for every delta.
    pub fn base_as_of(&self) -> Timestamp {
        self.state.lock().base_as_of
    }

    /// The reconciled base value, with no pending deltas applied. Used when
    /// persisting a slot's durable state (the pending map itself is rebuilt
    /// from in-flight transactions on recovery, not stored).
    pub fn base_value(&self) -> i64 {
        self.state.lock().base_value
    }

    /// Reconstructs a slot directly at a known base, skipping the identity
    /// seed. Used when reinstalling a tree's accumulators after reopening a
    /// volume, from values persisted at the last checkpoint.
    pub fn from_base(kind: AccumulatorKind, base_value: i64, base_as_of: Timestamp) -> Self {
        Self {
            state: Mutex::new(AccumulatorState {
                kind,
                base_value,
                base_as_of,
                pending: HashMap::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_accumulator_basic_lifecycle() {
        let acc = Accumulator::new(AccumulatorKind::Sum);
        acc.update(10, 1);
        assert_eq!(acc.live_value(), 1);
        assert_eq!(acc.snapshot_value(10), 0);
        acc.commit(10, 20);
        assert_eq!(acc.snapshot_value(21), 1);
        assert_eq!(acc.snapshot_value(19), 0);
    }

    #[test]
    fn abort_discards_the_delta() {
        let acc = Accumulator::new(AccumulatorKind::Sum);
        acc.update(5, 100);
        acc.abort(5);
        assert_eq!(acc.live_value(), 0);
    }

    #[test]
    fn repeated_updates_within_one_transaction_coalesce() {
        let acc = Accumulator::new(AccumulatorKind::Sum);
        acc.update(1, 5);
        acc.update(1, 3);
        assert_eq!(acc.live_value(), 8);
    }

    #[test]
    fn min_accumulator_tracks_smallest_committed_value() {
        let acc = Accumulator::new(AccumulatorKind::Min);
        acc.update(1, 10);
        acc.commit(1, 2);
        acc.update(2, 4);
        acc.commit(2, 3);
        assert_eq!(acc.snapshot_value(5), 4);
    }

    #[test]
    fn reconcile_folds_committed_deltas_into_base() {
        let acc = Accumulator::new(AccumulatorKind::Sum);
        acc.update(1, 7);
        acc.commit(1, 2);
        acc.reconcile(10);
        assert_eq!(acc.base_as_of(), 10);
        assert_eq!(acc.live_value(), 7);
        acc.update(20, 1);
        assert_eq!(acc.live_value(), 8);
    }
}
