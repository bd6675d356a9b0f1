//! Multi-version concurrency control: timestamps, the transaction index,
//! multi-version values, and per-tree accumulators.

pub mod accumulator;
pub mod mvv;
pub mod timestamp;
pub mod txn_index;

pub use accumulator::{Accumulator, AccumulatorKind};
pub use mvv::{MvvEntry, VersionHandle, VisibilityOracle};
pub use timestamp::TimestampAllocator;
pub use txn_index::{TransactionIndex, TxnState};
