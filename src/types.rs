//! Identifiers shared across every subsystem.

use std::fmt;

/// Address of a page within a single volume file (`page_no * page_size` is its
/// byte offset). Page 0 is the volume head page; page 1 is the primordial
/// garbage-chain page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a volume uniquely for the lifetime of the engine.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VolumeId(pub u64);

/// Volume-local handle for a tree, assigned the first time the tree is
/// journaled (not stable across volumes).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TreeHandle(pub u32);

/// Monotone 64-bit timestamp: both a transaction start/commit stamp and a
/// page modification stamp share this space.
pub type Timestamp = u64;

/// Sentinel meaning "visible forever" / "never committed yet".
pub const TIMESTAMP_MAX: Timestamp = u64::MAX;

/// Byte offset of a record within the journal's logical address space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct JournalAddress(pub u64);

impl fmt::Display for JournalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
