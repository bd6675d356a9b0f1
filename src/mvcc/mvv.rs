//! Multi-version value encoding: the in-place format stored inside a B+-tree
//! value slot, plus the visibility rule used to resolve a snapshot read.

use crate::error::{Error, Result};
use crate::types::Timestamp;

/// Packs a transaction's start timestamp with a per-transaction step counter
/// so that two writes by the same transaction at the same `ts` still sort
/// distinctly within one MVV. Steps occupy the low byte; `ts` the rest.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VersionHandle(u64);

impl VersionHandle {
    /// Builds a handle from a transaction's start timestamp and step.
    pub fn new(ts: Timestamp, step: u8) -> Self {
        Self((ts << 8) | step as u64)
    }

    /// The writing transaction's start timestamp.
    pub fn ts(self) -> Timestamp {
        self.0 >> 8
    }

    /// The step within that transaction.
    pub fn step(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

/// Sentinel length marking a version as a deletion rather than a stored value.
const ANTI_VALUE_LEN: u32 = u32::MAX;

/// One version inside an MVV: `value == None` is the anti-value (a deletion).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct MvvEntry {
    pub handle: VersionHandle,
    pub value: Option<Vec<u8>>,
}

impl MvvEntry {
    pub fn stored(handle: VersionHandle, value: Vec<u8>) -> Self {
        Self {
            handle,
            value: Some(value),
        }
    }

    pub fn anti(handle: VersionHandle) -> Self {
        Self {
            handle,
            value: None,
        }
    }

    pub fn is_anti(&self) -> bool {
        self.value.is_none()
    }
}

/// Encodes a sequence of versions, oldest first, into the MVV wire format: a
/// one-byte count header followed by `(handle, length, bytes)` per version.
/// A single ordinary (non-versioned) value is encoded as a one-entry MVV so
/// callers never need a separate "plain value" code path.
pub fn encode(entries: &[MvvEntry]) -> Result<Vec<u8>> {
    if entries.len() > u8::MAX as usize {
        return Err(Error::InvalidKey("too many MVV versions for one page value"));
    }
    let mut out = Vec::with_capacity(1 + entries.len() * 12);
    out.push(entries.len() as u8);
    for entry in entries {
        out.extend_from_slice(&entry.handle.to_be_bytes());
        match &entry.value {
            Some(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            None => out.extend_from_slice(&ANTI_VALUE_LEN.to_be_bytes()),
        }
    }
    Ok(out)
}

/// Decodes an MVV buffer back into its versions, oldest first.
pub fn decode(buf: &[u8]) -> Result<Vec<MvvEntry>> {
    if buf.is_empty() {
        return Err(Error::CorruptVolume("MVV buffer missing header byte".into()));
    }
    let count = buf[0] as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 1usize;
    for _ in 0..count {
        if buf.len() < pos + 12 {
            return Err(Error::CorruptVolume("MVV entry truncated".into()));
        }
        let handle = VersionHandle::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let len = u32::from_be_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        if len == ANTI_VALUE_LEN {
            entries.push(MvvEntry::anti(handle));
            continue;
        }
        let len = len as usize;
        if buf.len() < pos + len {
            return Err(Error::CorruptVolume("MVV value truncated".into()));
        }
        entries.push(MvvEntry::stored(handle, buf[pos..pos + len].to_vec()));
        pos += len;
    }
    Ok(entries)
}

/// Tells the MVV resolver whether a given start timestamp's transaction has
/// committed (and at what commit timestamp), aborted, or is still active.
/// The transaction index is the only implementor; this trait exists so mvv.rs
/// has no dependency on its concrete bucket structure.
pub trait VisibilityOracle {
    /// Returns the commit timestamp for `ts` if that transaction has
    /// committed, `None` if it aborted or is still active.
    fn commit_timestamp(&self, ts: Timestamp) -> Option<Timestamp>;
}

/// Selects the version of `entries` visible to a reader at `snapshot` whose
/// own transaction started at `reader_ts`, scanning newest-to-oldest per the
/// visibility rule: same transaction, or committed with `tc <= snapshot`.
/// Returns `None` when no visible version exists or the visible version is
/// the anti-value (both read as "key absent").
pub fn resolve_visible<'a>(
    entries: &'a [MvvEntry],
    snapshot: Timestamp,
    reader_ts: Timestamp,
    oracle: &dyn VisibilityOracle,
) -> Option<&'a [u8]> {
    for entry in entries.iter().rev() {
        let visible = entry.handle.ts() == reader_ts
            || oracle
                .commit_timestamp(entry.handle.ts())
                .is_some_and(|tc| tc <= snapshot);
        if visible {
            return entry.value.as_deref();
        }
    }
    None
}

/// Drops versions that can never again be visible: every aborted version, and
/// every committed version older than `floor` except the newest visible one
/// for this key (so a reader pinned below the floor still sees a value).
/// Must preserve the relative order of surviving versions.
pub fn prune(entries: Vec<MvvEntry>, floor: Timestamp, oracle: &dyn VisibilityOracle) -> Vec<MvvEntry> {
    let mut kept: Vec<MvvEntry> = Vec::with_capacity(entries.len());
    let mut newest_below_floor_kept = false;
    for entry in entries.into_iter().rev() {
        let tc = match oracle.commit_timestamp(entry.handle.ts()) {
            Some(tc) => tc,
            None => continue, // aborted or unknown: drop.
        };
        if tc > floor {
            kept.push(entry);
        } else if !newest_below_floor_kept {
            kept.push(entry);
            newest_below_floor_kept = true;
        }
    }
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeOracle(HashMap<Timestamp, Timestamp>);

    impl VisibilityOracle for FakeOracle {
        fn commit_timestamp(&self, ts: Timestamp) -> Option<Timestamp> {
            self.0.get(&ts).copied()
        }
    }

    #[test]
    fn roundtrips_mixed_versions() {
        let entries = vec![
            MvvEntry::stored(VersionHandle::new(10, 0), b"old".to_vec()),
            MvvEntry::anti(VersionHandle::new(20, 0)),
            MvvEntry::stored(VersionHandle::new(30, 1), b"new".to_vec()),
        ];
        let encoded = encode(&entries).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn resolves_most_recent_committed_version() {
        let oracle = FakeOracle(HashMap::from([(10, 11), (30, 31)]));
        let entries = vec![
            MvvEntry::stored(VersionHandle::new(10, 0), b"old".to_vec()),
            MvvEntry::stored(VersionHandle::new(30, 0), b"new".to_vec()),
        ];
        assert_eq!(resolve_visible(&entries, 50, 999, &oracle), Some(&b"new"[..]));
        assert_eq!(resolve_visible(&entries, 20, 999, &oracle), Some(&b"old"[..]));
    }

    #[test]
    fn own_transaction_sees_its_own_uncommitted_write() {
        let oracle = FakeOracle(HashMap::new());
        let entries = vec![MvvEntry::stored(VersionHandle::new(40, 0), b"mine".to_vec())];
        assert_eq!(resolve_visible(&entries, 0, 40, &oracle), Some(&b"mine"[..]));
    }

    #[test]
    fn anti_value_reads_as_absent() {
        let oracle = FakeOracle(HashMap::from([(10, 11)]));
        let entries = vec![MvvEntry::anti(VersionHandle::new(10, 0))];
        assert_eq!(resolve_visible(&entries, 50, 999, &oracle), None);
    }

    #[test]
    fn pruning_drops_aborted_and_obsolete_versions_but_keeps_newest_below_floor() {
        let oracle = FakeOracle(HashMap::from([(10, 11), (30, 31)]));
        let entries = vec![
            MvvEntry::stored(VersionHandle::new(10, 0), b"old".to_vec()),
            MvvEntry::anti(VersionHandle::new(20, 0)), // aborted, no entry in oracle
            MvvEntry::stored(VersionHandle::new(30, 0), b"new".to_vec()),
        ];
        let pruned = prune(entries, 100, &oracle);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].handle.ts(), 30);
    }
}
