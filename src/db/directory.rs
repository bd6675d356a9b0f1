//! The per-volume directory tree: a bootstrap B+-tree, rooted straight in the
//! volume head page, mapping tree name -> [`TreeRecord`]. Every other tree in
//! the volume persists its root page, depth, and accumulator bases as one
//! entry in here; the directory tree itself is the one tree with nowhere
//! else to record its own root, so it writes directly through
//! [`crate::tree::VolumeRootSink`].

use std::sync::Arc;

use crate::btree::{Key, Segment};
use crate::error::{Error, Result};
use crate::mvcc::{AccumulatorKind, TransactionIndex, VisibilityOracle};
use crate::tree::{RootSink, Tree, VolumeRootSink};
use crate::types::{PageId, Timestamp, TreeHandle, VolumeId};
use crate::volume::Volume;

/// Handle reserved for the directory tree itself; never handed out to a
/// caller-visible tree.
pub const DIRECTORY_HANDLE: TreeHandle = TreeHandle(0);

/// One tree's persisted bookkeeping inside its volume's directory tree.
#[derive(Clone, Debug)]
pub struct TreeRecord {
    pub handle: TreeHandle,
    pub root: PageId,
    pub depth: u32,
    pub accumulators: Vec<(AccumulatorKind, u8, i64, Timestamp)>,
}

fn kind_tag(kind: AccumulatorKind) -> u8 {
    match kind {
        AccumulatorKind::Sum => 0,
        AccumulatorKind::Min => 1,
        AccumulatorKind::Max => 2,
        AccumulatorKind::Seq => 3,
    }
}

fn kind_from_tag(tag: u8) -> Result<AccumulatorKind> {
    match tag {
        0 => Ok(AccumulatorKind::Sum),
        1 => Ok(AccumulatorKind::Min),
        2 => Ok(AccumulatorKind::Max),
        3 => Ok(AccumulatorKind::Seq),
        other => Err(Error::CorruptVolume(format!("unknown accumulator tag {other}"))),
    }
}

impl TreeRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(17 + self.accumulators.len() * 18);
        out.extend_from_slice(&self.handle.0.to_be_bytes());
        out.extend_from_slice(&self.root.0.to_be_bytes());
        out.extend_from_slice(&self.depth.to_be_bytes());
        out.push(self.accumulators.len() as u8);
        for (kind, index, base_value, base_as_of) in &self.accumulators {
            out.push(kind_tag(*kind));
            out.push(*index);
            out.extend_from_slice(&base_value.to_be_bytes());
            out.extend_from_slice(&base_as_of.to_be_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 17 {
            return Err(Error::CorruptVolume("directory record truncated".into()));
        }
        let handle = TreeHandle(u32::from_be_bytes(bytes[0..4].try_into().unwrap()));
        let root = PageId(u64::from_be_bytes(bytes[4..12].try_into().unwrap()));
        let depth = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let count = bytes[16] as usize;
        let mut accumulators = Vec::with_capacity(count);
        let mut off = 17;
        for _ in 0..count {
            if bytes.len() < off + 18 {
                return Err(Error::CorruptVolume("directory record accumulator slot truncated".into()));
            }
            let kind = kind_from_tag(bytes[off])?;
            let index = bytes[off + 1];
            let base_value = i64::from_be_bytes(bytes[off + 2..off + 10].try_into().unwrap());
            let base_as_of = Timestamp::from_be_bytes(bytes[off + 10..off + 18].try_into().unwrap());
            accumulators.push((kind, index, base_value, base_as_of));
            off += 18;
        }
        Ok(Self { handle, root, depth, accumulators })
    }
}

fn name_key(name: &str) -> Key {
    Key::encode(&[Segment::Str(name.to_string())])
}

/// Writes a tree's root back into its entry in the owning directory tree.
/// Used as the `RootSink` for every tree except the directory tree itself.
struct DirectorySink {
    directory: Arc<Tree>,
    name: String,
    handle: TreeHandle,
    now_source: Arc<dyn Fn() -> Timestamp + Send + Sync>,
}

impl RootSink for DirectorySink {
    fn set_root(&self, root: PageId) -> Result<()> {
        let now = (self.now_source)();
        let mut record = read_record(&self.directory, &self.name, now)?
            .unwrap_or_else(|| TreeRecord { handle: self.handle, root: PageId(0), depth: 0, accumulators: Vec::new() });
        record.root = root;
        write_record(&self.directory, &self.name, &record, now)
    }
}

/// Opens (creating if absent) the directory tree for `volume`, rooted at the
/// volume's head-page `directory_root` field.
pub fn open_directory(volume: Arc<Volume>, pool: Arc<crate::buffer::BufferPool>) -> Arc<Tree> {
    let root = volume.directory_root();
    let root_sink = Arc::new(VolumeRootSink(volume.clone()));
    Arc::new(Tree::new("__directory", DIRECTORY_HANDLE, root, 0, volume, pool, root_sink))
}

fn read_record(directory: &Arc<Tree>, name: &str, now: Timestamp) -> Result<Option<TreeRecord>> {
    // The directory tree is read/written outside of MVCC (every caller
    // observes the latest committed layout immediately), so it is accessed
    // at the "always visible" timestamp ceiling rather than a reader's
    // snapshot.
    let oracle = AlwaysVisible;
    let bytes = directory.fetch(&name_key(name), crate::types::TIMESTAMP_MAX, now, &oracle)?;
    bytes.map(|b| TreeRecord::decode(&b)).transpose()
}

fn write_record(directory: &Arc<Tree>, name: &str, record: &TreeRecord, now: Timestamp) -> Result<()> {
    let txn_index = TransactionIndex::new(1, std::time::Duration::from_secs(0));
    txn_index.begin(0);
    directory.store(name_key(name), record.encode(), 0, 0, now, &txn_index)?;
    txn_index.commit(0, 0)?;
    Ok(())
}

/// Every directory-tree write commits instantaneously at `ts = tc = 0`, so a
/// read of it is always visible regardless of the caller's own snapshot.
struct AlwaysVisible;
impl VisibilityOracle for AlwaysVisible {
    fn commit_timestamp(&self, _ts: Timestamp) -> Option<Timestamp> {
        Some(0)
    }
}

/// Looks up `name` in `directory`, creating a fresh zero-root record with a
/// freshly minted handle if absent and `create` is set.
pub fn lookup_or_create(
    directory: &Arc<Tree>,
    name: &str,
    create: bool,
    next_handle: &std::sync::atomic::AtomicU32,
    now: Timestamp,
) -> Result<Option<TreeRecord>> {
    if let Some(record) = read_record(directory, name, now)? {
        return Ok(Some(record));
    }
    if !create {
        return Ok(None);
    }
    let handle = TreeHandle(next_handle.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1);
    let record = TreeRecord { handle, root: PageId(0), depth: 0, accumulators: Vec::new() };
    write_record(directory, name, &record, now)?;
    Ok(Some(record))
}

/// Removes `name`'s entry from `directory` outright (used by `remove_tree`;
/// the directory-tree's own leftover anti-value entry is reclaimed later by
/// [`crate::cleanup::Action::CompactDirectory`]).
pub fn remove_record(directory: &Arc<Tree>, name: &str, now: Timestamp) -> Result<bool> {
    let txn_index = TransactionIndex::new(1, std::time::Duration::from_secs(0));
    txn_index.begin(0);
    let removed = directory.remove(&name_key(name), 0, 0, now, &txn_index)?;
    txn_index.commit(0, 0)?;
    Ok(removed)
}

/// Rebuilds `record`'s root pointer to `new_root` and persists the tree's
/// freshly reconciled accumulator bases, called at checkpoint time.
pub fn persist_tree_state(
    directory: &Arc<Tree>,
    name: &str,
    root: PageId,
    depth: u32,
    accumulators: Vec<(AccumulatorKind, u8, i64, Timestamp)>,
    now: Timestamp,
) -> Result<()> {
    let handle = read_record(directory, name, now)?
        .map(|r| r.handle)
        .ok_or_else(|| Error::CorruptVolume(format!("persist_tree_state: {name} has no directory entry")))?;
    write_record(directory, name, &TreeRecord { handle, root, depth, accumulators }, now)
}

/// Every tree name currently bound in `directory`, for the `dump`/`icheck`
/// surface and for restore.
pub fn list_names(directory: &Arc<Tree>, now: Timestamp) -> Result<Vec<String>> {
    if directory.is_empty() {
        return Ok(Vec::new());
    }
    let oracle = AlwaysVisible;
    let mut names = Vec::new();
    let mut cursor = directory.traverse(&Key::before_all(), crate::tree::Direction::Gt, crate::types::TIMESTAMP_MAX, now, &oracle, None, usize::MAX)?;
    while let Some((key, _value)) = cursor.next()? {
        names.push(decode_name(&key)?);
    }
    Ok(names)
}

fn decode_name(key: &Key) -> Result<String> {
    let bytes = key.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec()).map_err(|_| Error::CorruptVolume("directory key is not valid utf-8".into()))
}

/// Builds the `RootSink` a non-directory tree should persist its root
/// through.
pub fn directory_sink(directory: Arc<Tree>, name: impl Into<String>, handle: TreeHandle, now_source: Arc<dyn Fn() -> Timestamp + Send + Sync>) -> Arc<dyn RootSink> {
    Arc::new(DirectorySink { directory, name: name.into(), handle, now_source })
}
