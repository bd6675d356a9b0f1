//! Traversal and mutation across a whole named tree: descend, insert with
//! split, delete with opportunistic join, range scans, and the directory
//! bootstrap that lets trees be stored inside a tree. Page-local payloads and
//! policies live one level down in [`crate::btree`]; this module only knows
//! how to walk and rewrite the pages that make up one tree.
//!
//! Structural changes (split, join, new root) are serialized per tree behind
//! `structure_lock`, a coarse mutex rather than latch-coupled node locks.
//! Concurrent readers and same-key writers elsewhere in the tree still block
//! only on the buffer pool's own per-page claims; only structural mutation of
//! *this* tree is fully serialized. A future revision could narrow this to
//! per-subtree locking, but the B+-tree here is shallow enough in practice
//! (page sizes of several KB, fan-out in the hundreds) that contention on a
//! single tree's structural lock is not expected to dominate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::btree::{
    longrecord, IndexEntry, IndexPage, JoinPolicy, Key, LeafEntry, LeafPage, SequenceHint,
    SplitPolicy,
};
use crate::buffer::{BufferPool, WriteGuard};
use crate::error::{Error, Result};
use crate::mvcc::mvv::{self, MvvEntry, VersionHandle, VisibilityOracle};
use crate::mvcc::{Accumulator, AccumulatorKind, TransactionIndex, TxnState};
use crate::types::{PageId, Timestamp, TreeHandle, VolumeId};
use crate::volume::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::volume::Volume;

/// Where a tree persists the address of its own root page. The bootstrap
/// directory tree writes straight into the volume's head page; every other
/// tree writes into its [`crate::db::directory::TreeRecord`] entry inside
/// that directory tree. Kept as a trait so this module has no dependency on
/// the directory record's layout.
pub trait RootSink: Send + Sync {
    fn set_root(&self, root: PageId) -> Result<()>;
}

/// Writes straight into the volume's head-page `directory_root` field. Used
/// only by the bootstrap directory tree, which has nowhere else to live.
pub struct VolumeRootSink(pub Arc<Volume>);

impl RootSink for VolumeRootSink {
    fn set_root(&self, root: PageId) -> Result<()> {
        self.0.set_directory_root(root);
        Ok(())
    }
}

/// Scan direction for [`Tree::traverse`], matching the four comparison
/// operators a query can seed a traversal with plus an exact-match probe.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Gt,
    GtEq,
    Lt,
    LtEq,
    Eq,
}

/// A predicate a traversal applies to each candidate key before it counts
/// against the caller's depth bound or gets returned. Skipped keys are
/// invisible to the caller but still consume one step of traversal.
pub trait KeyFilter: Send + Sync {
    fn accept(&self, key: &Key) -> bool;
}

impl<F> KeyFilter for F
where
    F: Fn(&Key) -> bool + Send + Sync,
{
    fn accept(&self, key: &Key) -> bool {
        self(key)
    }
}

struct Descent {
    ancestors: Vec<PageId>,
    leaf: PageId,
}

/// A named B+-tree within a volume: one row of the engine's tree registry.
pub struct Tree {
    name: String,
    handle: TreeHandle,
    volume: Arc<Volume>,
    pool: Arc<BufferPool>,
    root: Mutex<PageId>,
    depth: AtomicU32,
    root_sink: Arc<dyn RootSink>,
    structure_lock: Mutex<()>,
    split_policy: SplitPolicy,
    accumulators: Mutex<HashMap<(AccumulatorKind, u8), Arc<Accumulator>>>,
}

impl Tree {
    /// Wraps an existing (possibly empty, `root == PageId(0)`) tree.
    pub fn new(
        name: impl Into<String>,
        handle: TreeHandle,
        root: PageId,
        depth: u32,
        volume: Arc<Volume>,
        pool: Arc<BufferPool>,
        root_sink: Arc<dyn RootSink>,
    ) -> Self {
        Self {
            name: name.into(),
            handle,
            volume,
            pool,
            root: Mutex::new(root),
            depth: AtomicU32::new(depth),
            root_sink,
            structure_lock: Mutex::new(()),
            split_policy: SplitPolicy::Pack,
            accumulators: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> TreeHandle {
        self.handle
    }

    pub fn root_page(&self) -> PageId {
        *self.root.lock()
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume.id()
    }

    pub fn is_empty(&self) -> bool {
        self.root.lock().0 == 0
    }

    fn capacity(&self) -> usize {
        self.volume.page_size() as usize - PAGE_HDR_LEN
    }

    /// Keys longer than this can never fit a page no matter the split policy.
    pub fn max_key_size(&self) -> usize {
        self.capacity() / 4
    }

    /// Values at or under this size are stored inline; larger ones go through
    /// [`crate::btree::longrecord`].
    pub fn value_ceiling(&self) -> usize {
        self.capacity() / 4
    }

    // ---- accumulators -----------------------------------------------------

    /// Returns (creating if necessary) the accumulator at `(kind, index)`.
    /// A tree may register at most 64 slots.
    pub fn accumulator(&self, kind: AccumulatorKind, index: u8) -> Result<Arc<Accumulator>> {
        let mut slots = self.accumulators.lock();
        if let Some(acc) = slots.get(&(kind, index)) {
            return Ok(acc.clone());
        }
        if slots.len() >= 64 {
            return Err(Error::InvalidKey("tree already has 64 accumulator slots"));
        }
        let acc = Arc::new(Accumulator::new(kind));
        slots.insert((kind, index), acc.clone());
        Ok(acc)
    }

    /// Reinstalls an accumulator at a known reconciled base, used when
    /// reopening a tree from its persisted directory record.
    pub fn install_accumulator(&self, kind: AccumulatorKind, index: u8, base_value: i64, base_as_of: Timestamp) {
        self.accumulators
            .lock()
            .insert((kind, index), Arc::new(Accumulator::from_base(kind, base_value, base_as_of)));
    }

    /// Folds every registered accumulator's committed deltas up to
    /// `checkpoint_ts` and returns the reconciled `(kind, index, base_value,
    /// base_as_of)` tuples to persist into the directory record.
    pub fn reconcile_accumulators(&self, checkpoint_ts: Timestamp) -> Vec<(AccumulatorKind, u8, i64, Timestamp)> {
        let slots = self.accumulators.lock();
        slots
            .iter()
            .map(|((kind, index), acc)| {
                acc.reconcile(checkpoint_ts);
                (*kind, *index, acc.base_value(), acc.base_as_of())
            })
            .collect()
    }

    // ---- page writers -------------------------------------------------

    fn write_leaf(&self, guard: &mut WriteGuard, header: &mut PageHeader, leaf: &LeafPage, now: Timestamp) -> Result<()> {
        header.kind = PageKind::Data;
        header.modified_at = now;
        let mut buf = vec![0u8; self.volume.page_size() as usize];
        let (count, tail) = leaf.encode(page::body_mut(&mut buf))?;
        header.key_block_count = count;
        header.tail_start = tail;
        header.encode(&mut buf)?;
        page::apply_crc32(&mut buf, header.page_no, header.salt);
        guard.copy_from_slice(&buf);
        guard.mark_dirty(now);
        Ok(())
    }

    fn write_index(&self, guard: &mut WriteGuard, header: &mut PageHeader, index_page: &IndexPage, now: Timestamp) -> Result<()> {
        header.kind = PageKind::Index;
        header.modified_at = now;
        let mut buf = vec![0u8; self.volume.page_size() as usize];
        let (count, tail) = index_page.encode(page::body_mut(&mut buf))?;
        header.key_block_count = count;
        header.tail_start = tail;
        header.encode(&mut buf)?;
        page::apply_crc32(&mut buf, header.page_no, header.salt);
        guard.copy_from_slice(&buf);
        guard.mark_dirty(now);
        Ok(())
    }

    fn prepare_value(&self, value: Vec<u8>, now: Timestamp) -> Result<Vec<u8>> {
        if value.len() > self.value_ceiling() {
            longrecord::store(&self.volume, &self.pool, self.volume.id(), &value, now)
        } else {
            Ok(value)
        }
    }

    fn ensure_root(&self, now: Timestamp) -> Result<PageId> {
        {
            let root = self.root.lock();
            if root.0 != 0 {
                return Ok(*root);
            }
        }
        let _structure = self.structure_lock.lock();
        {
            let root = self.root.lock();
            if root.0 != 0 {
                return Ok(*root);
            }
        }
        let page_no = self.volume.alloc_new_page()?;
        let mut header = PageHeader::new(page_no, PageKind::Data, self.volume.page_size(), 0)?;
        let mut guard = self.pool.claim_new(self.volume.id(), page_no, vec![0u8; self.volume.page_size() as usize])?;
        self.write_leaf(&mut guard, &mut header, &LeafPage::default(), now)?;
        drop(guard);
        *self.root.lock() = page_no;
        self.root_sink.set_root(page_no)?;
        Ok(page_no)
    }

    // ---- descent --------------------------------------------------------

    fn descend(&self, key: &Key) -> Result<Descent> {
        let mut ancestors = Vec::new();
        let mut current = *self.root.lock();
        if current.0 == 0 {
            return Err(Error::CorruptVolume("descend on tree with no root page".into()));
        }
        loop {
            let guard = self.pool.get_shared(self.volume.id(), current)?;
            let header = PageHeader::decode(&guard)?;
            match header.kind {
                PageKind::Index => {
                    let index_page = IndexPage::decode(page::body(&guard), header.key_block_count)?;
                    drop(guard);
                    let child = index_page.child_for(key);
                    ancestors.push(current);
                    current = child;
                }
                PageKind::Data => return Ok(Descent { ancestors, leaf: current }),
                _ => return Err(Error::CorruptVolume("unexpected page kind during tree descent".into())),
            }
        }
    }

    fn leftmost_leaf(&self, mut current: PageId) -> Result<PageId> {
        loop {
            let guard = self.pool.get_shared(self.volume.id(), current)?;
            let header = PageHeader::decode(&guard)?;
            match header.kind {
                PageKind::Data => return Ok(current),
                PageKind::Index => {
                    let index_page = IndexPage::decode(page::body(&guard), header.key_block_count)?;
                    drop(guard);
                    current = index_page.entries.first().map(|e| e.child).unwrap_or(index_page.high_child);
                }
                _ => return Err(Error::CorruptVolume("unexpected page kind during leftmost descent".into())),
            }
        }
    }

    fn rightmost_path(&self, mut current: PageId) -> Result<(Vec<PageId>, PageId)> {
        let mut path = Vec::new();
        loop {
            let guard = self.pool.get_shared(self.volume.id(), current)?;
            let header = PageHeader::decode(&guard)?;
            match header.kind {
                PageKind::Data => return Ok((path, current)),
                PageKind::Index => {
                    let index_page = IndexPage::decode(page::body(&guard), header.key_block_count)?;
                    drop(guard);
                    path.push(current);
                    current = index_page.high_child;
                }
                _ => return Err(Error::CorruptVolume("unexpected page kind during rightmost descent".into())),
            }
        }
    }

    /// Given the ancestor chain leading to `leaf`, finds the leaf immediately
    /// to its left (and the ancestor chain leading to it), or `None` if
    /// `leaf` is already the tree's first leaf.
    fn previous_leaf(&self, ancestors: &[PageId], leaf: PageId) -> Result<Option<(Vec<PageId>, PageId)>> {
        if ancestors.is_empty() {
            return Ok(None);
        }
        let parent = ancestors[ancestors.len() - 1];
        let parent_ancestors = &ancestors[..ancestors.len() - 1];
        let guard = self.pool.get_shared(self.volume.id(), parent)?;
        let header = PageHeader::decode(&guard)?;
        let index_page = IndexPage::decode(page::body(&guard), header.key_block_count)?;
        drop(guard);

        let sibling_child = if index_page.high_child == leaf {
            index_page.entries.last().map(|e| e.child)
        } else if let Some(pos) = index_page.entries.iter().position(|e| e.child == leaf) {
            if pos > 0 {
                Some(index_page.entries[pos - 1].child)
            } else {
                None
            }
        } else {
            return Err(Error::CorruptVolume("previous-leaf lookup: child missing from parent".into()));
        };

        match sibling_child {
            Some(child) => {
                let mut new_ancestors = ancestors.to_vec();
                let (extra, rightmost) = self.rightmost_path(child)?;
                new_ancestors.extend(extra);
                Ok(Some((new_ancestors, rightmost)))
            }
            None => self.previous_leaf(parent_ancestors, parent),
        }
    }

    fn leaf_entry_count(&self, page_no: PageId) -> Result<usize> {
        let guard = self.pool.get_shared(self.volume.id(), page_no)?;
        let header = PageHeader::decode(&guard)?;
        Ok(header.key_block_count as usize)
    }

    // ---- reads ------------------------------------------------------------

    /// Looks up `key`, returning the version visible to a reader at
    /// `snapshot` whose own transaction started at `reader_ts`.
    pub fn fetch(&self, key: &Key, snapshot: Timestamp, reader_ts: Timestamp, oracle: &dyn VisibilityOracle) -> Result<Option<Vec<u8>>> {
        if key.len() > self.max_key_size() {
            return Err(Error::InvalidKey("key exceeds page maximum"));
        }
        if self.is_empty() {
            return Ok(None);
        }
        let descent = self.descend(key)?;
        let guard = self.pool.get_shared(self.volume.id(), descent.leaf)?;
        let header = PageHeader::decode(&guard)?;
        let leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
        drop(guard);

        let found = leaf.find_key(key);
        if !found.exact {
            return Ok(None);
        }
        let versions = mvv::decode(&leaf.entries[found.index].value)?;
        match mvv::resolve_visible(&versions, snapshot, reader_ts, oracle) {
            None => Ok(None),
            Some(bytes) if longrecord::LongRecordDescriptor::is_descriptor(bytes) => {
                Ok(Some(longrecord::load(&self.pool, self.volume.id(), bytes)?))
            }
            Some(bytes) => Ok(Some(bytes.to_vec())),
        }
    }

    // ---- writes -------------------------------------------------------

    /// Stores `value` under `key` as a new MVV version written by the
    /// transaction at `ts`/`step`. `value` is long-record-chained first if it
    /// exceeds [`Tree::value_ceiling`].
    pub fn store(&self, key: Key, value: Vec<u8>, ts: Timestamp, step: u8, now: Timestamp, txn_index: &TransactionIndex) -> Result<()> {
        if key.len() > self.max_key_size() {
            return Err(Error::InvalidKey("key exceeds page maximum"));
        }
        let stored_value = self.prepare_value(value, now)?;
        self.ensure_root(now)?;
        let _structure = self.structure_lock.lock();
        txn_index.add_mvv_ref(ts);
        self.upsert_version(key, MvvEntry::stored(VersionHandle::new(ts, step), stored_value), now, txn_index)
    }

    /// Writes an anti-value version recording `key`'s deletion, if a visible
    /// version currently exists. Returns `false` without writing anything if
    /// the key was already absent.
    pub fn remove(&self, key: &Key, ts: Timestamp, step: u8, now: Timestamp, txn_index: &TransactionIndex) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        let _structure = self.structure_lock.lock();
        let descent = self.descend(key)?;
        let guard = self.pool.get_shared(self.volume.id(), descent.leaf)?;
        let header = PageHeader::decode(&guard)?;
        let leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
        drop(guard);
        let found = leaf.find_key(key);
        if !found.exact {
            return Ok(false);
        }
        let versions = mvv::decode(&leaf.entries[found.index].value)?;
        if mvv::resolve_visible(&versions, ts, ts, txn_index).is_none() {
            return Ok(false);
        }
        txn_index.add_mvv_ref(ts);
        self.upsert_version(key.clone(), MvvEntry::anti(VersionHandle::new(ts, step)), now, txn_index)?;
        Ok(true)
    }

    /// Writes an anti-value version over every key in `[start, end)` that
    /// currently has a visible value. Never physically removes pages; that is
    /// left to [`Tree::compact`], called separately once versions below the
    /// transaction floor are safe to discard.
    pub fn remove_range(&self, start: &Key, end: &Key, ts: Timestamp, now: Timestamp, txn_index: &TransactionIndex) -> Result<u64> {
        if self.is_empty() {
            return Ok(0);
        }
        let _structure = self.structure_lock.lock();
        let mut removed = 0u64;
        let mut step: u8 = 0;
        let mut current = self.descend(start)?.leaf;

        loop {
            let mut guard = self.pool.get_exclusive(self.volume.id(), current)?;
            let mut header = PageHeader::decode(&guard)?;
            let mut leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
            let right_sibling = header.right_sibling;
            let mut changed = false;

            for entry in leaf.entries.iter_mut() {
                if entry.key.compare(start) != std::cmp::Ordering::Less && entry.key.compare(end) == std::cmp::Ordering::Less {
                    let versions = mvv::decode(&entry.value)?;
                    if mvv::resolve_visible(&versions, ts, ts, txn_index).is_none() {
                        continue;
                    }
                    let mut versions = versions;
                    versions.push(MvvEntry::anti(VersionHandle::new(ts, step)));
                    step = step.wrapping_add(1);
                    entry.value = mvv::encode(&versions)?;
                    txn_index.add_mvv_ref(ts);
                    changed = true;
                    removed += 1;
                }
            }

            if changed {
                if leaf.encoded_size() <= self.capacity() {
                    self.write_leaf(&mut guard, &mut header, &leaf, now)?;
                    drop(guard);
                } else {
                    // Anti-value overhead pushed this page over capacity; split
                    // it like any other overflowing write. No sequence bias
                    // applies here, so the midpoint is as good a split as any.
                    drop(guard);
                    let descent = self.descend(&leaf.entries[0].key)?;
                    let midpoint = leaf.entries.len() / 2;
                    let was_count = leaf.entries.len();
                    self.split_leaf(descent, leaf, midpoint, was_count, now)?;
                }
            } else {
                drop(guard);
            }

            match right_sibling {
                Some(next) => {
                    let peek = self.pool.get_shared(self.volume.id(), next)?;
                    let peek_header = PageHeader::decode(&peek)?;
                    let peek_leaf = LeafPage::decode(page::body(&peek), peek_header.key_block_count)?;
                    drop(peek);
                    let past_end = peek_leaf
                        .entries
                        .first()
                        .map(|e| e.key.compare(end) != std::cmp::Ordering::Less)
                        .unwrap_or(true);
                    if past_end {
                        break;
                    }
                    current = next;
                }
                None => break,
            }
        }
        Ok(removed)
    }

    /// Appends `version` to the MVV chain at `key`, splitting the owning leaf
    /// (and propagating up through ancestors, possibly installing a new root)
    /// if the page overflows. If the chain's newest entry belongs to a
    /// different, still-active transaction, blocks on that transaction's
    /// write-write lock before proceeding (a higher layer is expected to have
    /// already arranged this wait in the common case; this is the backstop).
    fn upsert_version(&self, key: Key, version: MvvEntry, now: Timestamp, txn_index: &TransactionIndex) -> Result<()> {
        loop {
            let descent = self.descend(&key)?;
            let mut guard = self.pool.get_exclusive(self.volume.id(), descent.leaf)?;
            let mut header = PageHeader::decode(&guard)?;
            let mut leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
            let found = leaf.find_key(&key);

            if found.exact {
                let existing = mvv::decode(&leaf.entries[found.index].value)?;
                if let Some(newest) = existing.last() {
                    let writer_ts = newest.handle.ts();
                    if writer_ts != version.handle.ts() && txn_index.state(writer_ts) == Some(TxnState::Active) {
                        drop(guard);
                        txn_index.wait_for_resolution(writer_ts)?;
                        continue;
                    }
                }

                let floor = txn_index.global_floor();
                let mut versions = mvv::prune(existing, floor, txn_index);
                versions.push(version);
                let encoded = mvv::encode(&versions)?;
                let insert_index = found.index;
                let was_count = leaf.entries.len();
                leaf.put(key, encoded);

                if leaf.encoded_size() <= self.capacity() {
                    self.write_leaf(&mut guard, &mut header, &leaf, now)?;
                    return Ok(());
                }
                drop(guard);
                return self.split_leaf(descent, leaf, insert_index, was_count, now);
            } else {
                let encoded = mvv::encode(std::slice::from_ref(&version))?;
                let insert_index = found.index;
                let was_count = leaf.entries.len();
                leaf.put(key, encoded);

                if leaf.encoded_size() <= self.capacity() {
                    self.write_leaf(&mut guard, &mut header, &leaf, now)?;
                    return Ok(());
                }
                drop(guard);
                return self.split_leaf(descent, leaf, insert_index, was_count, now);
            }
        }
    }

    // ---- split propagation --------------------------------------------

    fn split_leaf(&self, descent: Descent, mut leaf: LeafPage, insert_index: usize, was_count: usize, now: Timestamp) -> Result<()> {
        if leaf.entries.len() < 2 {
            return Err(Error::Fatal("leaf page overflow with a single entry".into()));
        }
        let capacity = self.capacity();
        let hint = SequenceHint::classify(insert_index, was_count);
        let prefix = leaf.prefix_sizes();
        let split_at = self
            .split_policy
            .choose(&prefix, capacity, hint, insert_index)
            .clamp(1, leaf.entries.len() - 1);
        let right = leaf.split_off(split_at);
        let new_sep = leaf.entries.last().expect("left half non-empty after split").key.clone();

        let mut guard = self.pool.get_exclusive(self.volume.id(), descent.leaf)?;
        let mut left_header = PageHeader::decode(&guard)?;
        let old_right_sibling = left_header.right_sibling;
        let right_page_no = self.volume.alloc_new_page()?;
        left_header.right_sibling = Some(right_page_no);
        self.write_leaf(&mut guard, &mut left_header, &leaf, now)?;
        drop(guard);

        let mut right_header = PageHeader::new(right_page_no, PageKind::Data, self.volume.page_size(), 0)?;
        right_header.right_sibling = old_right_sibling;
        let mut right_guard = self.pool.claim_new(self.volume.id(), right_page_no, vec![0u8; self.volume.page_size() as usize])?;
        self.write_leaf(&mut right_guard, &mut right_header, &right, now)?;
        drop(right_guard);

        self.propagate_split(descent.ancestors, descent.leaf, right_page_no, new_sep, now)
    }

    fn propagate_split(&self, mut ancestors: Vec<PageId>, old_child: PageId, new_right: PageId, separator: Key, now: Timestamp) -> Result<()> {
        let parent_page = match ancestors.pop() {
            None => return self.install_new_root(old_child, new_right, separator, now),
            Some(p) => p,
        };

        let mut guard = self.pool.get_exclusive(self.volume.id(), parent_page)?;
        let mut header = PageHeader::decode(&guard)?;
        let mut index_page = IndexPage::decode(page::body(&guard), header.key_block_count)?;

        if let Some(pos) = index_page.entries.iter().position(|e| e.child == old_child) {
            index_page.entries[pos].child = new_right;
            index_page.entries.insert(pos, IndexEntry { separator, child: old_child });
        } else if index_page.high_child == old_child {
            index_page.high_child = new_right;
            index_page.entries.push(IndexEntry { separator, child: old_child });
        } else {
            return Err(Error::CorruptVolume("split propagation: child missing from parent index page".into()));
        }

        if index_page.encoded_size() <= self.capacity() {
            self.write_index(&mut guard, &mut header, &index_page, now)?;
            return Ok(());
        }
        if index_page.entries.len() < 2 {
            return Err(Error::Fatal("index page overflow with fewer than two entries".into()));
        }

        let split_at = index_page.entries.len() / 2;
        let (promoted, right_index_page) = index_page.split_off(split_at);
        self.write_index(&mut guard, &mut header, &index_page, now)?;
        drop(guard);

        let right_page_no = self.volume.alloc_new_page()?;
        let mut right_header = PageHeader::new(right_page_no, PageKind::Index, self.volume.page_size(), 0)?;
        right_header.index_level = header.index_level;
        let mut right_guard = self.pool.claim_new(self.volume.id(), right_page_no, vec![0u8; self.volume.page_size() as usize])?;
        self.write_index(&mut right_guard, &mut right_header, &right_index_page, now)?;
        drop(right_guard);

        self.propagate_split(ancestors, parent_page, right_page_no, promoted, now)
    }

    fn install_new_root(&self, old_root: PageId, new_right: PageId, separator: Key, now: Timestamp) -> Result<()> {
        let new_root_no = self.volume.alloc_new_page()?;
        let mut index_page = IndexPage::new(new_right);
        index_page.entries.push(IndexEntry { separator, child: old_root });

        let mut header = PageHeader::new(new_root_no, PageKind::Index, self.volume.page_size(), 0)?;
        header.index_level = self.depth.load(Ordering::SeqCst) as u8 + 1;
        let mut guard = self.pool.claim_new(self.volume.id(), new_root_no, vec![0u8; self.volume.page_size() as usize])?;
        self.write_index(&mut guard, &mut header, &index_page, now)?;
        drop(guard);

        *self.root.lock() = new_root_no;
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.root_sink.set_root(new_root_no)
    }

    // ---- join / compaction --------------------------------------------

    fn prune_entries(&self, entries: Vec<LeafEntry>, floor: Timestamp, txn_index: &TransactionIndex) -> Result<Vec<LeafEntry>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let versions = mvv::decode(&entry.value)?;
            let kept_handles: std::collections::HashSet<_> = {
                let pruned = mvv::prune(versions.clone(), floor, txn_index);
                pruned.iter().map(|v| v.handle).collect()
            };
            for dropped in versions.iter().filter(|v| !kept_handles.contains(&v.handle)) {
                txn_index.release_mvv_ref(dropped.handle.ts());
                if let Some(bytes) = &dropped.value {
                    if longrecord::LongRecordDescriptor::is_descriptor(bytes) {
                        longrecord::free_chain(&self.volume, &self.pool, self.volume.id(), bytes)?;
                    }
                }
            }
            let pruned = mvv::prune(versions, floor, txn_index);
            if pruned.is_empty() {
                continue;
            }
            out.push(LeafEntry {
                key: entry.key,
                value: mvv::encode(&pruned)?,
            });
        }
        Ok(out)
    }

    fn merge_right(
        &self,
        left: PageId,
        right: PageId,
        ancestors: Vec<PageId>,
        merged: &LeafPage,
        new_right_sibling: Option<PageId>,
        now: Timestamp,
    ) -> Result<()> {
        let mut left_guard = self.pool.get_exclusive(self.volume.id(), left)?;
        let mut left_header = PageHeader::decode(&left_guard)?;
        left_header.right_sibling = new_right_sibling;
        self.write_leaf(&mut left_guard, &mut left_header, merged, now)?;
        drop(left_guard);

        let parent = *ancestors
            .last()
            .ok_or_else(|| Error::Fatal("merge of root-level leaf has no parent to update".into()))?;
        let mut pguard = self.pool.get_exclusive(self.volume.id(), parent)?;
        let mut pheader = PageHeader::decode(&pguard)?;
        let mut index_page = IndexPage::decode(page::body(&pguard), pheader.key_block_count)?;

        if index_page.high_child == right {
            let pos = index_page
                .entries
                .iter()
                .position(|e| e.child == left)
                .ok_or_else(|| Error::CorruptVolume("merge: left child missing from parent".into()))?;
            index_page.entries.remove(pos);
            index_page.high_child = left;
        } else if let Some(rpos) = index_page.entries.iter().position(|e| e.child == right) {
            let right_sep = index_page.entries[rpos].separator.clone();
            index_page.entries.remove(rpos);
            let lpos = index_page
                .entries
                .iter()
                .position(|e| e.child == left)
                .ok_or_else(|| Error::CorruptVolume("merge: left child missing from parent".into()))?;
            index_page.entries[lpos].separator = right_sep;
        } else {
            return Err(Error::CorruptVolume("merge: right child missing from parent".into()));
        }

        self.write_index(&mut pguard, &mut pheader, &index_page, now)?;
        drop(pguard);
        self.volume.free_page(right);
        Ok(())
    }

    /// Prunes every leaf in the tree against `txn_index`'s current floor and
    /// merges adjacent leaves that fit together afterward. Returns the number
    /// of merges performed. Interior pages are never themselves compacted;
    /// an index page left a little sparse by a merge below it stays legal
    /// but unjoined, to be revisited by a later pass.
    pub fn compact(&self, txn_index: &TransactionIndex, now: Timestamp) -> Result<usize> {
        let root = *self.root.lock();
        if root.0 == 0 {
            return Ok(0);
        }
        let _structure = self.structure_lock.lock();
        let floor = txn_index.global_floor();
        let mut joined = 0usize;
        let mut current = self.leftmost_leaf(root)?;

        loop {
            let guard = self.pool.get_shared(self.volume.id(), current)?;
            let header = PageHeader::decode(&guard)?;
            let leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
            let right_sibling = header.right_sibling;
            drop(guard);

            let before = leaf.entries.len();
            let mut leaf = LeafPage { entries: self.prune_entries(leaf.entries, floor, txn_index)? };
            let pruned_any = leaf.entries.len() != before;

            let Some(right_page) = right_sibling else {
                if pruned_any {
                    let mut g = self.pool.get_exclusive(self.volume.id(), current)?;
                    let mut h = PageHeader::decode(&g)?;
                    self.write_leaf(&mut g, &mut h, &leaf, now)?;
                }
                break;
            };

            let right_guard = self.pool.get_shared(self.volume.id(), right_page)?;
            let right_header = PageHeader::decode(&right_guard)?;
            let right_leaf_raw = LeafPage::decode(page::body(&right_guard), right_header.key_block_count)?;
            let right_right_sibling = right_header.right_sibling;
            drop(right_guard);
            let right_leaf = LeafPage { entries: self.prune_entries(right_leaf_raw.entries, floor, txn_index)? };

            let fits = JoinPolicy::fits(leaf.encoded_size(), right_leaf.encoded_size(), self.capacity());
            let mut merged_this_round = false;
            if !leaf.entries.is_empty() && fits {
                match self.descend(&leaf.entries[0].key) {
                    Ok(descent) if descent.leaf == current => {
                        let mut merged = leaf.clone();
                        merged.append(right_leaf);
                        self.merge_right(current, right_page, descent.ancestors, &merged, right_right_sibling, now)?;
                        joined += 1;
                        merged_this_round = true;
                    }
                    Ok(_) => {
                        warn!(?current, "compact: descent landed on a different leaf than expected, skipping merge");
                    }
                    Err(error) => {
                        warn!(?current, %error, "compact: could not resolve ancestors for merge candidate");
                    }
                }
            }

            if merged_this_round {
                // `current` now holds the merged content; re-evaluate it
                // against its new right sibling before moving on.
                continue;
            }

            if pruned_any {
                let mut g = self.pool.get_exclusive(self.volume.id(), current)?;
                let mut h = PageHeader::decode(&g)?;
                self.write_leaf(&mut g, &mut h, &leaf, now)?;
            }
            current = right_page;
        }
        Ok(joined)
    }

    // ---- traversal ------------------------------------------------------

    /// Opens a cursor starting at `start` and walking in `direction`, visiting
    /// at most `depth_bound` page positions (matched keys and filtered-out
    /// keys both count against this bound; only matched, visible keys are
    /// returned).
    pub fn traverse<'a>(
        &'a self,
        start: &Key,
        direction: Direction,
        snapshot: Timestamp,
        reader_ts: Timestamp,
        oracle: &'a dyn VisibilityOracle,
        filter: Option<&'a dyn KeyFilter>,
        depth_bound: usize,
    ) -> Result<TreeCursor<'a>> {
        let root = *self.root.lock();
        if root.0 == 0 {
            return Ok(TreeCursor {
                tree: self,
                oracle,
                snapshot,
                reader_ts,
                direction,
                filter,
                remaining: depth_bound,
                state: CursorState::Exhausted,
            });
        }

        let descent = self.descend(start)?;
        let guard = self.pool.get_shared(self.volume.id(), descent.leaf)?;
        let header = PageHeader::decode(&guard)?;
        let leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
        drop(guard);
        let found = leaf.find_key(start);

        let idx: isize = match direction {
            Direction::Gt => {
                if found.exact {
                    found.index as isize + 1
                } else {
                    found.index as isize
                }
            }
            Direction::GtEq => found.index as isize,
            Direction::Lt => found.index as isize - 1,
            Direction::LtEq => {
                if found.exact {
                    found.index as isize
                } else {
                    found.index as isize - 1
                }
            }
            Direction::Eq => {
                if found.exact {
                    found.index as isize
                } else {
                    -1
                }
            }
        };

        let state = if idx < 0 && matches!(direction, Direction::Eq) {
            CursorState::Exhausted
        } else {
            CursorState::At { page: descent.leaf, ancestors: descent.ancestors, idx }
        };

        Ok(TreeCursor {
            tree: self,
            oracle,
            snapshot,
            reader_ts,
            direction,
            filter,
            remaining: depth_bound,
            state,
        })
    }
}

enum CursorState {
    At { page: PageId, ancestors: Vec<PageId>, idx: isize },
    Exhausted,
}

/// A live position within a [`Tree::traverse`] scan.
pub struct TreeCursor<'a> {
    tree: &'a Tree,
    oracle: &'a dyn VisibilityOracle,
    snapshot: Timestamp,
    reader_ts: Timestamp,
    direction: Direction,
    filter: Option<&'a dyn KeyFilter>,
    remaining: usize,
    state: CursorState,
}

impl<'a> TreeCursor<'a> {
    /// Advances to the next matching, visible key, or `None` once the scan is
    /// exhausted (end of tree reached, or the depth bound hit).
    pub fn next(&mut self) -> Result<Option<(Key, Vec<u8>)>> {
        loop {
            if self.remaining == 0 {
                self.state = CursorState::Exhausted;
            }
            let (page, ancestors, idx) = match &self.state {
                CursorState::Exhausted => return Ok(None),
                CursorState::At { page, ancestors, idx } => (*page, ancestors.clone(), *idx),
            };

            if idx < 0 {
                match self.tree.previous_leaf(&ancestors, page)? {
                    Some((new_ancestors, prev_page)) => {
                        let count = self.tree.leaf_entry_count(prev_page)?;
                        let next_idx = if count == 0 { -1 } else { count as isize - 1 };
                        self.state = CursorState::At { page: prev_page, ancestors: new_ancestors, idx: next_idx };
                        continue;
                    }
                    None => {
                        self.state = CursorState::Exhausted;
                        return Ok(None);
                    }
                }
            }

            let guard = self.tree.pool.get_shared(self.tree.volume.id(), page)?;
            let header = PageHeader::decode(&guard)?;
            let leaf = LeafPage::decode(page::body(&guard), header.key_block_count)?;
            let right_sibling = header.right_sibling;
            drop(guard);

            let idx_u = idx as usize;
            if idx_u >= leaf.entries.len() {
                match (self.direction, right_sibling) {
                    (Direction::Gt | Direction::GtEq, Some(next_page)) => {
                        self.state = CursorState::At { page: next_page, ancestors: Vec::new(), idx: 0 };
                        continue;
                    }
                    _ => {
                        self.state = CursorState::Exhausted;
                        return Ok(None);
                    }
                }
            }

            let entry = leaf.entries[idx_u].clone();
            self.remaining -= 1;

            let next_idx = match self.direction {
                Direction::Gt | Direction::GtEq => idx + 1,
                Direction::Lt | Direction::LtEq => idx - 1,
                Direction::Eq => -1,
            };
            if matches!(self.direction, Direction::Eq) {
                self.state = CursorState::Exhausted;
            } else {
                let next_ancestors = if matches!(self.direction, Direction::Lt | Direction::LtEq) {
                    ancestors
                } else {
                    Vec::new()
                };
                self.state = CursorState::At { page, ancestors: next_ancestors, idx: next_idx };
            }

            if let Some(filter) = self.filter {
                if !filter.accept(&entry.key) {
                    continue;
                }
            }

            let versions = mvv::decode(&entry.value)?;
            let bytes = match mvv::resolve_visible(&versions, self.snapshot, self.reader_ts, self.oracle) {
                Some(bytes) => bytes,
                None => continue,
            };
            let value = if longrecord::LongRecordDescriptor::is_descriptor(bytes) {
                longrecord::load(&self.tree.pool, self.tree.volume.id(), bytes)?
            } else {
                bytes.to_vec()
            };
            return Ok(Some((entry.key, value)));
        }
    }
}

/// A bound transaction's handle onto one tree: start timestamp, per-call step
/// counter, and the oracle a single logical transaction reads and writes
/// through. Mirrors the original system's "Exchange" concept, scoped here to
/// one tree at a time rather than one exchange serving many.
pub struct Exchange {
    tree: Arc<Tree>,
    txn_index: Arc<TransactionIndex>,
    ts: Timestamp,
    step: AtomicU8,
}

impl Exchange {
    pub fn new(tree: Arc<Tree>, txn_index: Arc<TransactionIndex>, ts: Timestamp) -> Self {
        Self { tree, txn_index, ts, step: AtomicU8::new(0) }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.tree.fetch(key, self.ts, self.ts, self.txn_index.as_ref())
    }

    pub fn store(&self, key: Key, value: Vec<u8>, now: Timestamp) -> Result<()> {
        let step = self.step.fetch_add(1, Ordering::SeqCst);
        self.tree.store(key, value, self.ts, step, now, &self.txn_index)
    }

    pub fn remove(&self, key: &Key, now: Timestamp) -> Result<bool> {
        let step = self.step.fetch_add(1, Ordering::SeqCst);
        self.tree.remove(key, self.ts, step, now, &self.txn_index)
    }

    pub fn remove_range(&self, start: &Key, end: &Key, now: Timestamp) -> Result<u64> {
        self.tree.remove_range(start, end, self.ts, now, &self.txn_index)
    }

    pub fn traverse<'a>(
        &'a self,
        start: &Key,
        direction: Direction,
        filter: Option<&'a dyn KeyFilter>,
        depth_bound: usize,
    ) -> Result<TreeCursor<'a>> {
        self.tree.traverse(start, direction, self.ts, self.ts, self.txn_index.as_ref(), filter, depth_bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, NullJournal};
    use crate::volume::spec::VolumeSpecification;
    use crate::volume::{new_volume_id, Volume};
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_tree(dir: &std::path::Path, page_size: u32) -> (Arc<Tree>, Arc<TransactionIndex>) {
        let path = dir.join("t.v01");
        let spec = VolumeSpecification::parse(&format!(
            "{},pageSize:{},initialSize:256k,maximumSize:8m,create",
            path.display(),
            page_size
        ))
        .unwrap();
        let volume = Arc::new(Volume::open(&spec, new_volume_id(), 1).unwrap());
        let pool = Arc::new(BufferPool::new(256, Arc::new(NullJournal), Duration::from_secs(1)));
        pool.register_volume(volume.clone());
        let root_sink = Arc::new(VolumeRootSink(volume.clone()));
        let tree = Arc::new(Tree::new("test", TreeHandle(1), PageId(0), 0, volume, pool, root_sink));
        let txn_index = Arc::new(TransactionIndex::new(4, Duration::from_millis(200)));
        (tree, txn_index)
    }

    fn k(s: &str) -> Key {
        Key::from_raw(s.as_bytes().to_vec())
    }

    #[test]
    fn store_then_fetch_round_trips_within_one_transaction() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 4096);
        txn_index.begin(10);
        let exchange = Exchange::new(tree.clone(), txn_index.clone(), 10);
        exchange.store(k("alpha"), b"1".to_vec(), 10).unwrap();
        assert_eq!(exchange.fetch(&k("alpha")).unwrap(), Some(b"1".to_vec()));
        assert_eq!(exchange.fetch(&k("missing")).unwrap(), None);
    }

    #[test]
    fn committed_write_is_visible_to_a_later_snapshot_but_not_an_earlier_one() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 4096);
        txn_index.begin(10);
        tree.store(k("k"), b"v".to_vec(), 10, 0, 10, &txn_index).unwrap();
        txn_index.commit(10, 20).unwrap();

        assert_eq!(tree.fetch(&k("k"), 15, 999, txn_index.as_ref()).unwrap(), None);
        assert_eq!(tree.fetch(&k("k"), 25, 999, txn_index.as_ref()).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn removing_an_absent_key_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 4096);
        txn_index.begin(5);
        let removed = tree.remove(&k("ghost"), 5, 0, 5, &txn_index).unwrap();
        assert!(!removed);
    }

    #[test]
    fn inserting_past_one_page_causes_a_split_and_both_halves_remain_reachable() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 1024);
        txn_index.begin(1);
        for i in 0..200u32 {
            let key = Key::from_raw(format!("key-{i:05}").into_bytes());
            tree.store(key, vec![0xAB; 20], 1, i.min(255) as u8, 1, &txn_index).unwrap();
        }
        assert!(tree.depth() >= 1, "200 entries in a 1KiB page should have split at least once");
        for i in 0..200u32 {
            let key = Key::from_raw(format!("key-{i:05}").into_bytes());
            assert_eq!(tree.fetch(&key, 1, 1, txn_index.as_ref()).unwrap(), Some(vec![0xAB; 20]));
        }
    }

    #[test]
    fn forward_sequential_insertion_keeps_pages_well_packed() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 1024);
        txn_index.begin(1);
        for i in 0..500u32 {
            let key = Key::from_raw(format!("{i:06}").into_bytes());
            tree.store(key, vec![0u8; 16], 1, i.min(255) as u8, 1, &txn_index).unwrap();
        }
        let stats = tree.volume.stats();
        // Forward sequential insertion under Pack should need meaningfully
        // fewer pages than an even/random split policy would for the same
        // keys; this is a coarse utilization smoke test, not an exact bound.
        assert!(stats.pages_allocated < 120, "allocated {} pages", stats.pages_allocated);
    }

    #[test]
    fn forward_traversal_visits_keys_in_order() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 1024);
        txn_index.begin(1);
        for i in 0..50u32 {
            let key = Key::from_raw(format!("{i:04}").into_bytes());
            tree.store(key, vec![1], 1, 0, 1, &txn_index).unwrap();
        }
        let mut cursor = tree
            .traverse(&Key::before_all(), Direction::Gt, 1, 1, txn_index.as_ref(), None, usize::MAX)
            .unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen.len(), 50);
        for w in seen.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn reverse_traversal_visits_keys_in_descending_order_across_a_split() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 1024);
        txn_index.begin(1);
        for i in 0..60u32 {
            let key = Key::from_raw(format!("{i:04}").into_bytes());
            tree.store(key, vec![1], 1, 0, 1, &txn_index).unwrap();
        }
        let mut cursor = tree
            .traverse(&Key::after_all(), Direction::Lt, 1, 1, txn_index.as_ref(), None, usize::MAX)
            .unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen.len(), 60);
        for w in seen.windows(2) {
            assert!(w[0] > w[1]);
        }
    }

    #[test]
    fn key_filter_skips_without_stopping_the_scan() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 4096);
        txn_index.begin(1);
        for word in ["chunk", "chip", "chair", "dog"] {
            tree.store(Key::from_raw(word.as_bytes().to_vec()), vec![1], 1, 0, 1, &txn_index).unwrap();
        }
        let starts_with_ch = |key: &Key| key.as_bytes().starts_with(b"ch");
        let mut cursor = tree
            .traverse(&Key::before_all(), Direction::Gt, 1, 1, txn_index.as_ref(), Some(&starts_with_ch), usize::MAX)
            .unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(String::from_utf8(key.as_bytes().to_vec()).unwrap());
        }
        assert_eq!(seen, vec!["chair", "chip", "chunk"]);
    }

    #[test]
    fn aborted_write_never_becomes_visible_and_is_pruned_away() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 4096);
        txn_index.begin(1);
        tree.store(k("k"), b"base".to_vec(), 1, 0, 1, &txn_index).unwrap();
        txn_index.commit(1, 2).unwrap();

        txn_index.begin(10);
        tree.store(k("k"), b"doomed".to_vec(), 10, 0, 10, &txn_index).unwrap();
        txn_index.abort(10).unwrap();

        txn_index.begin(20);
        assert_eq!(tree.fetch(&k("k"), 20, 20, txn_index.as_ref()).unwrap(), Some(b"base".to_vec()));

        txn_index.refresh_active_cache(0);
        txn_index.refresh_active_cache(1);
        txn_index.refresh_active_cache(2);
        txn_index.refresh_active_cache(3);
        let joined = tree.compact(&txn_index, 30).unwrap();
        let _ = joined; // a single key never merges pages; this exercises the prune path.
        assert_eq!(tree.fetch(&k("k"), 20, 20, txn_index.as_ref()).unwrap(), Some(b"base".to_vec()));
    }

    #[test]
    fn range_remove_marks_anti_values_across_the_range() {
        let dir = tempdir().unwrap();
        let (tree, txn_index) = make_tree(dir.path(), 4096);
        txn_index.begin(1);
        for i in 0..10u32 {
            let key = Key::from_raw(format!("{i:03}").into_bytes());
            tree.store(key, vec![1], 1, 0, 1, &txn_index).unwrap();
        }
        txn_index.commit(1, 2).unwrap();

        txn_index.begin(5);
        let removed = tree
            .remove_range(&Key::from_raw(b"003".to_vec()), &Key::from_raw(b"007".to_vec()), 5, 5, &txn_index)
            .unwrap();
        assert_eq!(removed, 4);

        txn_index.commit(5, 6).unwrap();
        txn_index.begin(100);
        for i in 0..10u32 {
            let key = Key::from_raw(format!("{i:03}").into_bytes());
            let expect_present = !(3..7).contains(&i);
            assert_eq!(tree.fetch(&key, 100, 100, txn_index.as_ref()).unwrap().is_some(), expect_present);
        }
    }
}
