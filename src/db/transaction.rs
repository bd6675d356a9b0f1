//! A bound transaction: one start timestamp, shared across however many
//! trees it touches, with commit/rollback consuming the handle. Mirrors the
//! teacher's original transaction type, scoped to a single volume at a time
//! (the directory tree that maps names to trees is itself per-volume).
//!
//! Every mutating call is journaled twice: once physically, by the buffer
//! pool writing a PA record before a dirty page reaches its volume slot
//! (`crate::buffer::PageJournal`), and once logically, by this module
//! appending an SR/DR/DT record. Recovery only ever replays the physical
//! trail; the logical records exist for the `dump`/`icheck` surface and for
//! anyone auditing what a transaction did, not for correctness.

use std::sync::Arc;

use crate::btree::Key;
use crate::db::engine::Engine;
use crate::error::Result;
use crate::tree::{Direction, Exchange, KeyFilter, Tree, TreeCursor};
use crate::types::{Timestamp, VolumeId};

/// One transaction's handle onto a volume. Dropping it without calling
/// [`Transaction::commit`] or [`Transaction::rollback`] is a bug: it panics
/// (unless already unwinding) rather than silently leaving the transaction's
/// status record dangling as `Active` forever.
pub struct Transaction {
    engine: Arc<Engine>,
    volume: VolumeId,
    ts: Timestamp,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(engine: Arc<Engine>, volume: VolumeId) -> Result<Self> {
        let ts = engine.ts_alloc().next();
        engine.txn_index().begin(ts);
        engine.journal().begin(ts)?;
        Ok(Self { engine, volume, ts, finished: false })
    }

    /// The timestamp every version this transaction writes will carry.
    pub fn start_timestamp(&self) -> Timestamp {
        self.ts
    }

    /// Opens (creating, if `create`, a fresh tree) a handle onto one named
    /// tree, scoped to this transaction's snapshot and writes.
    pub fn exchange(&self, tree_name: &str, create: bool) -> Result<TxExchange<'_>> {
        let tree = self.engine.open_tree(self.volume, tree_name, create)?;
        let handle = tree.handle().0;
        let exchange = Exchange::new(tree, self.engine.txn_index().clone(), self.ts);
        Ok(TxExchange { txn: self, exchange, tree_handle: handle })
    }

    /// Commits: allocates `tc`, flips the transaction index entry, and
    /// journals a TC record. Returns the commit timestamp.
    pub fn commit(mut self) -> Result<Timestamp> {
        let tc = self.engine.ts_alloc().next();
        self.engine.txn_index().commit(self.ts, tc)?;
        self.engine.journal().commit(self.ts, tc)?;
        self.finished = true;
        Ok(tc)
    }

    /// Aborts: flips the transaction index entry and journals a TX record,
    /// forcing a synchronous flush when `EngineConfig::rollback_flush_sync`
    /// is set so a crash immediately after cannot resurrect this
    /// transaction's writes (see the journal module's recovery doc comment).
    pub fn rollback(mut self) -> Result<()> {
        self.engine.txn_index().abort(self.ts)?;
        self.engine
            .journal()
            .rollback(self.ts, self.engine.config().rollback_flush_sync)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !std::thread::panicking() {
            panic!("Transaction dropped without commit or rollback");
        }
    }
}

/// A transaction-scoped handle onto one tree. Point and range operations go
/// through the wrapped [`Exchange`]; each mutation also appends the matching
/// diagnostic logical record to the journal.
pub struct TxExchange<'a> {
    txn: &'a Transaction,
    exchange: Exchange,
    tree_handle: u32,
}

impl<'a> TxExchange<'a> {
    pub fn tree(&self) -> &Arc<Tree> {
        self.exchange.tree()
    }

    pub fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.exchange.fetch(key)
    }

    pub fn store(&self, key: Key, value: Vec<u8>) -> Result<()> {
        let now = self.txn.engine.ts_alloc().current();
        self.txn
            .engine
            .journal()
            .log_store(self.txn.ts, self.tree_handle, key.as_bytes(), &value)?;
        self.exchange.store(key, value, now)
    }

    pub fn remove(&self, key: &Key) -> Result<bool> {
        let now = self.txn.engine.ts_alloc().current();
        let removed = self.exchange.remove(key, now)?;
        if removed {
            self.txn
                .engine
                .journal()
                .log_delete_range(self.txn.ts, self.tree_handle, key.as_bytes(), key.as_bytes())?;
        }
        Ok(removed)
    }

    pub fn remove_range(&self, start: &Key, end: &Key) -> Result<u64> {
        let now = self.txn.engine.ts_alloc().current();
        let removed = self.exchange.remove_range(start, end, now)?;
        if removed > 0 {
            self.txn
                .engine
                .journal()
                .log_delete_range(self.txn.ts, self.tree_handle, start.as_bytes(), end.as_bytes())?;
        }
        Ok(removed)
    }

    pub fn traverse(
        &'a self,
        start: &Key,
        direction: Direction,
        filter: Option<&'a dyn KeyFilter>,
        depth_bound: usize,
    ) -> Result<TreeCursor<'a>> {
        self.exchange.traverse(start, direction, filter, depth_bound)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("volume", &self.volume)
            .field("ts", &self.ts)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Segment;
    use crate::config::EngineConfig;
    use std::sync::Arc as StdArc;
    use tempfile::tempdir;

    fn test_engine(dir: &std::path::Path) -> StdArc<Engine> {
        let volume_path = dir.join("vtest.v01");
        let mut config = EngineConfig::benchmark();
        config.data_path = dir.to_path_buf();
        config.journal_path = dir.join("journal");
        config.volume_specs = vec![format!("{},create,pageSize:4096", volume_path.display())];
        Engine::open(config).unwrap()
    }

    #[test]
    fn commit_makes_a_write_visible_to_a_later_transaction() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let volume = engine.volume_ids()[0];

        let txn = Transaction::begin(engine.clone(), volume).unwrap();
        let ex = txn.exchange("accounts", true).unwrap();
        ex.store(Key::encode(&[Segment::Str("alice".into())]), b"100".to_vec()).unwrap();
        txn.commit().unwrap();

        let txn2 = Transaction::begin(engine.clone(), volume).unwrap();
        let ex2 = txn2.exchange("accounts", false).unwrap();
        let value = ex2.fetch(&Key::encode(&[Segment::Str("alice".into())])).unwrap();
        assert_eq!(value, Some(b"100".to_vec()));
        txn2.commit().unwrap();
    }

    #[test]
    fn rollback_discards_the_write() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let volume = engine.volume_ids()[0];

        let txn = Transaction::begin(engine.clone(), volume).unwrap();
        let ex = txn.exchange("accounts", true).unwrap();
        ex.store(Key::encode(&[Segment::Str("bob".into())]), b"5".to_vec()).unwrap();
        txn.rollback().unwrap();

        let txn2 = Transaction::begin(engine.clone(), volume).unwrap();
        let ex2 = txn2.exchange("accounts", false).unwrap();
        let value = ex2.fetch(&Key::encode(&[Segment::Str("bob".into())])).unwrap();
        assert_eq!(value, None);
        txn2.commit().unwrap();
    }

    #[test]
    #[should_panic(expected = "dropped without commit or rollback")]
    fn dropping_an_unfinished_transaction_panics() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let volume = engine.volume_ids()[0];
        let txn = Transaction::begin(engine, volume).unwrap();
        drop(txn);
    }
}
