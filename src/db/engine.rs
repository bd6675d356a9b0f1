//! The engine root: opens volumes, recovers from the journal, and wires the
//! buffer pool, transaction index, journal, and cleanup manager into one
//! handle. Every other public entry point (`Transaction`, backup, the CLI)
//! is built on top of an `Arc<Engine>`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::buffer::{BufferPool, PageJournal};
use crate::cleanup::{Action, CleanupHost, CleanupManager};
use crate::config::EngineConfig;
use crate::db::directory;
use crate::error::{Error, Result};
use crate::journal::{self, Journal};
use crate::mvcc::{TimestampAllocator, TransactionIndex};
use crate::tree::Tree;
use crate::types::{Timestamp, VolumeId};
use crate::volume::spec::VolumeSpecification;
use crate::volume::Volume;

/// Everything the engine keeps about one open volume: the volume itself, its
/// bootstrap directory tree, the next handle to mint for a new tree, and the
/// trees already opened from it.
struct VolumeContext {
    volume: Arc<Volume>,
    spec: VolumeSpecification,
    directory: Arc<Tree>,
    next_handle: AtomicU32,
    trees: Mutex<HashMap<String, Arc<Tree>>>,
}

/// An open database: volumes, journal, buffer pool, transaction index, and
/// the background workers (checkpointer, cleanup) that keep them converging.
/// Cloned as `Arc<Engine>`; every subsystem reaches the engine only through
/// the `CleanupHost` seam, never by holding a strong reference back to it.
pub struct Engine {
    config: EngineConfig,
    ts_alloc: TimestampAllocator,
    txn_index: Arc<TransactionIndex>,
    pool: Arc<BufferPool>,
    journal: Arc<Journal>,
    cleanup: Arc<CleanupManager>,
    volumes: RwLock<HashMap<VolumeId, VolumeContext>>,
    volumes_by_name: RwLock<HashMap<String, VolumeId>>,
    shutdown: Arc<AtomicBool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    fatal: AtomicBool,
    fatal_errors: AtomicU64,
    self_weak: Weak<Engine>,
    data_path: PathBuf,
    journal_dir: PathBuf,
}

const FATAL_ERROR_THRESHOLD: u64 = 8;

impl Engine {
    /// Recovers the journal, opens every volume named in `config.volume_specs`,
    /// and starts the background checkpoint and cleanup workers.
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        crate::logging::init();

        let data_path = config.resolve_data_path();
        fs::create_dir_all(&data_path)?;

        let journal_dir = if config.journal_path.is_relative() {
            resolve_under(&data_path, &config.journal_path)
        } else {
            config.journal_path.clone()
        };

        let outcome = journal::recover(&journal_dir, &config.journal_prefix)?;
        info!(
            applied_pages = outcome.applied_pages.len(),
            max_timestamp_seen = outcome.max_timestamp_seen,
            "engine.recovery_complete"
        );

        let ts_alloc = TimestampAllocator::new(0);
        ts_alloc.observe(outcome.max_timestamp_seen);

        let mut volumes = HashMap::new();
        let mut volume_specs = HashMap::new();
        let mut volumes_by_name = HashMap::new();
        for spec_str in &config.volume_specs {
            let mut spec = VolumeSpecification::parse(spec_str)?;
            if spec.path.is_relative() {
                spec.path = resolve_under(&data_path, &spec.path);
            }
            let id = crate::volume::new_volume_id();
            let volume = Arc::new(Volume::open(&spec, id, ts_alloc.next())?);
            volumes_by_name.insert(volume.name().to_string(), volume.id());
            volume_specs.insert(volume.id(), spec);
            volumes.insert(volume.id(), volume);
        }

        for (volume_id, page, bytes) in &outcome.applied_pages {
            match volumes.get(volume_id) {
                Some(volume) => volume.write_page(*page, bytes)?,
                None => warn!(?volume_id, ?page, "engine.recovered_page_for_unknown_volume"),
            }
        }

        let journal = Arc::new(Journal::open(
            &journal_dir,
            &config.journal_prefix,
            config.journal_block_size,
            config.sync_mode,
            config.group_commit,
        )?);

        let pool_capacity: usize = config.buffer_counts.values().sum::<usize>().max(1);
        let pool = Arc::new(BufferPool::new(
            pool_capacity,
            journal.clone() as Arc<dyn PageJournal>,
            config.claim_timeout,
        ));
        for volume in volumes.values() {
            pool.register_volume(volume.clone());
            journal.bind_volume(volume_handle_stub(volume.id()), volume.id(), volume.name())?;
        }

        let txn_index = Arc::new(TransactionIndex::new(
            config.transaction_index_buckets as u32,
            config.claim_timeout,
        ));

        let cleanup = CleanupManager::new(config.cleanup_queue_capacity, config.cleanup_interval);

        let mut contexts = HashMap::new();
        for (id, volume) in volumes {
            let tree_directory = directory::open_directory(volume.clone(), pool.clone());
            let spec = volume_specs.remove(&id).expect("every opened volume has a spec");
            contexts.insert(
                id,
                VolumeContext {
                    volume,
                    spec,
                    directory: tree_directory,
                    next_handle: AtomicU32::new(0),
                    trees: Mutex::new(HashMap::new()),
                },
            );
        }

        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = Arc::new_cyclic(|weak_self: &Weak<Engine>| {
            let host: Weak<dyn CleanupHost> = weak_self.clone();
            cleanup.bind_host(host);
            cleanup.start();

            Engine {
                config,
                ts_alloc,
                txn_index,
                pool,
                journal,
                cleanup,
                volumes: RwLock::new(contexts),
                volumes_by_name: RwLock::new(volumes_by_name),
                shutdown: shutdown.clone(),
                background: Mutex::new(Vec::new()),
                fatal: AtomicBool::new(false),
                fatal_errors: AtomicU64::new(0),
                self_weak: weak_self.clone(),
                data_path,
                journal_dir,
            }
        });

        engine.spawn_checkpointer();
        Ok(engine)
    }

    fn spawn_checkpointer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.checkpoint_interval;
        let handle = thread::Builder::new()
            .name("heartwood-checkpointer".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(interval);
                    let Some(engine) = weak.upgrade() else { return };
                    if let Err(err) = engine.checkpoint() {
                        warn!(error = %err, "engine.checkpoint_failed");
                        engine.note_background_error();
                    }
                }
            })
            .expect("failed to spawn checkpoint thread");
        self.background.lock().push(handle);
    }

    /// `true` once an unrecoverable inconsistency has been observed; every
    /// subsequent public operation should fail fast rather than touch state
    /// that may already be corrupt.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    fn note_background_error(&self) {
        let count = self.fatal_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= FATAL_ERROR_THRESHOLD {
            self.fatal.store(true, Ordering::Release);
            warn!(count, "engine.fatal_threshold_reached");
        }
    }

    fn guard_fatal(&self) -> Result<()> {
        if self.is_fatal() {
            return Err(Error::Fatal("engine is in a fatal state".into()));
        }
        Ok(())
    }

    fn volume_context<'a>(
        &self,
        volumes: &'a HashMap<VolumeId, VolumeContext>,
        volume: VolumeId,
    ) -> Result<&'a VolumeContext> {
        volumes
            .get(&volume)
            .ok_or_else(|| Error::InvalidVolumeSpec(format!("no such volume {volume:?}")))
    }

    /// Resolves a volume by its configured name.
    pub fn volume_id(&self, name: &str) -> Result<VolumeId> {
        self.volumes_by_name
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidVolumeSpec(format!("no such volume '{name}'")))
    }

    /// Every configured volume's id, in open order.
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.volumes.read().keys().copied().collect()
    }

    /// Directory data files resolve under, absent an explicit absolute path.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Directory the journal's generation files live in.
    pub fn journal_dir(&self) -> &Path {
        &self.journal_dir
    }

    /// The specification a volume was opened with (its path already resolved
    /// to an absolute one), for backup and `dump`/`stat` reporting.
    pub fn volume_spec(&self, volume: VolumeId) -> Result<VolumeSpecification> {
        let volumes = self.volumes.read();
        Ok(self.volume_context(&volumes, volume)?.spec.clone())
    }

    /// Path to a volume's backing file.
    pub fn volume_path(&self, volume: VolumeId) -> Result<PathBuf> {
        let volumes = self.volumes.read();
        Ok(self.volume_context(&volumes, volume)?.volume.path().to_path_buf())
    }

    /// Allocation counters for a volume, for `stat`/`icheck` reporting.
    pub fn volume_stats(&self, volume: VolumeId) -> Result<crate::volume::VolumeStats> {
        let volumes = self.volumes.read();
        Ok(self.volume_context(&volumes, volume)?.volume.stats())
    }

    /// Highest page address a volume has handed out plus its configured
    /// maximum, for `icheck`'s bounds check.
    pub fn volume_committed_pages(&self, volume: VolumeId) -> Result<(u64, u64)> {
        let volumes = self.volumes.read();
        let ctx = self.volume_context(&volumes, volume)?;
        Ok((ctx.volume.committed_pages(), ctx.volume.maximum_pages()))
    }

    /// Opens (creating, if `create`, a fresh zero-root entry) the named tree
    /// within `volume`.
    pub fn open_tree(&self, volume: VolumeId, name: &str, create: bool) -> Result<Arc<Tree>> {
        self.guard_fatal()?;
        let volumes = self.volumes.read();
        let ctx = self.volume_context(&volumes, volume)?;

        if let Some(tree) = ctx.trees.lock().get(name) {
            return Ok(tree.clone());
        }

        let now = self.ts_alloc.current();
        let record = directory::lookup_or_create(&ctx.directory, name, create, &ctx.next_handle, now)?
            .ok_or_else(|| Error::InvalidVolumeSpec(format!("no such tree '{name}'")))?;

        self.journal.bind_tree(record.handle.0, volume_handle_stub(volume), name)?;

        let now_source: Arc<dyn Fn() -> Timestamp + Send + Sync> = {
            let engine = self.self_weak.clone();
            Arc::new(move || engine.upgrade().map(|e| e.ts_alloc.current()).unwrap_or(0))
        };
        let sink = directory::directory_sink(ctx.directory.clone(), name.to_string(), record.handle, now_source);
        let tree = Arc::new(Tree::new(
            name.to_string(),
            record.handle,
            record.root,
            record.depth,
            ctx.volume.clone(),
            self.pool.clone(),
            sink,
        ));
        for (kind, index, base_value, base_as_of) in &record.accumulators {
            tree.install_accumulator(*kind, *index, *base_value, *base_as_of);
        }
        ctx.trees.lock().insert(name.to_string(), tree.clone());
        Ok(tree)
    }

    /// Removes a tree entirely: drops its directory entry and schedules its
    /// pages for reclamation.
    pub fn remove_tree(&self, volume: VolumeId, name: &str) -> Result<bool> {
        self.guard_fatal()?;
        let volumes = self.volumes.read();
        let ctx = self.volume_context(&volumes, volume)?;
        let now = self.ts_alloc.current();

        let Some(record) = directory::lookup_or_create(&ctx.directory, name, false, &ctx.next_handle, now)? else {
            return Ok(false);
        };

        self.journal.log_remove_tree(self.ts_alloc.next(), record.handle.0)?;
        directory::remove_record(&ctx.directory, name, now)?;
        ctx.trees.lock().remove(name);
        self.cleanup.enqueue(Action::CompactDirectory { volume });
        Ok(true)
    }

    /// Every tree name currently bound in `volume`'s directory.
    pub fn tree_names(&self, volume: VolumeId) -> Result<Vec<String>> {
        let volumes = self.volumes.read();
        let ctx = self.volume_context(&volumes, volume)?;
        directory::list_names(&ctx.directory, self.ts_alloc.current())
    }

    pub(crate) fn ts_alloc(&self) -> &TimestampAllocator {
        &self.ts_alloc
    }

    pub(crate) fn txn_index(&self) -> &Arc<TransactionIndex> {
        &self.txn_index
    }

    pub(crate) fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn cleanup(&self) -> &Arc<CleanupManager> {
        &self.cleanup
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Allocates a checkpoint timestamp, flushes every dirty buffer at or
    /// before it, persists each tree's reconciled accumulator state and root,
    /// and journals a CP record.
    pub fn checkpoint(&self) -> Result<Timestamp> {
        self.guard_fatal()?;
        let ts = self.ts_alloc.next();
        self.pool.flush(ts)?;

        let volumes = self.volumes.read();
        for ctx in volumes.values() {
            let names: Vec<String> = ctx.trees.lock().keys().cloned().collect();
            for name in names {
                let tree = ctx.trees.lock().get(&name).cloned();
                let Some(tree) = tree else { continue };
                let accumulators = tree.reconcile_accumulators(ts);
                directory::persist_tree_state(
                    &ctx.directory,
                    &name,
                    tree.root_page(),
                    tree.depth(),
                    accumulators,
                    ts,
                )?;
            }
            ctx.volume.flush_head()?;
        }

        let base_address = self.journal.current_address();
        self.journal.checkpoint(ts, base_address)?;
        info!(ts, "engine.checkpoint_complete");
        Ok(ts)
    }

    /// Blocks until every background worker has stopped. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cleanup.shutdown();
        for handle in self.background.lock().drain(..) {
            let _ = handle.join();
        }
        self.journal.shutdown();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CleanupHost for Engine {
    fn run_cleanup_action(&self, action: &Action) -> Result<()> {
        match action {
            Action::PruneMvv { volume, tree, key: _ } | Action::DeferredJoin { volume, tree, .. } => {
                let volumes = self.volumes.read();
                let ctx = self.volume_context(&volumes, *volume)?;
                let tree_name = ctx
                    .trees
                    .lock()
                    .iter()
                    .find(|(_, t)| t.handle() == *tree)
                    .map(|(name, _)| name.clone());
                if let Some(name) = tree_name {
                    if let Some(tree) = ctx.trees.lock().get(&name).cloned() {
                        let now = self.ts_alloc.current();
                        tree.compact(&self.txn_index, now)?;
                    }
                }
                Ok(())
            }
            Action::DeallocatePage { volume, page } => {
                let volumes = self.volumes.read();
                let ctx = self.volume_context(&volumes, *volume)?;
                ctx.volume.free_page(*page);
                Ok(())
            }
            Action::CompactDirectory { volume } => {
                let volumes = self.volumes.read();
                let ctx = self.volume_context(&volumes, *volume)?;
                let now = self.ts_alloc.current();
                ctx.directory.compact(&self.txn_index, now)?;
                Ok(())
            }
        }
    }
}

/// Tree handles are journaled per-volume, but volume handles (`IV` records)
/// are a separate 32-bit namespace than volume ids; recording is diagnostic
/// (physical PA replay is authoritative at recovery) so collapsing to the
/// volume id's low bits is sufficient addressing for IT records here.
fn volume_handle_stub(volume: VolumeId) -> u32 {
    volume.0 as u32
}

fn resolve_under(base: &Path, relative: &Path) -> PathBuf {
    base.join(relative)
}
