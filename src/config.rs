//! Engine-wide configuration: buffer sizing, journal policy, and timeouts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How aggressively the journal writer fsyncs committed records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// fsync after every commit.
    Full,
    /// fsync on a timer / checkpoint boundary, not every commit.
    Checkpoint,
    /// Coalesce concurrent commits into batched fsyncs (group commit).
    GroupCommit,
    /// Never fsync explicitly; rely on OS buffering (benchmarking only).
    Off,
}

/// Coalescing knobs for the background journal-commit writer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GroupCommitConfig {
    /// Maximum number of queued commit requests folded into one batch.
    pub max_batch_commits: usize,
    /// Maximum number of frames appended in one batch before forcing a flush.
    pub max_batch_frames: usize,
    /// Maximum time the writer waits for more requests before committing what it has.
    pub max_batch_wait: Duration,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            max_batch_commits: 32,
            max_batch_frames: 512,
            max_batch_wait: Duration::from_millis(2),
        }
    }
}

/// Top-level tunables for an open engine instance.
///
/// Maps onto the environment property set: buffer counts per page size,
/// volume specifications, data directory, journal path/block size,
/// checkpoint interval, and timeouts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding volume files and the journal, if not overridden per-volume.
    pub data_path: PathBuf,
    /// Directory holding journal files.
    pub journal_path: PathBuf,
    /// Filename prefix shared by every journal generation file.
    pub journal_prefix: String,
    /// Target size of one journal file before rollover.
    pub journal_block_size: u64,
    /// Volume specification strings (`volume.0`, `volume.1`, ... in the
    /// environment property set), opened in order at engine startup.
    pub volume_specs: Vec<String>,
    /// Buffer pool frame count, keyed by page size in bytes.
    pub buffer_counts: BTreeMap<u32, usize>,
    /// Default page size used when a volume spec omits `pageSize`.
    pub default_page_size: u32,
    /// How the journal writer fsyncs.
    pub sync_mode: SyncMode,
    /// Group-commit coalescing policy, used when `sync_mode` is `GroupCommit`.
    pub group_commit: GroupCommitConfig,
    /// Interval between automatic checkpoints.
    pub checkpoint_interval: Duration,
    /// Interval between cleanup-queue polls.
    pub cleanup_interval: Duration,
    /// Interval between transaction-index active-cache refreshes.
    pub active_cache_refresh_interval: Duration,
    /// Deadline for a buffer-pool claim (reader or writer) or a wwLock wait.
    pub claim_timeout: Duration,
    /// Deadline for file I/O before treating the underlying channel as failed.
    pub io_timeout: Duration,
    /// Number of buckets in the transaction index (`ts mod buckets`).
    pub transaction_index_buckets: usize,
    /// Bound on the cleanup manager's deferred-action queue.
    pub cleanup_queue_capacity: usize,
    /// Whether page checksums are verified on every read.
    pub checksum_verify_on_read: bool,
    /// Whether the pager may use a memory-mapped read path (requires the `mmap` feature).
    pub use_mmap: bool,
    /// Resolution to the open question of flushing the TX (rollback) record
    /// synchronously before returning control to the caller. `true` costs an
    /// extra fsync per abort but guarantees an aborted transaction's writes
    /// can never be resurrected by recovery; `false` relies solely on the
    /// live-transaction map filtering the transaction out during replay.
    pub rollback_flush_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut buffer_counts = BTreeMap::new();
        buffer_counts.insert(4096, 4096);
        buffer_counts.insert(8192, 2048);
        buffer_counts.insert(16384, 1024);

        Self {
            data_path: PathBuf::from("."),
            journal_path: PathBuf::from("./journal"),
            journal_prefix: "heartwood".to_string(),
            journal_block_size: 64 * 1024 * 1024,
            volume_specs: Vec::new(),
            buffer_counts,
            default_page_size: 8192,
            sync_mode: SyncMode::GroupCommit,
            group_commit: GroupCommitConfig::default(),
            checkpoint_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_millis(500),
            active_cache_refresh_interval: Duration::from_millis(200),
            claim_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(30),
            transaction_index_buckets: 64,
            cleanup_queue_capacity: 10_000,
            checksum_verify_on_read: true,
            use_mmap: false,
            rollback_flush_sync: true,
        }
    }
}

impl EngineConfig {
    /// A conservative, fully-durable preset: fsync every commit and every rollback.
    pub fn durable() -> Self {
        Self {
            sync_mode: SyncMode::Full,
            rollback_flush_sync: true,
            checkpoint_interval: Duration::from_secs(15),
            ..Self::default()
        }
    }

    /// A balanced preset suitable for most production embeddings: group commit
    /// with synchronous rollback flush.
    pub fn production() -> Self {
        Self {
            sync_mode: SyncMode::GroupCommit,
            rollback_flush_sync: true,
            claim_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Maximizes throughput at the cost of durability guarantees: checksums and
    /// the rollback-record fsync are both disabled. Not suitable for anything
    /// that must survive a crash.
    pub fn benchmark() -> Self {
        let mut buffer_counts = BTreeMap::new();
        buffer_counts.insert(4096, 65536);
        buffer_counts.insert(8192, 32768);
        buffer_counts.insert(16384, 16384);

        Self {
            sync_mode: SyncMode::Off,
            rollback_flush_sync: false,
            checksum_verify_on_read: false,
            buffer_counts,
            claim_timeout: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Loads configuration from a TOML file, falling back to `Default` for any
    /// field the file omits.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::InvalidVolumeSpec(format!("bad config: {e}")))
    }

    /// Resolves the platform-default data directory when `data_path` is left
    /// at its default value of `.`.
    pub fn resolve_data_path(&self) -> PathBuf {
        if self.data_path == PathBuf::from(".") {
            dirs::data_dir()
                .map(|d| d.join("heartwood"))
                .unwrap_or_else(|| self.data_path.clone())
        } else {
            self.data_path.clone()
        }
    }

    /// Buffer frame count configured for `page_size`, or a sane default.
    pub fn buffer_count_for(&self, page_size: u32) -> usize {
        self.buffer_counts.get(&page_size).copied().unwrap_or(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_differ_in_durability_tradeoffs() {
        let durable = EngineConfig::durable();
        let bench = EngineConfig::benchmark();
        assert_eq!(durable.sync_mode, SyncMode::Full);
        assert_eq!(bench.sync_mode, SyncMode::Off);
        assert!(durable.rollback_flush_sync);
        assert!(!bench.rollback_flush_sync);
        assert!(bench.buffer_count_for(8192) > durable.buffer_count_for(8192));
    }

    #[test]
    fn buffer_count_for_unconfigured_size_has_a_default() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.buffer_count_for(1024), 1024);
    }
}
