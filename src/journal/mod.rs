//! Write-ahead journal: framed, hash-chained records; a group-commit writer
//! thread; file rollover; and crash recovery.
//!
//! The journal is a sequence of generation files named
//! `<prefix>.NNNNNNNNNNNN` under `journal_path`. Every record is framed with
//! a type byte, a big-endian length, a timestamp, and a trailing checksum;
//! consecutive frames additionally chain a running digest of everything
//! written so far, so a torn write at the tail of the active file reads back
//! as "nothing valid past here" instead of a hard corruption error.
//!
//! Recovery performs physical redo only: every mutation that changes a page
//! produces a PA (page image) record before the page is ever written to its
//! volume slot, so replaying PA records after the last checkpoint is
//! sufficient to restore the volume set to its pre-crash state. The logical
//! SR/DR/DT records are retained for diagnostic replay (the `dump` CLI
//! command) but recovery itself never re-applies them — doing so would
//! double-apply an operation whose page effects are already covered by a PA
//! record.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::buffer::PageJournal;
use crate::checksum::chained_crc32;
use crate::config::{GroupCommitConfig, SyncMode};
use crate::error::{Error, Result};
use crate::types::{JournalAddress, PageId, Timestamp, VolumeId};

const FRAME_PREFIX_LEN: usize = 1 + 4 + 8 + 8; // type, len, timestamp, prev-chain digest
const FRAME_TRAILER_LEN: usize = 4; // crc32

/// One logical journal record. The variant determines the payload encoding;
/// the outer frame (type byte, length, timestamp, chain digest, crc32) is
/// identical for every kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// Journal-file header: prefix, block size, generation, base address, and
    /// the live-transaction map carried forward from the previous file.
    Jh {
        generation: u64,
        base_address: JournalAddress,
        live_transactions: Vec<Timestamp>,
    },
    /// Binds a volume handle to a volume id and name.
    Iv { handle: u32, volume_id: VolumeId, name: String },
    /// Binds a tree handle to (volume handle, tree name).
    It { handle: u32, volume_handle: u32, tree_name: String },
    /// A page image as of `timestamp`, split at `left_len` (header + key
    /// blocks) / `right_len` (tail heap) for diagnostic purposes.
    Pa {
        volume: VolumeId,
        page: PageId,
        timestamp: Timestamp,
        left_len: u32,
        right_len: u32,
        bytes: Vec<u8>,
    },
    /// Transaction start.
    Ts { ts: Timestamp },
    /// Transaction commit.
    Tc { ts: Timestamp, tc: Timestamp },
    /// Transaction rollback.
    Tx { ts: Timestamp },
    /// Logical store, for diagnostics only (see module docs).
    Sr {
        ts: Timestamp,
        tree_handle: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Logical delete-range, for diagnostics only.
    Dr {
        ts: Timestamp,
        tree_handle: u32,
        key1: Vec<u8>,
        key2: Vec<u8>,
    },
    /// Tree removal.
    Dt { ts: Timestamp, tree_handle: u32 },
    /// Checkpoint: timestamp and the journal address that is now the
    /// earliest one recovery still needs to examine.
    Cp { ts: Timestamp, base_address: JournalAddress },
}

impl Record {
    fn type_byte(&self) -> u8 {
        match self {
            Record::Jh { .. } => b'H',
            Record::Iv { .. } => b'V',
            Record::It { .. } => b'T',
            Record::Pa { .. } => b'P',
            Record::Ts { .. } => b's',
            Record::Tc { .. } => b'c',
            Record::Tx { .. } => b'x',
            Record::Sr { .. } => b'r',
            Record::Dr { .. } => b'd',
            Record::Dt { .. } => b't',
            Record::Cp { .. } => b'K',
        }
    }

    /// Timestamp carried in the frame header. Structural records that have no
    /// natural timestamp use 0.
    fn timestamp(&self) -> Timestamp {
        match self {
            Record::Jh { .. } | Record::Iv { .. } | Record::It { .. } => 0,
            Record::Pa { timestamp, .. } => *timestamp,
            Record::Ts { ts } | Record::Tx { ts } | Record::Dt { ts, .. } => *ts,
            Record::Tc { ts, .. } => *ts,
            Record::Sr { ts, .. } | Record::Dr { ts, .. } => *ts,
            Record::Cp { ts, .. } => *ts,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Record::Jh {
                generation,
                base_address,
                live_transactions,
            } => {
                out.extend_from_slice(&generation.to_be_bytes());
                out.extend_from_slice(&base_address.0.to_be_bytes());
                out.extend_from_slice(&(live_transactions.len() as u32).to_be_bytes());
                for ts in live_transactions {
                    out.extend_from_slice(&ts.to_be_bytes());
                }
            }
            Record::Iv { handle, volume_id, name } => {
                out.extend_from_slice(&handle.to_be_bytes());
                out.extend_from_slice(&volume_id.0.to_be_bytes());
                write_str(&mut out, name);
            }
            Record::It { handle, volume_handle, tree_name } => {
                out.extend_from_slice(&handle.to_be_bytes());
                out.extend_from_slice(&volume_handle.to_be_bytes());
                write_str(&mut out, tree_name);
            }
            Record::Pa {
                volume,
                page,
                timestamp: _,
                left_len,
                right_len,
                bytes,
            } => {
                out.extend_from_slice(&volume.0.to_be_bytes());
                out.extend_from_slice(&page.0.to_be_bytes());
                out.extend_from_slice(&left_len.to_be_bytes());
                out.extend_from_slice(&right_len.to_be_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Record::Ts { .. } => {}
            Record::Tc { ts: _, tc } => out.extend_from_slice(&tc.to_be_bytes()),
            Record::Tx { .. } => {}
            Record::Sr { ts: _, tree_handle, key, value } => {
                out.extend_from_slice(&tree_handle.to_be_bytes());
                write_bytes(&mut out, key);
                write_bytes(&mut out, value);
            }
            Record::Dr { ts: _, tree_handle, key1, key2 } => {
                out.extend_from_slice(&tree_handle.to_be_bytes());
                write_bytes(&mut out, key1);
                write_bytes(&mut out, key2);
            }
            Record::Dt { ts: _, tree_handle } => out.extend_from_slice(&tree_handle.to_be_bytes()),
            Record::Cp { ts: _, base_address } => out.extend_from_slice(&base_address.0.to_be_bytes()),
        }
        out
    }

    fn decode(type_byte: u8, ts: Timestamp, payload: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(payload);
        Ok(match type_byte {
            b'H' => {
                let generation = r.u64()?;
                let base_address = JournalAddress(r.u64()?);
                let count = r.u32()? as usize;
                let mut live_transactions = Vec::with_capacity(count);
                for _ in 0..count {
                    live_transactions.push(r.u64()?);
                }
                Record::Jh { generation, base_address, live_transactions }
            }
            b'V' => {
                let handle = r.u32()?;
                let volume_id = VolumeId(r.u64()?);
                let name = r.str()?;
                Record::Iv { handle, volume_id, name }
            }
            b'T' => {
                let handle = r.u32()?;
                let volume_handle = r.u32()?;
                let tree_name = r.str()?;
                Record::It { handle, volume_handle, tree_name }
            }
            b'P' => {
                let volume = VolumeId(r.u64()?);
                let page = PageId(r.u64()?);
                let left_len = r.u32()?;
                let right_len = r.u32()?;
                let bytes = r.bytes()?;
                Record::Pa { volume, page, timestamp: ts, left_len, right_len, bytes }
            }
            b's' => Record::Ts { ts },
            b'c' => {
                let tc = r.u64()?;
                Record::Tc { ts, tc }
            }
            b'x' => Record::Tx { ts },
            b'r' => {
                let tree_handle = r.u32()?;
                let key = r.bytes()?;
                let value = r.bytes()?;
                Record::Sr { ts, tree_handle, key, value }
            }
            b'd' => {
                let tree_handle = r.u32()?;
                let key1 = r.bytes()?;
                let key2 = r.bytes()?;
                Record::Dr { ts, tree_handle, key1, key2 }
            }
            b't' => {
                let tree_handle = r.u32()?;
                Record::Dt { ts, tree_handle }
            }
            b'K' => {
                let base_address = JournalAddress(r.u64()?);
                Record::Cp { ts, base_address }
            }
            other => return Err(Error::CorruptJournal(format!("unknown record type {other:#x}"))),
        })
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_bytes(out, s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
    out.extend_from_slice(b);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::CorruptJournal("record payload truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn str(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| Error::CorruptJournal("non-utf8 string in record".into()))
    }
}

fn next_chain_digest(prev_digest: u64, crc: u32) -> u64 {
    chained_crc32(&[&prev_digest.to_be_bytes(), &crc.to_be_bytes()]) as u64
}

fn encode_frame(record: &Record, prev_digest: u64) -> (Vec<u8>, u64) {
    let payload = record.encode_payload();
    let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN + payload.len() + FRAME_TRAILER_LEN);
    buf.push(record.type_byte());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&record.timestamp().to_be_bytes());
    buf.extend_from_slice(&prev_digest.to_be_bytes());
    buf.extend_from_slice(&payload);
    let crc = chained_crc32(&[&buf]);
    buf.extend_from_slice(&crc.to_be_bytes());
    let next_digest = next_chain_digest(prev_digest, crc);
    (buf, next_digest)
}

fn decode_frame(bytes: &[u8]) -> Result<(Record, u64, usize)> {
    if bytes.len() < FRAME_PREFIX_LEN {
        return Err(Error::CorruptJournal("frame header truncated".into()));
    }
    let type_byte = bytes[0];
    let len = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
    let ts = u64::from_be_bytes(bytes[5..13].try_into().unwrap());
    let prev_digest = u64::from_be_bytes(bytes[13..21].try_into().unwrap());
    let total = FRAME_PREFIX_LEN + len + FRAME_TRAILER_LEN;
    if bytes.len() < total {
        return Err(Error::CorruptJournal("frame payload truncated".into()));
    }
    let payload = &bytes[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + len];
    let stored_crc = u32::from_be_bytes(
        bytes[FRAME_PREFIX_LEN + len..total].try_into().unwrap(),
    );
    let computed_crc = chained_crc32(&[&bytes[..FRAME_PREFIX_LEN + len]]);
    if stored_crc != computed_crc {
        return Err(Error::CorruptJournal("frame checksum mismatch".into()));
    }
    let next_digest = next_chain_digest(prev_digest, stored_crc);
    let record = Record::decode(type_byte, ts, payload)?;
    Ok((record, next_digest, total))
}

fn segment_path(dir: &Path, prefix: &str, generation: u64) -> PathBuf {
    dir.join(format!("{prefix}.{generation:012}"))
}

fn list_generations(dir: &Path, prefix: &str) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(rest) = name.strip_prefix(&format!("{prefix}.")) {
                if let Ok(gen) = rest.parse::<u64>() {
                    out.push(gen);
                }
            }
        }
    }
    out.sort_unstable();
    Ok(out)
}

struct CommitRequest {
    records: Vec<Record>,
    durable: bool,
    result: Arc<(Mutex<Option<Result<JournalAddress>>>, Condvar)>,
}

struct WriterShared {
    dir: PathBuf,
    prefix: String,
    block_size: u64,
    file: Mutex<File>,
    generation: AtomicU64,
    global_offset: AtomicU64,
    digest: Mutex<u64>,
    live_transactions: Mutex<HashMap<Timestamp, bool>>,
    page_map: Mutex<HashMap<(VolumeId, PageId), (JournalAddress, Timestamp)>>,
    stats: JournalStats,
}

/// Running counters surfaced to `stat`.
#[derive(Default, Debug)]
pub struct JournalStats {
    pub frames_appended: AtomicU64,
    pub bytes_appended: AtomicU64,
    pub syncs: AtomicU64,
    pub coalesced_batches: AtomicU64,
    pub rollovers: AtomicU64,
}

/// Write-ahead journal manager: the durable record of every page mutation
/// and transaction boundary, grouped into generation files and flushed by a
/// single background writer thread.
pub struct Journal {
    shared: Arc<WriterShared>,
    sender: mpsc::Sender<CommitRequest>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<parking_lot::Mutex<bool>>,
    sync_mode: SyncMode,
    group_commit: GroupCommitConfig,
}

impl Journal {
    /// Opens (creating if necessary) the journal directory and starts the
    /// background writer thread.
    pub fn open(
        dir: &Path,
        prefix: &str,
        block_size: u64,
        sync_mode: SyncMode,
        group_commit: GroupCommitConfig,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut generations = list_generations(dir, prefix)?;
        let (generation, file, global_offset) = if let Some(last) = generations.pop() {
            let path = segment_path(dir, prefix, last);
            let file = OpenOptions::new().append(true).read(true).open(&path)?;
            let len = file.metadata()?.len();
            (last, file, generation_base_offset(last, block_size) + len)
        } else {
            let path = segment_path(dir, prefix, 0);
            let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
            (0, file, 0)
        };

        let shared = Arc::new(WriterShared {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            block_size,
            file: Mutex::new(file),
            generation: AtomicU64::new(generation),
            global_offset: AtomicU64::new(global_offset),
            digest: Mutex::new(0),
            live_transactions: Mutex::new(HashMap::new()),
            page_map: Mutex::new(HashMap::new()),
            stats: JournalStats::default(),
        });

        let (sender, receiver) = mpsc::channel();
        let shutdown = Arc::new(parking_lot::Mutex::new(false));
        let thread_shared = shared.clone();
        let thread_shutdown = shutdown.clone();
        let batch_cfg = group_commit;
        let thread_sync_mode = sync_mode;
        let writer_thread = thread::Builder::new()
            .name("heartwood-journal-writer".into())
            .spawn(move || {
                writer_loop(thread_shared, receiver, thread_shutdown, batch_cfg, thread_sync_mode)
            })
            .map_err(|e| Error::Fatal(format!("failed to spawn journal writer thread: {e}")))?;

        Ok(Self {
            shared,
            sender,
            writer_thread: Mutex::new(Some(writer_thread)),
            shutdown,
            sync_mode,
            group_commit,
        })
    }

    /// Appends a single record, waiting for the group-commit writer to
    /// durably append it (and fsync, if `force_sync` or the configured sync
    /// mode demands it for every commit).
    pub fn append(&self, record: Record, force_sync: bool) -> Result<JournalAddress> {
        let durable = force_sync || matches!(self.sync_mode, SyncMode::Full);
        let result = Arc::new((Mutex::new(None), Condvar::new()));
        self.sender
            .send(CommitRequest { records: vec![record], durable, result: result.clone() })
            .map_err(|_| Error::Fatal("journal writer thread is gone".into()))?;

        let (lock, cvar) = &*result;
        let mut guard = lock.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        guard.take().unwrap()
    }

    /// Registers a transaction as live (used to build each file's JH
    /// live-transaction map).
    pub fn begin(&self, ts: Timestamp) -> Result<()> {
        self.shared.live_transactions.lock().insert(ts, true);
        self.append(Record::Ts { ts }, false).map(|_| ())
    }

    /// Marks a transaction committed and journals the TC record.
    pub fn commit(&self, ts: Timestamp, tc: Timestamp) -> Result<()> {
        self.append(Record::Tc { ts, tc }, matches!(self.sync_mode, SyncMode::Full | SyncMode::GroupCommit))?;
        self.shared.live_transactions.lock().remove(&ts);
        Ok(())
    }

    /// Marks a transaction aborted and journals the TX record. `force_sync`
    /// implements `EngineConfig::rollback_flush_sync`.
    pub fn rollback(&self, ts: Timestamp, force_sync: bool) -> Result<()> {
        self.append(Record::Tx { ts }, force_sync)?;
        self.shared.live_transactions.lock().remove(&ts);
        Ok(())
    }

    /// Journals a checkpoint record.
    pub fn checkpoint(&self, ts: Timestamp, base_address: JournalAddress) -> Result<()> {
        self.append(Record::Cp { ts, base_address }, true).map(|_| ())
    }

    /// Journals a logical store, for diagnostic replay only.
    pub fn log_store(&self, ts: Timestamp, tree_handle: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(
            Record::Sr { ts, tree_handle, key: key.to_vec(), value: value.to_vec() },
            false,
        )
        .map(|_| ())
    }

    /// Journals a logical delete-range, for diagnostic replay only.
    pub fn log_delete_range(&self, ts: Timestamp, tree_handle: u32, key1: &[u8], key2: &[u8]) -> Result<()> {
        self.append(
            Record::Dr { ts, tree_handle, key1: key1.to_vec(), key2: key2.to_vec() },
            false,
        )
        .map(|_| ())
    }

    /// Journals a tree-removal record.
    pub fn log_remove_tree(&self, ts: Timestamp, tree_handle: u32) -> Result<()> {
        self.append(Record::Dt { ts, tree_handle }, false).map(|_| ())
    }

    /// Binds a volume handle, so recovery and dump tooling can resolve PA
    /// records back to a volume name.
    pub fn bind_volume(&self, handle: u32, volume_id: VolumeId, name: &str) -> Result<()> {
        self.append(Record::Iv { handle, volume_id, name: name.to_string() }, false).map(|_| ())
    }

    /// Binds a tree handle to its volume handle and name.
    pub fn bind_tree(&self, handle: u32, volume_handle: u32, tree_name: &str) -> Result<()> {
        self.append(
            Record::It { handle, volume_handle, tree_name: tree_name.to_string() },
            false,
        )
        .map(|_| ())
    }

    /// Current write position, i.e. the address the next appended frame will
    /// occupy.
    pub fn current_address(&self) -> JournalAddress {
        JournalAddress(self.shared.global_offset.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> &JournalStats {
        &self.shared.stats
    }

    /// Stops the writer thread, flushing any queued frames first.
    pub fn shutdown(&self) {
        *self.shutdown.lock() = true;
        // Wake the writer by sending a zero-frame flush request it can drop.
        let result = Arc::new((Mutex::new(None), Condvar::new()));
        let _ = self.sender.send(CommitRequest { records: vec![], durable: false, result });
        if let Some(handle) = self.writer_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PageJournal for Journal {
    fn write_page_image(
        &self,
        volume: VolumeId,
        page_no: PageId,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> Result<()> {
        let (left_len, right_len) = split_lengths(bytes);
        let address = self.append(
            Record::Pa {
                volume,
                page: page_no,
                timestamp,
                left_len,
                right_len,
                bytes: bytes.to_vec(),
            },
            matches!(self.sync_mode, SyncMode::Full),
        )?;

        let mut page_map = self.shared.page_map.lock();
        let key = (volume, page_no);
        if let Some((_, prev_ts)) = page_map.get(&key) {
            if timestamp < *prev_ts {
                return Err(Error::Fatal(format!(
                    "journal page-map timestamp regression for {volume:?}/{page_no}: {timestamp} < {prev_ts}"
                )));
            }
        }
        page_map.insert(key, (address, timestamp));
        Ok(())
    }
}

fn split_lengths(bytes: &[u8]) -> (u32, u32) {
    match crate::volume::page::PageHeader::decode(bytes) {
        Ok(header) => {
            let tail_start = header.tail_start as usize;
            (tail_start.min(bytes.len()) as u32, bytes.len().saturating_sub(tail_start) as u32)
        }
        Err(_) => (bytes.len() as u32, 0),
    }
}

fn generation_base_offset(generation: u64, block_size: u64) -> u64 {
    generation * block_size
}

fn writer_loop(
    shared: Arc<WriterShared>,
    receiver: mpsc::Receiver<CommitRequest>,
    shutdown: Arc<parking_lot::Mutex<bool>>,
    batch_cfg: GroupCommitConfig,
    sync_mode: SyncMode,
) {
    loop {
        let first = match receiver.recv() {
            Ok(req) => req,
            Err(_) => return,
        };
        if *shutdown.lock() && first.records.is_empty() {
            return;
        }

        let mut batch = vec![first];
        let deadline = Instant::now() + batch_cfg.max_batch_wait;
        while batch.len() < batch_cfg.max_batch_commits {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match receiver.recv_timeout(remaining) {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        let want_sync = matches!(sync_mode, SyncMode::Full | SyncMode::GroupCommit)
            && batch.iter().any(|r| r.durable);
        let outcome = apply_batch(&shared, &batch, want_sync);
        shared.stats.coalesced_batches.fetch_add(1, Ordering::Relaxed);

        for req in batch {
            let (lock, cvar) = &*req.result;
            let mut guard = lock.lock();
            *guard = Some(outcome.clone());
            cvar.notify_all();
        }
    }
}

/// Encodes and appends every record in `batch`, in order. Only the writer
/// thread ever calls this, so `shared.digest` advances as a strict sequence
/// with no contention.
fn apply_batch(shared: &Arc<WriterShared>, batch: &[CommitRequest], want_sync: bool) -> Result<JournalAddress> {
    let mut file = shared.file.lock();
    let mut last_address = JournalAddress(shared.global_offset.load(Ordering::Acquire));
    let mut total_bytes = 0u64;
    for req in batch {
        for record in &req.records {
            let prev_digest = *shared.digest.lock();
            let (frame, next_digest) = encode_frame(record, prev_digest);
            maybe_rollover(shared, &mut file, frame.len() as u64)?;
            let offset = shared.global_offset.fetch_add(frame.len() as u64, Ordering::AcqRel);
            file.write_all(&frame)?;
            *shared.digest.lock() = next_digest;
            total_bytes += frame.len() as u64;
            last_address = JournalAddress(offset + frame.len() as u64);
            shared.stats.frames_appended.fetch_add(1, Ordering::Relaxed);
        }
    }
    if want_sync && total_bytes > 0 {
        file.sync_data()?;
        shared.stats.syncs.fetch_add(1, Ordering::Relaxed);
    }
    shared.stats.bytes_appended.fetch_add(total_bytes, Ordering::Relaxed);
    Ok(last_address)
}

fn maybe_rollover(shared: &Arc<WriterShared>, file: &mut File, incoming: u64) -> Result<()> {
    let generation = shared.generation.load(Ordering::Acquire);
    let base = generation_base_offset(generation, shared.block_size);
    let current_offset = shared.global_offset.load(Ordering::Acquire);
    if current_offset + incoming <= base + shared.block_size {
        return Ok(());
    }
    file.flush()?;
    file.sync_data()?;
    let next_generation = generation + 1;
    let live: Vec<Timestamp> = shared.live_transactions.lock().keys().copied().collect();
    let path = segment_path(&shared.dir, &shared.prefix, next_generation);
    let mut new_file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
    let header = Record::Jh {
        generation: next_generation,
        base_address: JournalAddress(current_offset),
        live_transactions: live,
    };
    let prev_digest = *shared.digest.lock();
    let (frame, next_digest) = encode_frame(&header, prev_digest);
    new_file.write_all(&frame)?;
    *shared.digest.lock() = next_digest;
    *file = new_file;
    shared.generation.store(next_generation, Ordering::Release);
    shared
        .global_offset
        .store(generation_base_offset(next_generation, shared.block_size) + frame.len() as u64, Ordering::Release);
    shared.stats.rollovers.fetch_add(1, Ordering::Relaxed);
    info!(generation = next_generation, "journal.rollover");
    Ok(())
}

/// Outcome of scanning the journal at startup.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// Page images to restore into their volume slots, newest image per page.
    pub applied_pages: Vec<(VolumeId, PageId, Vec<u8>)>,
    /// Highest timestamp observed anywhere in the journal (TS/TC/TX/CP),
    /// used to fast-forward the timestamp allocator past anything replayed.
    pub max_timestamp_seen: Timestamp,
    /// Last checkpoint seen, if any.
    pub last_checkpoint: Option<(Timestamp, JournalAddress)>,
    /// Volume handle -> (id, name) bindings seen in IV records.
    pub volume_bindings: HashMap<u32, (VolumeId, String)>,
    /// Tree handle -> (volume handle, name) bindings seen in IT records.
    pub tree_bindings: HashMap<u32, (u32, String)>,
}

/// Scans every generation file in `dir`, verifies the hash chain, and
/// produces the set of page images that must be replayed to reach a
/// consistent state. Transactions with no terminating TC record (crashed
/// while active) are treated exactly like aborted transactions: their page
/// images are discarded. This is the fix for historical bug 915594, where a
/// rollback record that had not yet reached disk allowed a crashed
/// transaction's writes to be resurrected.
pub fn recover(dir: &Path, prefix: &str) -> Result<RecoveryOutcome> {
    let generations = list_generations(dir, prefix)?;
    let mut outcome = RecoveryOutcome::default();
    let mut staged: HashMap<(VolumeId, PageId), (Timestamp, Vec<u8>)> = HashMap::new();
    let mut resolved: HashMap<Timestamp, bool> = HashMap::new();

    for generation in generations {
        let path = segment_path(dir, prefix, generation);
        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let mut pos = 0usize;
        let mut is_first = true;
        while pos < data.len() {
            match decode_frame(&data[pos..]) {
                Ok((record, _digest, consumed)) => {
                    pos += consumed;
                    is_first = false;
                    observe_record(&record, &mut outcome, &mut staged, &mut resolved);
                }
                Err(_) if is_first && pos == 0 => {
                    // An empty or never-written generation file; nothing to recover from it.
                    break;
                }
                Err(_) => {
                    // Torn tail write: stop scanning this file, discard the
                    // partial frame, and move on as if the journal ended here.
                    warn!(generation, offset = pos, "journal.torn_tail_detected");
                    break;
                }
            }
        }
    }

    for ((volume, page), (ts, bytes)) in staged {
        let committed = ts == 0 || resolved.get(&ts).copied().unwrap_or(false);
        if committed {
            outcome.applied_pages.push((volume, page, bytes));
        } else {
            debug!(ts, ?volume, ?page, "journal.recovery_discarding_unresolved_page");
        }
    }
    Ok(outcome)
}

fn observe_record(
    record: &Record,
    outcome: &mut RecoveryOutcome,
    staged: &mut HashMap<(VolumeId, PageId), (Timestamp, Vec<u8>)>,
    resolved: &mut HashMap<Timestamp, bool>,
) {
    match record {
        Record::Iv { handle, volume_id, name } => {
            outcome.volume_bindings.insert(*handle, (*volume_id, name.clone()));
        }
        Record::It { handle, volume_handle, tree_name } => {
            outcome.tree_bindings.insert(*handle, (*volume_handle, tree_name.clone()));
        }
        Record::Pa { volume, page, timestamp, bytes, .. } => {
            staged.insert((*volume, *page), (*timestamp, bytes.clone()));
            outcome.max_timestamp_seen = outcome.max_timestamp_seen.max(*timestamp);
        }
        Record::Ts { ts } => {
            outcome.max_timestamp_seen = outcome.max_timestamp_seen.max(*ts);
            resolved.entry(*ts).or_insert(false);
        }
        Record::Tc { ts, tc } => {
            outcome.max_timestamp_seen = outcome.max_timestamp_seen.max((*ts).max(*tc));
            resolved.insert(*ts, true);
        }
        Record::Tx { ts } => {
            outcome.max_timestamp_seen = outcome.max_timestamp_seen.max(*ts);
            resolved.insert(*ts, false);
        }
        Record::Cp { ts, base_address } => {
            outcome.max_timestamp_seen = outcome.max_timestamp_seen.max(*ts);
            outcome.last_checkpoint = Some((*ts, *base_address));
        }
        Record::Jh { .. } | Record::Sr { .. } | Record::Dr { .. } | Record::Dt { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupCommitConfig;

    fn open_journal(dir: &Path) -> Journal {
        Journal::open(dir, "heartwood", 1 << 20, SyncMode::GroupCommit, GroupCommitConfig::default())
            .unwrap()
    }

    #[test]
    fn append_and_recover_page_image_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.begin(10).unwrap();
            journal
                .write_page_image(VolumeId(1), PageId(2), 10, &vec![7u8; 64])
                .unwrap();
            journal.commit(10, 20).unwrap();
        }
        let outcome = recover(dir.path(), "heartwood").unwrap();
        assert_eq!(outcome.applied_pages.len(), 1);
        assert_eq!(outcome.applied_pages[0].2, vec![7u8; 64]);
    }

    #[test]
    fn uncommitted_transaction_page_is_not_recovered() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.begin(5).unwrap();
            journal
                .write_page_image(VolumeId(1), PageId(9), 5, &vec![1u8; 16])
                .unwrap();
            // No commit: simulates a crash mid-transaction.
        }
        let outcome = recover(dir.path(), "heartwood").unwrap();
        assert!(outcome.applied_pages.is_empty());
    }

    #[test]
    fn rolled_back_transaction_page_is_not_recovered() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.begin(5).unwrap();
            journal
                .write_page_image(VolumeId(1), PageId(9), 5, &vec![1u8; 16])
                .unwrap();
            journal.rollback(5, true).unwrap();
        }
        let outcome = recover(dir.path(), "heartwood").unwrap();
        assert!(outcome.applied_pages.is_empty());
    }

    #[test]
    fn checkpoint_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open_journal(dir.path());
            journal.checkpoint(100, JournalAddress(0)).unwrap();
        }
        let outcome = recover(dir.path(), "heartwood").unwrap();
        assert_eq!(outcome.last_checkpoint, Some((100, JournalAddress(0))));
    }

    #[test]
    fn page_map_rejects_timestamp_regression() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open_journal(dir.path());
        journal.write_page_image(VolumeId(1), PageId(1), 10, &[0u8; 8]).unwrap();
        let err = journal.write_page_image(VolumeId(1), PageId(1), 5, &[0u8; 8]);
        assert!(err.is_err());
    }
}
