//! Fixed-size pool of page frames: lookup, claiming, dirty tracking, eviction, flush.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::types::{PageId, Timestamp, VolumeId};
use crate::volume::Volume;

/// Sink a buffer pool writes page images into before overwriting a volume
/// slot, implementing the WAL-before-volume-write invariant. The journal
/// manager implements this; the buffer pool only depends on the trait so the
/// two modules don't need to know about each other's internals.
pub trait PageJournal: Send + Sync {
    /// Appends a PA record for `bytes` and returns once it is durable enough
    /// to satisfy the WAL invariant (subject to the configured sync mode).
    fn write_page_image(
        &self,
        volume: VolumeId,
        page_no: PageId,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> Result<()>;
}

/// A no-op journal used by tests that exercise the buffer pool in isolation.
#[derive(Default)]
pub struct NullJournal;

impl PageJournal for NullJournal {
    fn write_page_image(
        &self,
        _volume: VolumeId,
        _page_no: PageId,
        _timestamp: Timestamp,
        _bytes: &[u8],
    ) -> Result<()> {
        Ok(())
    }
}

struct Frame {
    key: (VolumeId, PageId),
    data: Arc<RwLock<Vec<u8>>>,
    dirty: AtomicBool,
    dirty_at: AtomicU64,
    valid: AtomicBool,
}

impl Frame {
    fn new(key: (VolumeId, PageId), bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            key,
            data: Arc::new(RwLock::new(bytes)),
            dirty: AtomicBool::new(false),
            dirty_at: AtomicU64::new(0),
            valid: AtomicBool::new(true),
        })
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// A claimed read-only view of a page's bytes.
pub struct ReadGuard {
    frame: Arc<Frame>,
    guard: ArcRwLockReadGuard<RawRwLock, Vec<u8>>,
}

impl std::ops::Deref for ReadGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl ReadGuard {
    /// `false` once the pool has invalidated the volume this page belongs to.
    pub fn is_valid(&self) -> bool {
        self.frame.valid.load(Ordering::Acquire)
    }
}

/// A claimed exclusive (writable) view of a page's bytes.
pub struct WriteGuard {
    frame: Arc<Frame>,
    guard: ArcRwLockWriteGuard<RawRwLock, Vec<u8>>,
}

impl std::ops::Deref for WriteGuard {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for WriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl WriteGuard {
    /// `false` once the pool has invalidated the volume this page belongs to.
    pub fn is_valid(&self) -> bool {
        self.frame.valid.load(Ordering::Acquire)
    }

    /// Marks the page dirty as of `timestamp`. Must be called (via
    /// `release_touched`, or explicitly) after any mutation for the buffer
    /// pool's flush path to notice it.
    pub fn mark_dirty(&self, timestamp: Timestamp) {
        self.frame.dirty.store(true, Ordering::Release);
        // dirty_at records the *earliest* unflushed modification, not the latest.
        self.frame
            .dirty_at
            .fetch_min(timestamp, Ordering::AcqRel);
        if self.frame.dirty_at.load(Ordering::Acquire) == 0 {
            self.frame.dirty_at.store(timestamp, Ordering::Release);
        }
    }
}

/// Pool of reusable page frames shared by every volume open in the engine.
pub struct BufferPool {
    capacity: usize,
    volumes: Mutex<HashMap<VolumeId, Arc<Volume>>>,
    frames: Mutex<LruCache<(VolumeId, PageId), Arc<Frame>>>,
    journal: Arc<dyn PageJournal>,
    claim_timeout: Duration,
}

impl BufferPool {
    /// Creates a pool with room for `capacity` frames.
    pub fn new(capacity: usize, journal: Arc<dyn PageJournal>, claim_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            volumes: Mutex::new(HashMap::new()),
            frames: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            journal,
            claim_timeout,
        }
    }

    /// Registers a volume so its pages can be claimed through this pool.
    pub fn register_volume(&self, volume: Arc<Volume>) {
        self.volumes.lock().insert(volume.id(), volume);
    }

    /// Removes a volume's registration and invalidates any of its cached frames.
    pub fn unregister_volume(&self, volume: VolumeId) {
        self.invalidate(volume);
        self.volumes.lock().remove(&volume);
    }

    fn volume_handle(&self, volume: VolumeId) -> Result<Arc<Volume>> {
        self.volumes
            .lock()
            .get(&volume)
            .cloned()
            .ok_or(Error::CorruptVolume("volume not registered with buffer pool".into()))
    }

    fn fetch_or_load(&self, key: (VolumeId, PageId)) -> Result<Arc<Frame>> {
        {
            let mut frames = self.frames.lock();
            if let Some(frame) = frames.get(&key) {
                return Ok(frame.clone());
            }
        }
        let volume = self.volume_handle(key.0)?;
        let bytes = volume.read_page(key.1)?;
        let frame = Frame::new(key, bytes);

        let mut frames = self.frames.lock();
        if let Some(existing) = frames.get(&key) {
            return Ok(existing.clone());
        }
        if frames.len() >= self.capacity {
            self.evict_one(&mut frames)?;
        }
        frames.put(key, frame.clone());
        Ok(frame)
    }

    fn evict_one(&self, frames: &mut LruCache<(VolumeId, PageId), Arc<Frame>>) -> Result<()> {
        // Look from the LRU end for a clean victim; flush the first dirty one found
        // rather than give up, matching the "clean or flushable" victim contract.
        let candidates: Vec<_> = frames.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (key, frame) in candidates.iter().rev() {
            if !frame.is_dirty() {
                frames.pop(key);
                return Ok(());
            }
        }
        if let Some((key, frame)) = candidates.last() {
            self.flush_frame(&self.volume_handle(key.0)?, frame)?;
            frames.pop(key);
            return Ok(());
        }
        Err(Error::Fatal("buffer pool exhausted".into()))
    }

    /// Claims a page for reading, blocking up to the configured claim timeout.
    pub fn get_shared(&self, volume: VolumeId, page: PageId) -> Result<ReadGuard> {
        let frame = self.fetch_or_load((volume, page))?;
        let guard = frame
            .data
            .clone()
            .try_read_arc_for(self.claim_timeout)
            .ok_or(Error::Timeout("buffer pool shared claim"))?;
        Ok(ReadGuard { frame, guard })
    }

    /// Claims a page for writing, blocking up to the configured claim timeout.
    pub fn get_exclusive(&self, volume: VolumeId, page: PageId) -> Result<WriteGuard> {
        let frame = self.fetch_or_load((volume, page))?;
        let guard = frame
            .data
            .clone()
            .try_write_arc_for(self.claim_timeout)
            .ok_or(Error::Timeout("buffer pool exclusive claim"))?;
        Ok(WriteGuard { frame, guard })
    }

    /// Allocates a brand-new page, seeding its frame directly (no volume read).
    pub fn claim_new(&self, volume: VolumeId, page: PageId, bytes: Vec<u8>) -> Result<WriteGuard> {
        let frame = Frame::new((volume, page), bytes);
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.capacity {
                self.evict_one(&mut frames)?;
            }
            frames.put((volume, page), frame.clone());
        }
        let guard = frame
            .data
            .clone()
            .try_write_arc_for(self.claim_timeout)
            .ok_or(Error::Timeout("buffer pool exclusive claim"))?;
        Ok(WriteGuard { frame, guard })
    }

    /// Marks every cached frame belonging to `volume` invalid. A thread still
    /// holding a guard against one must re-acquire once it releases it.
    pub fn invalidate(&self, volume: VolumeId) {
        let mut frames = self.frames.lock();
        let keys: Vec<_> = frames
            .iter()
            .filter(|(k, _)| k.0 == volume)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (key, frame) in keys {
            frame.valid.store(false, Ordering::Release);
            frames.pop(&key);
        }
        debug!(?volume, "invalidated buffer pool frames");
    }

    /// Returns up to `limit` dirty frames at or before `timestamp`, ordered
    /// ascending by page address, for the flush path to write sequentially.
    pub fn select_dirty_buffers(&self, timestamp: Timestamp, limit: usize) -> Vec<(VolumeId, PageId)> {
        let frames = self.frames.lock();
        let mut dirty: Vec<_> = frames
            .iter()
            .filter(|(_, f)| f.is_dirty() && f.dirty_at.load(Ordering::Acquire) <= timestamp)
            .map(|(k, _)| *k)
            .collect();
        dirty.sort_by_key(|(vol, page)| (vol.0, page.0));
        dirty.truncate(limit);
        dirty
    }

    fn flush_frame(&self, volume: &Volume, frame: &Frame) -> Result<()> {
        let bytes = frame.data.read();
        let ts = frame.dirty_at.load(Ordering::Acquire);
        self.journal
            .write_page_image(frame.key.0, frame.key.1, ts, &bytes)?;
        volume.write_page(frame.key.1, &bytes)?;
        drop(bytes);
        frame.dirty.store(false, Ordering::Release);
        frame.dirty_at.store(0, Ordering::Release);
        Ok(())
    }

    /// Guarantees every buffer dirty at or before `timestamp` has its image in
    /// the journal and written to its volume slot.
    pub fn flush(&self, timestamp: Timestamp) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let batch = self.select_dirty_buffers(timestamp, usize::MAX);
            if batch.is_empty() {
                break;
            }
            for (volume_id, page) in &batch {
                let frame = self.fetch_or_load((*volume_id, *page))?;
                if !frame.is_dirty() {
                    continue;
                }
                let volume = self.volume_handle(*volume_id)?;
                self.flush_frame(&volume, &frame)?;
                flushed += 1;
            }
        }
        trace!(flushed, timestamp, "buffer pool flush complete");
        Ok(flushed)
    }

    /// Overwrites a page's bytes directly (used by transaction rollback to
    /// restore a pre-mutation shadow copy) and marks it dirty so it is
    /// reflushed consistently.
    pub fn restore_page(&self, volume: VolumeId, page: PageId, bytes: Vec<u8>, timestamp: Timestamp) -> Result<()> {
        let mut guard = self.get_exclusive(volume, page)?;
        guard.guard.clear();
        guard.guard.extend_from_slice(&bytes);
        guard.mark_dirty(timestamp);
        Ok(())
    }

    /// Number of frames currently cached (for tests/diagnostics).
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// `true` when no frames are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::spec::VolumeSpecification;
    use crate::volume::{new_volume_id, PageKind};
    use tempfile::tempdir;

    fn make_volume(dir: &std::path::Path) -> Arc<Volume> {
        let path = dir.join("v.v01");
        let spec = VolumeSpecification::parse(&format!(
            "{},pageSize:4096,initialSize:64k,maximumSize:256k,create",
            path.display()
        ))
        .unwrap();
        Arc::new(Volume::open(&spec, new_volume_id(), 1).unwrap())
    }

    #[test]
    fn get_shared_reads_through_to_volume() {
        let dir = tempdir().unwrap();
        let volume = make_volume(dir.path());
        let page = volume.alloc_new_page().unwrap();
        let mut buf = vec![0u8; volume.page_size() as usize];
        let header = crate::volume::page::PageHeader::new(page, PageKind::Data, volume.page_size(), 1).unwrap();
        header.encode(&mut buf).unwrap();
        crate::volume::page::apply_crc32(&mut buf, page, header.salt);
        volume.write_page(page, &buf).unwrap();

        let pool = BufferPool::new(8, Arc::new(NullJournal), Duration::from_secs(1));
        pool.register_volume(volume.clone());
        let guard = pool.get_shared(volume.id(), page).unwrap();
        assert_eq!(&guard[..4], &crate::volume::page::PAGE_MAGIC);
    }

    #[test]
    fn dirty_pages_are_flushed_and_cleared() {
        let dir = tempdir().unwrap();
        let volume = make_volume(dir.path());
        let page = volume.alloc_new_page().unwrap();
        let mut buf = vec![0u8; volume.page_size() as usize];
        let header = crate::volume::page::PageHeader::new(page, PageKind::Data, volume.page_size(), 1).unwrap();
        header.encode(&mut buf).unwrap();
        crate::volume::page::apply_crc32(&mut buf, page, header.salt);
        volume.write_page(page, &buf).unwrap();

        let pool = BufferPool::new(8, Arc::new(NullJournal), Duration::from_secs(1));
        pool.register_volume(volume.clone());
        {
            let mut guard = pool.get_exclusive(volume.id(), page).unwrap();
            guard[10] = 0xAB;
            guard.mark_dirty(5);
        }
        assert_eq!(pool.select_dirty_buffers(100, 10).len(), 1);
        let flushed = pool.flush(100).unwrap();
        assert_eq!(flushed, 1);
        assert!(pool.select_dirty_buffers(100, 10).is_empty());
    }

    #[test]
    fn invalidate_drops_cached_frames_for_volume() {
        let dir = tempdir().unwrap();
        let volume = make_volume(dir.path());
        let page = volume.alloc_new_page().unwrap();
        let mut buf = vec![0u8; volume.page_size() as usize];
        let header = crate::volume::page::PageHeader::new(page, PageKind::Data, volume.page_size(), 1).unwrap();
        header.encode(&mut buf).unwrap();
        crate::volume::page::apply_crc32(&mut buf, page, header.salt);
        volume.write_page(page, &buf).unwrap();

        let pool = BufferPool::new(8, Arc::new(NullJournal), Duration::from_secs(1));
        pool.register_volume(volume.clone());
        let _ = pool.get_shared(volume.id(), page).unwrap();
        assert_eq!(pool.len(), 1);
        pool.invalidate(volume.id());
        assert_eq!(pool.len(), 0);
    }
}
