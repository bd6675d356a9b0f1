//! A named page file: header, allocation, extension, free-list, head-page.

pub mod freelist;
pub mod page;
pub mod spec;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{PageId, Timestamp, VolumeId};

pub use freelist::{Extent, FreeCache};
pub use page::{PageHeader, PageKind, PAGE_HDR_LEN};
pub use spec::VolumeSpecification;

/// Page 1 is the primordial garbage-chain page; real allocation starts at 2.
pub const FIRST_ALLOCATABLE_PAGE: u64 = 2;

/// Point-in-time counters about a volume's allocation activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct VolumeStats {
    /// Pages ever handed out by `alloc_new_page`.
    pub pages_allocated: u64,
    /// Pages ever returned via `free_page`.
    pub pages_freed: u64,
}

struct HeadPageBody {
    id: VolumeId,
    page_size: u32,
    created_at: Timestamp,
    next_page: u64,
    extended_page_count: u64,
    directory_root: PageId,
    stats: VolumeStats,
}

const HEAD_BODY_LEN: usize = 8 + 4 + 8 + 8 + 8 + 8 + 8 + 8;

impl HeadPageBody {
    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.id.0.to_be_bytes());
        out[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        out[12..20].copy_from_slice(&self.created_at.to_be_bytes());
        out[20..28].copy_from_slice(&self.next_page.to_be_bytes());
        out[28..36].copy_from_slice(&self.extended_page_count.to_be_bytes());
        out[36..44].copy_from_slice(&self.directory_root.0.to_be_bytes());
        out[44..52].copy_from_slice(&self.stats.pages_allocated.to_be_bytes());
        out[52..60].copy_from_slice(&self.stats.pages_freed.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEAD_BODY_LEN {
            return Err(Error::CorruptVolume("head page body truncated".into()));
        }
        Ok(Self {
            id: VolumeId(u64::from_be_bytes(src[0..8].try_into().unwrap())),
            page_size: u32::from_be_bytes(src[8..12].try_into().unwrap()),
            created_at: u64::from_be_bytes(src[12..20].try_into().unwrap()),
            next_page: u64::from_be_bytes(src[20..28].try_into().unwrap()),
            extended_page_count: u64::from_be_bytes(src[28..36].try_into().unwrap()),
            directory_root: PageId(u64::from_be_bytes(src[36..44].try_into().unwrap())),
            stats: VolumeStats {
                pages_allocated: u64::from_be_bytes(src[44..52].try_into().unwrap()),
                pages_freed: u64::from_be_bytes(src[52..60].try_into().unwrap()),
            },
        })
    }
}

/// An open volume file.
pub struct Volume {
    file: Mutex<File>,
    path: PathBuf,
    id: VolumeId,
    name: String,
    page_size: u32,
    maximum_pages: u64,
    extension_pages: u64,
    created_at: Timestamp,
    next_page: AtomicU64,
    extended_page_count: AtomicU64,
    directory_root: Mutex<PageId>,
    free: Mutex<FreeCache>,
    stats: Mutex<VolumeStats>,
    read_only: bool,
    checksum_verify_on_read: bool,
}

impl Volume {
    /// Opens (creating if requested) the volume named by `spec`. `id` is the
    /// identity stamped into a newly created volume's head page; reopening an
    /// existing volume always recovers its identity from that head page
    /// instead, so `id` is ignored on the reopen path.
    pub fn open(spec: &VolumeSpecification, id: VolumeId, now: Timestamp) -> Result<Self> {
        let exists = spec.path.exists();
        if spec.create_only && exists {
            return Err(Error::InvalidVolumeSpec(format!(
                "{} already exists",
                spec.path.display()
            )));
        }
        if !exists && !spec.create && !spec.create_only {
            return Err(Error::InvalidVolumeSpec(format!(
                "{} does not exist and create was not requested",
                spec.path.display()
            )));
        }

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(!spec.read_only);
        if !exists {
            open_opts.create(true);
        }
        let mut file = open_opts.open(&spec.path)?;

        if exists {
            let volume = Self::read_existing(file, spec, id)?;
            return Ok(volume);
        }

        debug!(path = %spec.path.display(), "creating new volume");
        file.set_len(spec.initial_pages * spec.page_size as u64)?;
        let head = HeadPageBody {
            id,
            page_size: spec.page_size,
            created_at: now,
            next_page: FIRST_ALLOCATABLE_PAGE,
            extended_page_count: 0,
            directory_root: PageId(0),
            stats: VolumeStats::default(),
        };
        let volume = Self {
            file: Mutex::new(file),
            path: spec.path.clone(),
            id,
            name: spec.name.clone(),
            page_size: spec.page_size,
            maximum_pages: spec.maximum_pages,
            extension_pages: spec.extension_pages,
            created_at: now,
            next_page: AtomicU64::new(FIRST_ALLOCATABLE_PAGE),
            extended_page_count: AtomicU64::new(0),
            directory_root: Mutex::new(PageId(0)),
            free: Mutex::new(FreeCache::default()),
            stats: Mutex::new(VolumeStats::default()),
            read_only: spec.read_only,
            checksum_verify_on_read: true,
        };
        volume.write_head(&head)?;
        volume.write_garbage_root()?;
        Ok(volume)
    }

    fn read_existing(mut file: File, spec: &VolumeSpecification, id: VolumeId) -> Result<Self> {
        let mut buf = vec![0u8; spec.page_size as usize];
        file.seek(SeekFrom::Start(0))?;
        if file.read(&mut buf)? < PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("volume file shorter than one page".into()));
        }
        let header = PageHeader::decode(&buf)?;
        if header.kind != PageKind::Head {
            return Err(Error::CorruptVolume("page 0 is not a head page".into()));
        }
        page::verify_crc32(&buf, PageId(0), header.salt)?;
        let body = HeadPageBody::decode(page::body(&buf))?;
        let _ = id;

        let volume = Self {
            file: Mutex::new(file),
            path: spec.path.clone(),
            id: body.id,
            name: spec.name.clone(),
            page_size: header.page_size,
            maximum_pages: spec.maximum_pages,
            extension_pages: spec.extension_pages,
            created_at: body.created_at,
            next_page: AtomicU64::new(body.next_page),
            extended_page_count: AtomicU64::new(body.extended_page_count),
            directory_root: Mutex::new(body.directory_root),
            free: Mutex::new(FreeCache::default()),
            stats: Mutex::new(body.stats),
            read_only: spec.read_only,
            checksum_verify_on_read: true,
        };
        volume.load_garbage_chain()?;
        Ok(volume)
    }

    fn write_garbage_root(&self) -> Result<()> {
        let mut buf = vec![0u8; self.page_size as usize];
        let header = PageHeader::new(PageId(1), PageKind::Garbage, self.page_size, self.page_salt(PageId(1)))?;
        header.encode(&mut buf)?;
        // count = 0 extents initially.
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + 4].copy_from_slice(&0u32.to_be_bytes());
        page::apply_crc32(&mut buf, PageId(1), header.salt);
        self.write_raw(PageId(1), &buf)
    }

    fn load_garbage_chain(&self) -> Result<()> {
        let buf = self.read_raw(PageId(1))?;
        let count = u32::from_be_bytes(buf[PAGE_HDR_LEN..PAGE_HDR_LEN + 4].try_into().unwrap());
        let mut extents = Vec::with_capacity(count as usize);
        let mut off = PAGE_HDR_LEN + 4;
        for _ in 0..count {
            let start = u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
            let len = u32::from_be_bytes(buf[off + 8..off + 12].try_into().unwrap());
            extents.push(Extent {
                start: PageId(start),
                len,
            });
            off += 12;
        }
        *self.free.lock() = FreeCache::from_extents(extents);
        Ok(())
    }

    fn persist_garbage_chain(&self) -> Result<()> {
        let free = self.free.lock();
        let extents = free.extents();
        let capacity = (self.page_size as usize - PAGE_HDR_LEN - 4) / 12;
        if extents.len() > capacity {
            warn!(count = extents.len(), capacity, "garbage chain overflowed a single page");
        }
        let mut buf = vec![0u8; self.page_size as usize];
        let header = PageHeader::new(PageId(1), PageKind::Garbage, self.page_size, self.page_salt(PageId(1)))?;
        header.encode(&mut buf)?;
        let n = extents.len().min(capacity) as u32;
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + 4].copy_from_slice(&n.to_be_bytes());
        let mut off = PAGE_HDR_LEN + 4;
        for extent in extents.iter().take(n as usize) {
            buf[off..off + 8].copy_from_slice(&extent.start.0.to_be_bytes());
            buf[off + 8..off + 12].copy_from_slice(&extent.len.to_be_bytes());
            off += 12;
        }
        page::apply_crc32(&mut buf, PageId(1), header.salt);
        self.write_raw(PageId(1), &buf)
    }

    fn write_head(&self, body: &HeadPageBody) -> Result<()> {
        let mut buf = vec![0u8; self.page_size as usize];
        let header = PageHeader::new(PageId(0), PageKind::Head, self.page_size, self.page_salt(PageId(0)))?;
        header.encode(&mut buf)?;
        let mut body_buf = vec![0u8; HEAD_BODY_LEN];
        body.encode(&mut body_buf);
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + HEAD_BODY_LEN].copy_from_slice(&body_buf);
        page::apply_crc32(&mut buf, PageId(0), header.salt);
        self.write_raw(PageId(0), &buf)
    }

    /// Flushes the current in-memory head-page fields to disk, preserving the
    /// creation timestamp recorded at truncation.
    pub fn flush_head(&self) -> Result<()> {
        let body = HeadPageBody {
            id: self.id,
            page_size: self.page_size,
            created_at: self.created_at,
            next_page: self.next_page.load(Ordering::SeqCst),
            extended_page_count: self.extended_page_count.load(Ordering::SeqCst),
            directory_root: *self.directory_root.lock(),
            stats: *self.stats.lock(),
        };
        self.write_head(&body)?;
        self.persist_garbage_chain()
    }

    fn page_salt(&self, page_no: PageId) -> u64 {
        // Deterministic per-page salt derived from the volume id so reopening
        // the same volume reproduces the same expected salt for verification.
        self.id.0 ^ page_no.0.wrapping_mul(0x9E3779B97F4A7C15)
    }

    fn write_raw(&self, page_no: PageId, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidVolumeSpec("volume is read-only".into()));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no.0 * self.page_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn read_raw(&self, page_no: PageId) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_no.0 * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a page's raw bytes, validating its header and (if enabled) checksum.
    pub fn read_page(&self, page_no: PageId) -> Result<Vec<u8>> {
        let buf = self.read_raw(page_no)?;
        let header = PageHeader::decode(&buf)?;
        if header.page_no != page_no {
            return Err(Error::CorruptVolume(format!(
                "page {} header claims address {}",
                page_no, header.page_no
            )));
        }
        if self.checksum_verify_on_read {
            page::verify_crc32(&buf, page_no, header.salt)?;
        }
        Ok(buf)
    }

    /// Writes a fully-encoded page image (header + checksum already applied) to its slot.
    pub fn write_page(&self, page_no: PageId, buf: &[u8]) -> Result<()> {
        self.write_raw(page_no, buf)
    }

    /// Allocates a new page: from the free chain if non-empty, else by
    /// extending the file, else fails with `VolumeFull`.
    pub fn alloc_new_page(&self) -> Result<PageId> {
        if let Some(page) = self.free.lock().pop() {
            self.stats.lock().pages_allocated += 1;
            return Ok(page);
        }
        let current_next = self.next_page.load(Ordering::SeqCst);
        if current_next >= self.maximum_pages {
            return Err(Error::VolumeFull);
        }
        let page = PageId(current_next);
        self.next_page.store(current_next + 1, Ordering::SeqCst);

        let file_len_pages = {
            let file = self.file.lock();
            file.metadata()?.len() / self.page_size as u64
        };
        if current_next >= file_len_pages {
            let extend_to = (file_len_pages + self.extension_pages).min(self.maximum_pages);
            let mut file = self.file.lock();
            file.set_len(extend_to * self.page_size as u64)?;
            self.extended_page_count.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.lock().pages_allocated += 1;
        Ok(page)
    }

    /// Returns a page to the garbage chain.
    pub fn free_page(&self, page_no: PageId) {
        self.free.lock().free_page(page_no);
        self.stats.lock().pages_freed += 1;
    }

    /// Returns a contiguous run of pages to the garbage chain at once.
    pub fn free_extent(&self, extent: Extent) {
        let len = extent.len as u64;
        self.free.lock().extend(vec![extent]);
        self.stats.lock().pages_freed += len;
    }

    /// Volume id.
    pub fn id(&self) -> VolumeId {
        self.id
    }

    /// Logical volume name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Creation timestamp, preserved across reopens.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Root page of the tree-name -> tree-root directory tree.
    pub fn directory_root(&self) -> PageId {
        *self.directory_root.lock()
    }

    /// Updates the directory tree root (called once its first page is allocated).
    pub fn set_directory_root(&self, root: PageId) {
        *self.directory_root.lock() = root;
    }

    /// Snapshot of allocation statistics.
    pub fn stats(&self) -> VolumeStats {
        *self.stats.lock()
    }

    /// File-system path backing this volume.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Total committed page count (used + free) tracked against the maximum.
    pub fn committed_pages(&self) -> u64 {
        self.next_page.load(Ordering::SeqCst)
    }

    /// Configured maximum page count.
    pub fn maximum_pages(&self) -> u64 {
        self.maximum_pages
    }
}

/// Generates a fresh random 64-bit id for a newly created volume.
pub fn new_volume_id() -> VolumeId {
    VolumeId(rand::thread_rng().next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(dir: &std::path::Path, extra: &str) -> VolumeSpecification {
        let path = dir.join("vtest.v01");
        VolumeSpecification::parse(&format!(
            "{},pageSize:4096,initialSize:16k,maximumSize:64k,extensionSize:4k,create{}",
            path.display(),
            extra
        ))
        .unwrap()
    }

    #[test]
    fn round_trips_across_reopen() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "");
        let id = VolumeId(42);
        let volume = Volume::open(&spec, id, 1000).unwrap();
        volume.flush_head().unwrap();
        let created = volume.created_at();
        drop(volume);

        let reopened = Volume::open(&spec, id, 9999).unwrap();
        assert_eq!(reopened.id(), id);
        assert_eq!(reopened.created_at(), created);
    }

    #[test]
    fn allocation_fails_once_volume_full() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "");
        let volume = Volume::open(&spec, VolumeId(1), 0).unwrap();
        let mut allocated = 0;
        loop {
            match volume.alloc_new_page() {
                Ok(_) => allocated += 1,
                Err(Error::VolumeFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            assert!(allocated < 1000, "allocation never exhausted maximum");
        }
        assert!(allocated > 0);
    }

    #[test]
    fn freed_pages_are_reused_before_extending() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "");
        let volume = Volume::open(&spec, VolumeId(1), 0).unwrap();
        let first = volume.alloc_new_page().unwrap();
        volume.free_page(first);
        let reused = volume.alloc_new_page().unwrap();
        assert_eq!(first, reused);
    }

    #[test]
    fn truncated_file_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "");
        {
            let volume = Volume::open(&spec, VolumeId(1), 0).unwrap();
            volume.flush_head().unwrap();
        }
        let file = OpenOptions::new().write(true).open(&spec.path).unwrap();
        file.set_len(16).unwrap();
        drop(file);
        let err = Volume::open(&spec, VolumeId(1), 0).unwrap_err();
        assert!(matches!(err, Error::CorruptVolume(_)));
    }
}
