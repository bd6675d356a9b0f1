//! Long records: values too large for one page, stored as a small in-page
//! descriptor pointing at a chain of long-record pages in the same volume.

use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::types::{PageId, Timestamp, VolumeId};
use crate::volume::page::{self, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::volume::Volume;

/// Marker byte distinguishing an inline value from a long-record descriptor
/// in the first byte of a leaf value slot, ahead of the MVV encoding.
pub const LONG_RECORD_TAG: u8 = 0xFE;

/// In-page descriptor: total length of the real value and the first page of
/// its chain.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LongRecordDescriptor {
    pub total_len: u64,
    pub first_page: PageId,
}

impl LongRecordDescriptor {
    pub fn encode(self) -> Vec<u8> {
        let mut out = vec![LONG_RECORD_TAG];
        out.extend_from_slice(&self.total_len.to_be_bytes());
        out.extend_from_slice(&self.first_page.0.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 17 || bytes[0] != LONG_RECORD_TAG {
            return Err(Error::CorruptVolume("malformed long-record descriptor".into()));
        }
        Ok(Self {
            total_len: u64::from_be_bytes(bytes[1..9].try_into().unwrap()),
            first_page: PageId(u64::from_be_bytes(bytes[9..17].try_into().unwrap())),
        })
    }

    pub fn is_descriptor(bytes: &[u8]) -> bool {
        bytes.first() == Some(&LONG_RECORD_TAG)
    }
}

/// Writes `value` as a chain of long-record pages and returns the descriptor
/// bytes to store inline instead. Pages are allocated and written before the
/// descriptor is handed back, so a reader following the pointer always finds
/// the chain.
pub fn store(
    volume: &Volume,
    pool: &BufferPool,
    volume_id: VolumeId,
    value: &[u8],
    now: Timestamp,
) -> Result<Vec<u8>> {
    let page_size = volume.page_size() as usize;
    let chunk_cap = page_size - PAGE_HDR_LEN - 8; // 8-byte next-pointer trailer.
    let mut pages = Vec::new();
    for chunk in value.chunks(chunk_cap) {
        pages.push((volume.alloc_new_page()?, chunk));
    }
    for (i, (page_no, chunk)) in pages.iter().enumerate() {
        let mut buf = vec![0u8; page_size];
        let header = PageHeader::new(*page_no, PageKind::LongRecord, volume.page_size(), 0)?;
        header.encode(&mut buf)?;
        let next = pages.get(i + 1).map(|(p, _)| p.0).unwrap_or(0);
        let body = page::body_mut(&mut buf);
        body[0..8].copy_from_slice(&next.to_be_bytes());
        body[8..8 + chunk.len()].copy_from_slice(chunk);
        page::apply_crc32(&mut buf, *page_no, header.salt);
        let mut guard = pool.claim_new(volume_id, *page_no, buf)?;
        guard.mark_dirty(now);
    }
    let first_page = pages.first().map(|(p, _)| *p).unwrap_or(PageId(0));
    Ok(LongRecordDescriptor {
        total_len: value.len() as u64,
        first_page,
    }
    .encode())
}

/// Reads a long record's full value back by following its page chain.
pub fn load(pool: &BufferPool, volume_id: VolumeId, descriptor: &[u8]) -> Result<Vec<u8>> {
    let descriptor = LongRecordDescriptor::decode(descriptor)?;
    let mut out = Vec::with_capacity(descriptor.total_len as usize);
    let mut cursor = descriptor.first_page;
    while out.len() < descriptor.total_len as usize {
        let guard = pool.get_shared(volume_id, cursor)?;
        let header = PageHeader::decode(&guard)?;
        let body = page::body(&guard);
        let next = u64::from_be_bytes(body[0..8].try_into().unwrap());
        let remaining = descriptor.total_len as usize - out.len();
        let available = body.len() - 8;
        let take = remaining.min(available);
        out.extend_from_slice(&body[8..8 + take]);
        drop(header);
        if next == 0 {
            break;
        }
        cursor = PageId(next);
    }
    Ok(out)
}

/// Frees every page in a long record's chain (used when the owning version
/// is pruned away).
pub fn free_chain(volume: &Volume, pool: &BufferPool, volume_id: VolumeId, descriptor: &[u8]) -> Result<()> {
    let descriptor = LongRecordDescriptor::decode(descriptor)?;
    let mut cursor = descriptor.first_page;
    loop {
        let next = {
            let guard = pool.get_shared(volume_id, cursor)?;
            let body = page::body(&guard);
            u64::from_be_bytes(body[0..8].try_into().unwrap())
        };
        volume.free_page(cursor);
        if next == 0 {
            break;
        }
        cursor = PageId(next);
    }
    Ok(())
}
