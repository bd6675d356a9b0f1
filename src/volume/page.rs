//! Common page header shared by every page kind in a volume: head, garbage,
//! B+-tree data/index, and long-record pages.

use std::convert::TryFrom;
use std::ops::Range;

use crate::checksum::page_crc32;
use crate::error::{Error, Result};
use crate::types::{PageId, Timestamp};

/// Stamped at the start of every page so a page found at the wrong address,
/// or belonging to a different format generation, is rejected immediately.
pub const PAGE_MAGIC: [u8; 4] = *b"HRTW";
/// Current on-disk page format generation.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Size in bytes of the fixed page header. Every page kind's payload begins
/// immediately after this.
pub const PAGE_HDR_LEN: usize = 52;

mod offset {
    use super::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    pub const KIND: usize = 6;
    pub const INDEX_LEVEL: usize = 7;
    pub const PAGE_SIZE: Range<usize> = 8..12;
    pub const PAGE_NO: Range<usize> = 12..20;
    pub const RIGHT_SIBLING: Range<usize> = 20..28;
    pub const MODIFIED_AT: Range<usize> = 28..36;
    pub const KEY_BLOCK_COUNT: Range<usize> = 36..38;
    pub const TAIL_START: Range<usize> = 38..40;
    pub const SALT: Range<usize> = 40..48;
    pub const CRC32: Range<usize> = 48..52;
}

/// The page's role, matching the data model's "type" field.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PageKind {
    /// Page 0: volume signature, id, directory root, tunables.
    Head = 0,
    /// A page on the per-volume garbage (free) chain.
    Garbage = 1,
    /// A B+-tree leaf (data) page.
    Data = 2,
    /// A B+-tree internal (index) page; `index_level` names its level above leaves.
    Index = 3,
    /// A page in a long-record chain.
    LongRecord = 4,
}

impl PageKind {
    const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Head),
            1 => Ok(PageKind::Garbage),
            2 => Ok(PageKind::Data),
            3 => Ok(PageKind::Index),
            4 => Ok(PageKind::LongRecord),
            _ => Err(Error::CorruptVolume("unknown page kind".into())),
        }
    }
}

/// Fixed fields common to every page.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PageHeader {
    /// On-disk format generation.
    pub format_version: u16,
    /// This page's role.
    pub kind: PageKind,
    /// Depth above the leaf level; zero unless `kind == Index`.
    pub index_level: u8,
    /// Page size this header was written for.
    pub page_size: u32,
    /// This page's own address.
    pub page_no: PageId,
    /// Address of the next page holding keys greater than every key here.
    pub right_sibling: Option<PageId>,
    /// Timestamp of the writer that last modified this page.
    pub modified_at: Timestamp,
    /// Number of key blocks currently present in the forward-growing array.
    pub key_block_count: u16,
    /// Offset where the backward-growing tail heap currently begins (the
    /// "allocation pointer"): bytes in `[key_block_end, tail_start)` are free.
    pub tail_start: u16,
    /// Per-page random salt folded into the checksum to catch misdirected writes.
    pub salt: u64,
    /// Checksum over the page body plus `page_no`/`salt`.
    pub crc32: u32,
}

impl PageHeader {
    /// Builds a fresh header for a newly allocated page. `tail_start` is
    /// initialized to `page_size - PAGE_HDR_LEN`, i.e. an empty tail heap.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("page size smaller than header".into()));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            index_level: 0,
            page_size,
            page_no,
            right_sibling: None,
            modified_at: 0,
            key_block_count: 0,
            tail_start: (page_size as usize - PAGE_HDR_LEN) as u16,
            salt,
            crc32: 0,
        })
    }

    /// Number of bytes available in the body for the payload format layered
    /// on top of this header.
    pub fn body_len(&self) -> usize {
        self.page_size as usize - PAGE_HDR_LEN
    }

    /// Encodes the header into the first `PAGE_HDR_LEN` bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(Error::InvalidKey("page buffer smaller than header"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[offset::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[offset::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[offset::KIND] = self.kind.as_u8();
        hdr[offset::INDEX_LEVEL] = self.index_level;
        hdr[offset::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[offset::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[offset::RIGHT_SIBLING]
            .copy_from_slice(&self.right_sibling.map(|p| p.0).unwrap_or(0).to_be_bytes());
        hdr[offset::MODIFIED_AT].copy_from_slice(&self.modified_at.to_be_bytes());
        hdr[offset::KEY_BLOCK_COUNT].copy_from_slice(&self.key_block_count.to_be_bytes());
        hdr[offset::TAIL_START].copy_from_slice(&self.tail_start.to_be_bytes());
        hdr[offset::SALT].copy_from_slice(&self.salt.to_be_bytes());
        hdr[offset::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Decodes and validates a header from `src`, without checking the CRC
    /// (callers verify the CRC separately against the full page body since
    /// that requires the payload bytes too).
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("page header truncated".into()));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[offset::MAGIC] != PAGE_MAGIC {
            return Err(Error::CorruptVolume("bad page magic".into()));
        }
        let format_version = u16::from_be_bytes(hdr[offset::FORMAT_VERSION].try_into().unwrap());
        if format_version != PAGE_FORMAT_VERSION {
            return Err(Error::CorruptVolume("unsupported page format version".into()));
        }
        let kind = PageKind::try_from(hdr[offset::KIND])?;
        let index_level = hdr[offset::INDEX_LEVEL];
        let page_size = u32::from_be_bytes(hdr[offset::PAGE_SIZE].try_into().unwrap());
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("page size smaller than header".into()));
        }
        let page_no = PageId(u64::from_be_bytes(hdr[offset::PAGE_NO].try_into().unwrap()));
        let right_sibling_raw = u64::from_be_bytes(hdr[offset::RIGHT_SIBLING].try_into().unwrap());
        let right_sibling = if right_sibling_raw == 0 {
            None
        } else {
            Some(PageId(right_sibling_raw))
        };
        let modified_at = u64::from_be_bytes(hdr[offset::MODIFIED_AT].try_into().unwrap());
        let key_block_count = u16::from_be_bytes(hdr[offset::KEY_BLOCK_COUNT].try_into().unwrap());
        let tail_start = u16::from_be_bytes(hdr[offset::TAIL_START].try_into().unwrap());
        if tail_start as usize > page_size as usize - PAGE_HDR_LEN {
            return Err(Error::CorruptVolume("tail_start beyond page body".into()));
        }
        let salt = u64::from_be_bytes(hdr[offset::SALT].try_into().unwrap());
        let crc32 = u32::from_be_bytes(hdr[offset::CRC32].try_into().unwrap());
        Ok(Self {
            format_version,
            kind,
            index_level,
            page_size,
            page_no,
            right_sibling,
            modified_at,
            key_block_count,
            tail_start,
            salt,
            crc32,
        })
    }
}

/// Zeroes the checksum field of an already-encoded page, so the checksum can
/// be recomputed over the rest of the buffer.
pub fn clear_crc32(buf: &mut [u8]) {
    buf[offset::CRC32].fill(0);
}

/// Recomputes and stamps the checksum for an encoded page buffer. `buf` must
/// already contain the encoded header (with a zeroed CRC field) plus payload.
pub fn apply_crc32(buf: &mut [u8], page_no: PageId, salt: u64) {
    clear_crc32(buf);
    let crc = page_crc32(page_no, salt, buf);
    buf[offset::CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Verifies a page's checksum against its declared page number and salt.
pub fn verify_crc32(buf: &[u8], page_no: PageId, salt: u64) -> Result<()> {
    let stored = u32::from_be_bytes(buf[offset::CRC32].try_into().unwrap());
    let mut scratch = buf.to_vec();
    clear_crc32(&mut scratch);
    let computed = page_crc32(page_no, salt, &scratch);
    if stored != computed {
        return Err(Error::CorruptVolume(format!(
            "checksum mismatch on page {}",
            page_no
        )));
    }
    Ok(())
}

/// Body slice following the fixed header.
pub fn body(buf: &[u8]) -> &[u8] {
    &buf[PAGE_HDR_LEN..]
}

/// Mutable body slice following the fixed header.
pub fn body_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[PAGE_HDR_LEN..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut buf = vec![0u8; 256];
        let mut header = PageHeader::new(PageId(5), PageKind::Data, 256, 99).unwrap();
        header.right_sibling = Some(PageId(6));
        header.modified_at = 42;
        header.key_block_count = 3;
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = vec![0u8; 256];
        assert!(PageHeader::decode(&buf).is_err());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut buf = vec![0u8; 256];
        let header = PageHeader::new(PageId(1), PageKind::Data, 256, 7).unwrap();
        header.encode(&mut buf).unwrap();
        apply_crc32(&mut buf, PageId(1), 7);
        verify_crc32(&buf, PageId(1), 7).unwrap();
        buf[PAGE_HDR_LEN] ^= 0xFF;
        assert!(verify_crc32(&buf, PageId(1), 7).is_err());
    }
}
