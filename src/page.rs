//! page: PostgreSQL data page header checks and page-level reads.
//!
//! Header layout (native endian, 24 bytes):
//!   pd_lsn              xlogid u32 | xrecoff u32   @0
//!   pd_checksum         u16                        @8
//!   pd_flags            u16                        @10
//!   pd_lower            u16                        @12
//!   pd_upper            u16                        @14
//!   pd_special          u16                        @16
//!   pd_pagesize_version u16                        @18
//!   pd_prune_xid        u32                        @20
//!
//! A page with pd_upper == 0 is new: valid only when every byte is zero.
//! Anything else must pass the header sanity checks PostgreSQL applies when
//! it reads a buffer. Data checksums are not recomputed here.

use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use log::{debug, warn};

use crate::consts::BLCKSZ;
use crate::error::{PioError, PioResult};
use crate::pagemap::{page_lsn, PageBitmap};
use crate::pio::PioFile;

pub const SIZE_OF_PAGE_HEADER: usize = 24;
pub const PG_PAGE_LAYOUT_VERSION: u16 = 4;

const OFF_CHECKSUM: usize = 8;
const OFF_FLAGS: usize = 10;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_SPECIAL: usize = 16;
const OFF_PAGESIZE_VERSION: usize = 18;
const OFF_PRUNE_XID: usize = 20;

const PD_VALID_FLAG_BITS: u16 = 0x0007;
const MAXIMUM_ALIGNOF: u16 = 8;

/// Re-reads of a block whose header looks broken before it is reported;
/// a page being written concurrently can be read torn.
pub const PAGE_READ_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: u64,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
    pub prune_xid: u32,
}

impl PageHeader {
    /// Header of a freshly initialised page without special space.
    pub fn empty(lsn: u64) -> Self {
        Self {
            lsn,
            checksum: 0,
            flags: 0,
            lower: SIZE_OF_PAGE_HEADER as u16,
            upper: BLCKSZ as u16,
            special: BLCKSZ as u16,
            pagesize_version: BLCKSZ as u16 | PG_PAGE_LAYOUT_VERSION,
            prune_xid: 0,
        }
    }

    pub fn read(page: &[u8]) -> Self {
        Self {
            lsn: page_lsn(page),
            checksum: NativeEndian::read_u16(&page[OFF_CHECKSUM..OFF_CHECKSUM + 2]),
            flags: NativeEndian::read_u16(&page[OFF_FLAGS..OFF_FLAGS + 2]),
            lower: NativeEndian::read_u16(&page[OFF_LOWER..OFF_LOWER + 2]),
            upper: NativeEndian::read_u16(&page[OFF_UPPER..OFF_UPPER + 2]),
            special: NativeEndian::read_u16(&page[OFF_SPECIAL..OFF_SPECIAL + 2]),
            pagesize_version: NativeEndian::read_u16(&page[OFF_PAGESIZE_VERSION..OFF_PAGESIZE_VERSION + 2]),
            prune_xid: NativeEndian::read_u32(&page[OFF_PRUNE_XID..OFF_PRUNE_XID + 4]),
        }
    }

    pub fn write(&self, page: &mut [u8]) {
        NativeEndian::write_u32(&mut page[0..4], (self.lsn >> 32) as u32);
        NativeEndian::write_u32(&mut page[4..8], self.lsn as u32);
        NativeEndian::write_u16(&mut page[OFF_CHECKSUM..OFF_CHECKSUM + 2], self.checksum);
        NativeEndian::write_u16(&mut page[OFF_FLAGS..OFF_FLAGS + 2], self.flags);
        NativeEndian::write_u16(&mut page[OFF_LOWER..OFF_LOWER + 2], self.lower);
        NativeEndian::write_u16(&mut page[OFF_UPPER..OFF_UPPER + 2], self.upper);
        NativeEndian::write_u16(&mut page[OFF_SPECIAL..OFF_SPECIAL + 2], self.special);
        NativeEndian::write_u16(
            &mut page[OFF_PAGESIZE_VERSION..OFF_PAGESIZE_VERSION + 2],
            self.pagesize_version,
        );
        NativeEndian::write_u32(&mut page[OFF_PRUNE_XID..OFF_PRUNE_XID + 4], self.prune_xid);
    }

    /// First failed sanity check, None for a plausible header.
    fn problem(&self) -> Option<String> {
        let size = (self.pagesize_version & 0xff00) as usize;
        let version = self.pagesize_version & 0x00ff;
        if size != BLCKSZ {
            return Some(format!("page size {size} does not match block size {BLCKSZ}"));
        }
        if version != PG_PAGE_LAYOUT_VERSION {
            return Some(format!("page layout version {version}"));
        }
        if self.flags & !PD_VALID_FLAG_BITS != 0 {
            return Some(format!("invalid flags {:#06x}", self.flags));
        }
        let (lower, upper, special) = (self.lower as usize, self.upper as usize, self.special as usize);
        if lower < SIZE_OF_PAGE_HEADER || lower > upper || upper > special || special > BLCKSZ {
            return Some(format!("pd_lower {lower}, pd_upper {upper}, pd_special {special}"));
        }
        if self.special % MAXIMUM_ALIGNOF != 0 {
            return Some(format!("pd_special {special} is not aligned"));
        }
        None
    }
}

/// Outcome of checking one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    Valid { lsn: u64 },
    /// Never initialised: all bytes zero.
    Zeroed,
    Corrupt(String),
}

pub fn check_page(page: &[u8]) -> PageStatus {
    if page.len() != BLCKSZ {
        return PageStatus::Corrupt(format!("partial page of {} bytes", page.len()));
    }
    let hdr = PageHeader::read(page);
    if hdr.upper == 0 {
        return if page.iter().all(|&b| b == 0) {
            PageStatus::Zeroed
        } else {
            PageStatus::Corrupt("new page is not zeroed".to_string())
        };
    }
    match hdr.problem() {
        Some(msg) => PageStatus::Corrupt(format!("page header is invalid: {msg}")),
        None => PageStatus::Valid { lsn: hdr.lsn },
    }
}

/// Which blocks a page-level copy sends.
///
/// Without a bitmap every valid page with LSN >= horizon is sent, and zeroed
/// pages only for a full copy (horizon 0). With a bitmap exactly the set
/// blocks are sent, whatever their LSN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSelection {
    pub horizon_lsn: u64,
    pub pagemap: Option<PageBitmap>,
}

/// Bitmap length marker for "no bitmap" in the wire form.
const NO_PAGEMAP: u32 = u32::MAX;

impl PageSelection {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn since(horizon_lsn: u64) -> Self {
        Self {
            horizon_lsn,
            pagemap: None,
        }
    }

    pub fn blocks(pagemap: PageBitmap) -> Self {
        Self {
            horizon_lsn: 0,
            pagemap: Some(pagemap),
        }
    }

    fn wants(&self, status: &PageStatus) -> bool {
        if self.pagemap.is_some() {
            return true;
        }
        match status {
            PageStatus::Valid { lsn } => *lsn >= self.horizon_lsn,
            PageStatus::Zeroed => self.horizon_lsn == 0,
            PageStatus::Corrupt(_) => true,
        }
    }

    /// horizon u64 | map length u32 (u32::MAX = none) | map bytes, all LE.
    pub fn encode(&self) -> Vec<u8> {
        let map = self.pagemap.as_ref().map(PageBitmap::as_bytes);
        let mut out = vec![0u8; 12];
        LittleEndian::write_u64(&mut out[0..8], self.horizon_lsn);
        LittleEndian::write_u32(&mut out[8..12], map.map(|m| m.len() as u32).unwrap_or(NO_PAGEMAP));
        if let Some(m) = map {
            out.extend_from_slice(m);
        }
        out
    }

    /// Decode from the front of `buf`; returns the selection and bytes used.
    pub fn decode(buf: &[u8]) -> PioResult<(Self, usize)> {
        let malformed = || PioError::Protocol("malformed page selection".to_string());
        if buf.len() < 12 {
            return Err(malformed());
        }
        let horizon_lsn = LittleEndian::read_u64(&buf[0..8]);
        let map_len = LittleEndian::read_u32(&buf[8..12]);
        if map_len == NO_PAGEMAP {
            return Ok((Self::since(horizon_lsn), 12));
        }
        let end = 12usize.checked_add(map_len as usize).ok_or_else(malformed)?;
        let map = buf.get(12..end).ok_or_else(malformed)?;
        let sel = Self {
            horizon_lsn,
            pagemap: Some(PageBitmap::from_bytes(map.to_vec())),
        };
        Ok((sel, end))
    }
}

/// One block handed to a page sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentPage<'a> {
    Data { blkno: u32, page: &'a [u8] },
    Zero { blkno: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagesSent {
    /// One past the last block examined.
    pub blocks_read: u32,
    pub pages: u32,
    pub zero_pages: u32,
}

/// Read block `blkno`; None at end of file.
fn read_block<F: PioFile + ?Sized>(file: &mut F, blkno: u32, page: &mut [u8]) -> PioResult<Option<usize>> {
    let offs = blkno as u64 * BLCKSZ as u64;
    let mut filled = 0usize;
    while filled < BLCKSZ {
        let n = file.pread(&mut page[filled..], offs + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(if filled == 0 { None } else { Some(filled) })
}

/// Check block `blkno`, re-reading a broken-looking one a few times.
fn read_checked<F: PioFile + ?Sized>(file: &mut F, blkno: u32, page: &mut [u8]) -> PioResult<Option<PageStatus>> {
    let mut status = None;
    for attempt in 1..=PAGE_READ_ATTEMPTS {
        let Some(len) = read_block(file, blkno, page)? else {
            return Ok(None);
        };
        let st = check_page(&page[..len]);
        if !matches!(st, PageStatus::Corrupt(_)) {
            return Ok(Some(st));
        }
        debug!("{} block {}: attempt {} found a broken page", file.path(), blkno, attempt);
        status = Some(st);
    }
    Ok(status)
}

/// Page-level copy of up to `n_blocks` blocks of `file`.
///
/// Selected pages go to `sink` in block order. The first page that stays
/// broken after re-reads ends the copy with PageCorruption.
pub fn read_pages<F: PioFile + ?Sized>(
    file: &mut F,
    n_blocks: u32,
    sel: &PageSelection,
    sink: &mut dyn FnMut(SentPage<'_>) -> PioResult<()>,
) -> PioResult<PagesSent> {
    let mut page = vec![0u8; BLCKSZ];
    let mut sent = PagesSent::default();
    let blocks: Box<dyn Iterator<Item = u32> + '_> = match &sel.pagemap {
        Some(map) => Box::new(map.iterate().take_while(move |b| *b < n_blocks)),
        None => Box::new(0..n_blocks),
    };

    for blkno in blocks {
        let Some(status) = read_checked(file, blkno, &mut page)? else {
            break;
        };
        sent.blocks_read = blkno + 1;
        if !sel.wants(&status) {
            continue;
        }
        match status {
            PageStatus::Valid { .. } => {
                sink(SentPage::Data { blkno, page: &page })?;
                sent.pages += 1;
            }
            PageStatus::Zeroed => {
                sink(SentPage::Zero { blkno })?;
                sent.zero_pages += 1;
            }
            PageStatus::Corrupt(msg) => {
                warn!("corruption detected in file \"{}\", block {}: {}", file.path(), blkno, msg);
                return Err(PioError::PageCorruption {
                    path: file.path().to_string(),
                    blkno,
                    msg,
                });
            }
        }
    }
    Ok(sent)
}

/// LSN and checksum of one block; both zero for a zeroed or broken page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDigest {
    pub lsn: u64,
    pub checksum: u32,
}

pub const BLOCK_DIGEST_SIZE: usize = 12;

impl BlockDigest {
    /// With data checksums enabled the checksum PostgreSQL stored in the
    /// header; otherwise CRC32C of the page.
    pub fn of_page(page: &[u8], checksum_version: u32) -> Self {
        match check_page(page) {
            PageStatus::Valid { lsn } => {
                let checksum = if checksum_version != 0 {
                    PageHeader::read(page).checksum as u32
                } else {
                    crc32c::crc32c(page)
                };
                Self { lsn, checksum }
            }
            _ => Self::default(),
        }
    }

    pub fn encode_all(map: &[BlockDigest]) -> Vec<u8> {
        let mut out = vec![0u8; map.len() * BLOCK_DIGEST_SIZE];
        for (d, chunk) in map.iter().zip(out.chunks_exact_mut(BLOCK_DIGEST_SIZE)) {
            LittleEndian::write_u64(&mut chunk[0..8], d.lsn);
            LittleEndian::write_u32(&mut chunk[8..12], d.checksum);
        }
        out
    }

    pub fn decode_all(buf: &[u8]) -> PioResult<Vec<BlockDigest>> {
        if buf.len() % BLOCK_DIGEST_SIZE != 0 {
            return Err(PioError::Protocol(format!("checksum map of {} bytes", buf.len())));
        }
        Ok(buf
            .chunks_exact(BLOCK_DIGEST_SIZE)
            .map(|c| BlockDigest {
                lsn: LittleEndian::read_u64(&c[0..8]),
                checksum: LittleEndian::read_u32(&c[8..12]),
            })
            .collect())
    }
}

/// Digest of every block up to `n_blocks` or end of file.
pub fn build_checksum_map<F: PioFile + ?Sized>(
    file: &mut F,
    n_blocks: u32,
    checksum_version: u32,
) -> PioResult<Vec<BlockDigest>> {
    let mut page = vec![0u8; BLCKSZ];
    let mut map = Vec::new();
    for blkno in 0..n_blocks {
        let Some(len) = read_block(file, blkno, &mut page)? else {
            break;
        };
        map.push(BlockDigest::of_page(&page[..len], checksum_version));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_page(lsn: u64) -> Vec<u8> {
        let mut page = vec![0u8; BLCKSZ];
        PageHeader::empty(lsn).write(&mut page);
        page
    }

    #[test]
    fn header_checks() {
        assert_eq!(check_page(&valid_page(0x1_0000_0010)), PageStatus::Valid { lsn: 0x1_0000_0010 });
        assert_eq!(check_page(&vec![0u8; BLCKSZ]), PageStatus::Zeroed);

        let mut page = valid_page(5);
        NativeEndian::write_u16(&mut page[OFF_LOWER..OFF_LOWER + 2], 2);
        assert!(matches!(check_page(&page), PageStatus::Corrupt(_)));

        let mut page = vec![0u8; BLCKSZ];
        page[4000] = 1;
        assert!(matches!(check_page(&page), PageStatus::Corrupt(_)));

        assert!(matches!(check_page(&valid_page(1)[..100]), PageStatus::Corrupt(_)));
    }

    #[test]
    fn selection_wire_form() {
        let mut map = PageBitmap::new();
        map.set(3);
        map.set(17);
        for sel in [PageSelection::since(0x20), PageSelection::blocks(map)] {
            let mut buf = sel.encode();
            let used = buf.len();
            buf.extend_from_slice(b"/path");
            assert_eq!(PageSelection::decode(&buf).unwrap(), (sel, used));
        }
        assert!(PageSelection::decode(&[0u8; 5]).is_err());
        let mut short = PageSelection::since(1).encode();
        short[8] = 200;
        assert!(PageSelection::decode(&short).is_err());
    }

    #[test]
    fn digest_uses_stored_checksum_only_with_data_checksums() {
        let mut page = valid_page(9);
        NativeEndian::write_u16(&mut page[OFF_CHECKSUM..OFF_CHECKSUM + 2], 0x1234);
        assert_eq!(BlockDigest::of_page(&page, 1), BlockDigest { lsn: 9, checksum: 0x1234 });
        assert_eq!(BlockDigest::of_page(&page, 0).checksum, crc32c::crc32c(&page));
        assert_eq!(BlockDigest::of_page(&vec![0u8; BLCKSZ], 1), BlockDigest::default());
    }
}
