//! pagemap: growable bit-set of changed block numbers.
//!
//! Bit b lives in byte b / 8, mask 1 << (b % 8). Storage grows on set() and
//! never shrinks; is_set() beyond the end is false without growing.
//! The byte form (`as_bytes` / `from_bytes`) is what travels in GET_LSN_MAP
//! responses and what backup metadata persists.

use byteorder::{ByteOrder, NativeEndian};

use crate::consts::BLCKSZ;
use crate::error::PioResult;
use crate::pio::PioRead;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBitmap {
    bits: Vec<u8>,
}

impl PageBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bits: bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn set(&mut self, block: u32) {
        let idx = (block / 8) as usize;
        if idx >= self.bits.len() {
            self.bits.resize(idx + 1, 0);
        }
        self.bits[idx] |= 1 << (block % 8);
    }

    pub fn is_set(&self, block: u32) -> bool {
        match self.bits.get((block / 8) as usize) {
            Some(byte) => byte & (1 << (block % 8)) != 0,
            None => false,
        }
    }

    /// Ascending set block numbers. Borrowing iterator; request a new one to rescan.
    pub fn iterate(&self) -> PageIter<'_> {
        PageIter {
            bits: &self.bits,
            byte: 0,
            pending: self.bits.first().copied().unwrap_or(0),
        }
    }
}

pub struct PageIter<'a> {
    bits: &'a [u8],
    byte: usize,
    /// Unvisited bits of bits[byte].
    pending: u8,
}

impl Iterator for PageIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if self.byte >= self.bits.len() {
                return None;
            }
            if self.pending != 0 {
                let bit = self.pending.trailing_zeros();
                self.pending &= self.pending - 1;
                return Some(self.byte as u32 * 8 + bit);
            }
            self.byte += 1;
            self.pending = self.bits.get(self.byte).copied().unwrap_or(0);
        }
    }
}

/// LSN stored in a page header: pd_lsn = { xlogid u32, xrecoff u32 }.
#[inline]
pub fn page_lsn(page: &[u8]) -> u64 {
    let hi = NativeEndian::read_u32(&page[0..4]) as u64;
    let lo = NativeEndian::read_u32(&page[4..8]) as u64;
    (hi << 32) | lo
}

/// Scan up to n_blocks pages and mark those with page LSN >= horizon_lsn.
/// All-zero pages (never initialised) are skipped; a short final page ends the scan.
pub fn build_lsn_map<R: PioRead + ?Sized>(
    src: &mut R,
    n_blocks: u32,
    horizon_lsn: u64,
) -> PioResult<PageBitmap> {
    let mut map = PageBitmap::new();
    let mut page = vec![0u8; BLCKSZ];

    for blkno in 0..n_blocks {
        let mut filled = 0usize;
        while filled < BLCKSZ {
            let n = src.pio_read(&mut page[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < BLCKSZ {
            break;
        }
        if page.iter().all(|&b| b == 0) {
            continue;
        }
        if page_lsn(&page) >= horizon_lsn {
            map.set(blkno);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_sets_iterate_ascending() {
        let mut m = PageBitmap::new();
        for b in [9, 3, 1000, 3] {
            m.set(b);
        }
        assert_eq!(m.iterate().collect::<Vec<_>>(), vec![3, 9, 1000]);
        assert_eq!(m.count(), 3);
        assert!(!m.is_set(4));
        assert!(!m.is_set(1_000_000));
        assert_eq!(m.as_bytes().len(), 1000 / 8 + 1);
    }

    #[test]
    fn empty_bitmap() {
        let m = PageBitmap::new();
        assert_eq!(m.iterate().next(), None);
        assert!(m.is_empty());
    }

    #[test]
    fn lsn_map_marks_new_pages() {
        let mut file = Vec::new();
        for lsn in [0x10u64, 0, 0x2_0000_0000, 0x30] {
            let mut page = vec![0u8; BLCKSZ];
            if lsn != 0 {
                NativeEndian::write_u32(&mut page[0..4], (lsn >> 32) as u32);
                NativeEndian::write_u32(&mut page[4..8], lsn as u32);
                page[100] = 1;
            }
            file.extend_from_slice(&page);
        }
        let mut src: &[u8] = &file;
        let map = build_lsn_map(&mut src, 10, 0x20).unwrap();
        assert_eq!(map.iterate().collect::<Vec<_>>(), vec![2, 3]);
    }
}
