//! control/image: validated pg_control image.
//!
//! parse():
//! - size must equal layout.file_size (SizeMismatch), checked before any read;
//! - CRC32C over [0, crc) must equal the stored crc (ChecksumMismatch);
//!   an incompatible major-version layout almost always fails here;
//! - pg_control_version must look sane in native byte order (ByteOrderMismatch).
//!
//! serialize() recomputes the CRC and returns the whole fixed-size block.
//! Bytes the layout does not name are carried through untouched.

use byteorder::{ByteOrder, NativeEndian};

use super::layout::ControlLayout;
use crate::error::{PioError, PioResult};

/// Recovery start position: (lsn, timeline) plus the data checksum version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RedoParams {
    pub lsn: u64,
    pub tli: u32,
    pub checksum_version: u32,
}

#[derive(Debug, Clone)]
pub struct ControlFileImage {
    raw: Vec<u8>,
    layout: ControlLayout,
}

/// CRC32C of the bytes preceding the checksum field.
#[inline]
pub fn control_crc(bytes: &[u8], layout: &ControlLayout) -> u32 {
    crc32c::crc32c(&bytes[..layout.crc])
}

/// Heuristic from pg_controldata: a version whose low 16 bits are zero or
/// implausibly large while the high 16 bits are set was written byte-swapped.
#[inline]
fn looks_byte_swapped(version: u32) -> bool {
    let low = version % 65536;
    (low == 0 || low > 10000) && version / 65536 != 0
}

impl ControlFileImage {
    /// Parse with the default (PostgreSQL 12..16, 64-bit) layout.
    pub fn parse(bytes: &[u8]) -> PioResult<Self> {
        Self::parse_with_layout(bytes, ControlLayout::default())
    }

    pub fn parse_with_layout(bytes: &[u8], layout: ControlLayout) -> PioResult<Self> {
        if bytes.len() != layout.file_size {
            return Err(PioError::SizeMismatch {
                expected: layout.file_size,
                actual: bytes.len(),
            });
        }

        let stored = NativeEndian::read_u32(&bytes[layout.crc..layout.crc + 4]);
        let calculated = control_crc(bytes, &layout);
        if stored != calculated {
            return Err(PioError::ChecksumMismatch { stored, calculated });
        }

        let version = NativeEndian::read_u32(&bytes[layout.pg_control_version..]);
        if looks_byte_swapped(version) {
            return Err(PioError::ByteOrderMismatch { version });
        }

        Ok(Self {
            raw: bytes.to_vec(),
            layout,
        })
    }

    /// Fixed-size block with a freshly computed CRC.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.raw.clone();
        let crc = control_crc(&out, &self.layout);
        let off = self.layout.crc;
        NativeEndian::write_u32(&mut out[off..off + 4], crc);
        out
    }

    pub fn layout(&self) -> &ControlLayout {
        &self.layout
    }

    #[inline]
    fn u32_at(&self, off: usize) -> u32 {
        NativeEndian::read_u32(&self.raw[off..off + 4])
    }

    #[inline]
    fn u64_at(&self, off: usize) -> u64 {
        NativeEndian::read_u64(&self.raw[off..off + 8])
    }

    pub fn system_identifier(&self) -> u64 {
        self.u64_at(self.layout.system_identifier)
    }

    pub fn pg_control_version(&self) -> u32 {
        self.u32_at(self.layout.pg_control_version)
    }

    /// DBState as stored (0 = starting up ... 6 = in production).
    pub fn state(&self) -> u32 {
        self.u32_at(self.layout.state)
    }

    pub fn checkpoint(&self) -> u64 {
        self.u64_at(self.layout.checkpoint)
    }

    pub fn checkpoint_redo(&self) -> u64 {
        self.u64_at(self.layout.checkpoint_redo)
    }

    pub fn checkpoint_timeline(&self) -> u32 {
        self.u32_at(self.layout.checkpoint_tli)
    }

    pub fn min_recovery_point(&self) -> u64 {
        self.u64_at(self.layout.min_recovery_point)
    }

    pub fn min_recovery_point_tli(&self) -> u32 {
        self.u32_at(self.layout.min_recovery_point_tli)
    }

    pub fn backup_start_point(&self) -> u64 {
        self.u64_at(self.layout.backup_start_point)
    }

    pub fn blcksz(&self) -> u32 {
        self.u32_at(self.layout.blcksz)
    }

    pub fn xlog_seg_size(&self) -> u32 {
        self.u32_at(self.layout.xlog_seg_size)
    }

    pub fn data_checksum_version(&self) -> u32 {
        self.u32_at(self.layout.data_checksum_version)
    }

    /// Stored CRC (stale after an edit until serialize()).
    pub fn crc(&self) -> u32 {
        self.u32_at(self.layout.crc)
    }

    /// Overwrite minRecoveryPoint; serialize() recomputes the CRC.
    pub fn set_min_recovery_point(&mut self, lsn: u64) {
        let off = self.layout.min_recovery_point;
        NativeEndian::write_u64(&mut self.raw[off..off + 8], lsn);
    }

    /// Earliest position recovery must start from.
    ///
    /// Checkpoint redo first; a non-zero minRecoveryPoint below it wins with
    /// its own timeline; a non-zero backupStartPoint below the result wins
    /// but keeps the checkpoint timeline.
    pub fn redo(&self) -> RedoParams {
        let mut lsn = self.checkpoint_redo();
        let mut tli = self.checkpoint_timeline();

        let min_rec = self.min_recovery_point();
        if min_rec > 0 && min_rec < lsn {
            lsn = min_rec;
            tli = self.min_recovery_point_tli();
        }

        let backup_start = self.backup_start_point();
        if backup_start > 0 && backup_start < lsn {
            lsn = backup_start;
            tli = self.checkpoint_timeline();
        }

        RedoParams {
            lsn,
            tli,
            checksum_version: self.data_checksum_version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::layout::LAYOUT_PG12_16;

    fn image_with(version: u32) -> Vec<u8> {
        let l = LAYOUT_PG12_16;
        let mut b = vec![0u8; l.file_size];
        NativeEndian::write_u32(&mut b[l.pg_control_version..], version);
        let crc = control_crc(&b, &l);
        NativeEndian::write_u32(&mut b[l.crc..l.crc + 4], crc);
        b
    }

    #[test]
    fn byte_swapped_version_is_rejected() {
        assert!(ControlFileImage::parse(&image_with(1300)).is_ok());
        let swapped = 1300u32.swap_bytes();
        match ControlFileImage::parse(&image_with(swapped)) {
            Err(PioError::ByteOrderMismatch { version }) => assert_eq!(version, swapped),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn byte_order_heuristic() {
        assert!(!looks_byte_swapped(1300));
        assert!(!looks_byte_swapped(942));
        assert!(looks_byte_swapped(0x0001_0000));
        assert!(looks_byte_swapped(1300u32.swap_bytes()));
    }
}
