//! control/layout: field offsets inside the pg_control image.
//!
//! Decoding reads fixed-width integers at these offsets (native byte order,
//! the same order PostgreSQL used to write the file); nothing is overlaid on
//! the raw buffer.
//!
//! Default layout: PostgreSQL 12..16, 64-bit build (maxalign 8).
//!
//!   system_identifier      u64 @0
//!   pg_control_version     u32 @8
//!   state                  u32 @16
//!   checkPoint             u64 @32
//!   checkPointCopy.redo    u64 @40
//!   checkPointCopy.tli     u32 @48
//!   minRecoveryPoint       u64 @136
//!   minRecoveryPointTLI    u32 @144
//!   backupStartPoint       u64 @152
//!   blcksz                 u32 @216
//!   xlog_seg_size          u32 @228
//!   data_checksum_version  u32 @252
//!   crc (CRC32C)           u32 @288   over bytes [0, 288)

use crate::consts::PG_CONTROL_FILE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLayout {
    /// Size of the whole on-disk block (the struct is zero-padded to it).
    pub file_size: usize,
    pub system_identifier: usize,
    pub pg_control_version: usize,
    pub state: usize,
    pub checkpoint: usize,
    pub checkpoint_redo: usize,
    pub checkpoint_tli: usize,
    pub min_recovery_point: usize,
    pub min_recovery_point_tli: usize,
    pub backup_start_point: usize,
    pub blcksz: usize,
    pub xlog_seg_size: usize,
    pub data_checksum_version: usize,
    /// Offset of the stored CRC; the checksum covers every byte before it.
    pub crc: usize,
}

/// PostgreSQL 12..16 on a 64-bit platform.
pub const LAYOUT_PG12_16: ControlLayout = ControlLayout {
    file_size: PG_CONTROL_FILE_SIZE,
    system_identifier: 0,
    pg_control_version: 8,
    state: 16,
    checkpoint: 32,
    checkpoint_redo: 40,
    checkpoint_tli: 48,
    min_recovery_point: 136,
    min_recovery_point_tli: 144,
    backup_start_point: 152,
    blcksz: 216,
    xlog_seg_size: 228,
    data_checksum_version: 252,
    crc: 288,
};

impl Default for ControlLayout {
    fn default() -> Self {
        LAYOUT_PG12_16
    }
}

impl ControlLayout {
    /// Every field must fit before the checksum and the checksum inside the block.
    pub fn is_consistent(&self) -> bool {
        let fields = [
            (self.system_identifier, 8),
            (self.pg_control_version, 4),
            (self.state, 4),
            (self.checkpoint, 8),
            (self.checkpoint_redo, 8),
            (self.checkpoint_tli, 4),
            (self.min_recovery_point, 8),
            (self.min_recovery_point_tli, 4),
            (self.backup_start_point, 8),
            (self.blcksz, 4),
            (self.xlog_seg_size, 4),
            (self.data_checksum_version, 4),
        ];
        fields.iter().all(|&(off, len)| off + len <= self.crc) && self.crc + 4 <= self.file_size
    }
}
