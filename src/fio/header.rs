//! fio/header: 16-byte frame header and the opcode table.
//!
//! Layout (LE):
//!   cop    u32 opcode
//!   handle u32 caller-chosen file/dir handle (0 when unused)
//!   size   u32 payload bytes that follow
//!   arg    u32 opcode-specific argument / result code
//!
//! Opcode numbers are stable for one protocol version; new opcodes append.

use byteorder::{ByteOrder, LittleEndian};
use std::convert::TryFrom;

use crate::consts::FIO_HDR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    AgentVersion = 0,
    Open,
    Close,
    Write,
    Sync,
    Rename,
    Symlink,
    Remove,
    Mkdir,
    Chmod,
    Seek,
    Truncate,
    Pread,
    Read,
    Load,
    Stat,
    Send,
    Access,
    Opendir,
    Readdir,
    Closedir,
    Page,
    WriteCompressedAsync,
    GetCrc32,
    GetChecksumMap,
    GetLsnMap,
    SendPages,
    Error,
    SendFile,
    SendFileEof,
    SendFileCorruption,
    SendFileHeaders,
    Disconnect,
    Disconnected,
    ListDir,
    RemoveDir,
    CheckPostmaster,
    GetAsyncError,
    WriteAsync,
    Readlink,
    SyncFile,
    SendFileContent,
    PageZero,
    FilesAreSame,
}

const OPCODES: [Opcode; 44] = [
    Opcode::AgentVersion,
    Opcode::Open,
    Opcode::Close,
    Opcode::Write,
    Opcode::Sync,
    Opcode::Rename,
    Opcode::Symlink,
    Opcode::Remove,
    Opcode::Mkdir,
    Opcode::Chmod,
    Opcode::Seek,
    Opcode::Truncate,
    Opcode::Pread,
    Opcode::Read,
    Opcode::Load,
    Opcode::Stat,
    Opcode::Send,
    Opcode::Access,
    Opcode::Opendir,
    Opcode::Readdir,
    Opcode::Closedir,
    Opcode::Page,
    Opcode::WriteCompressedAsync,
    Opcode::GetCrc32,
    Opcode::GetChecksumMap,
    Opcode::GetLsnMap,
    Opcode::SendPages,
    Opcode::Error,
    Opcode::SendFile,
    Opcode::SendFileEof,
    Opcode::SendFileCorruption,
    Opcode::SendFileHeaders,
    Opcode::Disconnect,
    Opcode::Disconnected,
    Opcode::ListDir,
    Opcode::RemoveDir,
    Opcode::CheckPostmaster,
    Opcode::GetAsyncError,
    Opcode::WriteAsync,
    Opcode::Readlink,
    Opcode::SyncFile,
    Opcode::SendFileContent,
    Opcode::PageZero,
    Opcode::FilesAreSame,
];

impl TryFrom<u32> for Opcode {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        OPCODES.get(v as usize).copied().ok_or(v)
    }
}

/// GET_CRC32 `arg` bits.
pub const CRC32_DECOMPRESS: u32 = 0x1;
pub const CRC32_TRUNCATED: u32 = 0x2;
pub const CRC32_MISSING_OK: u32 = 0x4;

/// STAT `arg`: follow symlinks.
pub const STAT_FOLLOW: u32 = 0x1;

/// MKDIR `arg`: permission bits, plus this bit for strict mode.
pub const MKDIR_STRICT: u32 = 0x8000_0000;

/// `arg` in a response: 0 = success, otherwise errno.
pub const FIO_OK: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FioHeader {
    pub cop: u32,
    pub handle: u32,
    pub size: u32,
    pub arg: u32,
}

impl FioHeader {
    pub fn new(cop: Opcode, handle: u32, size: u32, arg: u32) -> Self {
        Self {
            cop: cop as u32,
            handle,
            size,
            arg,
        }
    }

    pub fn opcode(&self) -> Result<Opcode, u32> {
        Opcode::try_from(self.cop)
    }

    pub fn encode(&self) -> [u8; FIO_HDR_SIZE] {
        let mut b = [0u8; FIO_HDR_SIZE];
        LittleEndian::write_u32(&mut b[0..4], self.cop);
        LittleEndian::write_u32(&mut b[4..8], self.handle);
        LittleEndian::write_u32(&mut b[8..12], self.size);
        LittleEndian::write_u32(&mut b[12..16], self.arg);
        b
    }

    pub fn decode(b: &[u8; FIO_HDR_SIZE]) -> Self {
        Self {
            cop: LittleEndian::read_u32(&b[0..4]),
            handle: LittleEndian::read_u32(&b[4..8]),
            size: LittleEndian::read_u32(&b[8..12]),
            arg: LittleEndian::read_u32(&b[12..16]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_numbers_are_stable() {
        assert_eq!(Opcode::AgentVersion as u32, 0);
        assert_eq!(Opcode::GetCrc32 as u32, 23);
        assert_eq!(Opcode::Disconnect as u32, 32);
        assert_eq!(Opcode::FilesAreSame as u32, 43);
        for (i, op) in OPCODES.iter().enumerate() {
            assert_eq!(*op as u32, i as u32);
        }
        assert_eq!(Opcode::try_from(44), Err(44));
    }

    #[test]
    fn header_layout_is_little_endian() {
        let h = FioHeader::new(Opcode::Pread, 7, 0x0102, 0xdead_beef);
        let b = h.encode();
        assert_eq!(&b[0..4], &[12, 0, 0, 0]);
        assert_eq!(&b[8..12], &[0x02, 0x01, 0, 0]);
        assert_eq!(FioHeader::decode(&b), h);
    }
}
