//! fio: remote agent protocol.
//!
//! One ordered byte stream per direction (child stdin/stdout, or any
//! Read/Write pair). Every frame is a 16-byte header plus `size` payload bytes.
//!
//! Request/response rules:
//! - a response echoes the request opcode and handle;
//! - `arg` is 0 on success or an errno; on error the payload is a message;
//!   FIO_PROTOCOL_VIOLATION marks an unknown handle or malformed request;
//! - WRITE_ASYNC has no response; the first failure per handle is kept by
//!   the agent and reported by GET_ASYNC_ERROR / CLOSE;
//! - SEND_FILE, SEND_PAGES and LIST_DIR answer with a run of data frames
//!   closed by a SEND_FILE_EOF frame, or an ERROR frame carrying errno +
//!   message; SEND_PAGES may also end with SEND_FILE_CORRUPTION;
//! - DISCONNECT is answered by DISCONNECTED, then the agent exits.
//!
//! Payloads (all integers LE):
//!   OPEN        permissions u32 | path          arg = OpenFlags
//!   RENAME etc. path1 \0 path2
//!   SEEK/TRUNC  u64
//!   PREAD       offset u64                      arg = length
//!   STAT resp   size i64 | mtime i64 | mode u32 | kind u32
//!   GET_LSN_MAP horizon u64 | path              arg = n_blocks
//!   GET_CHECKSUM_MAP checksum version u32 | path arg = n_blocks;
//!               response: (lsn u64 | checksum u32) per block read
//!   SEND_PAGES  horizon u64 | map len u32 | map | path   arg = n_blocks;
//!               PAGE frames carry one block (arg = block number),
//!               PAGE_ZERO frames only the block number; EOF arg = blocks
//!               read; SEND_FILE_CORRUPTION arg = bad block, payload = reason
//!   LIST_DIR    external dir num i32 | path     arg = option bits;
//!               each entry frame carries one JSON PgFile

pub mod agent;
pub mod client;
pub mod compat;
pub mod header;
pub mod launch;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{PioError, PioResult};
use crate::pio::{FileKind, PioStat};

pub use agent::{serve, AgentOptions};
pub use client::FioClient;
pub use compat::{normalize_edition, CompatibilityRecord};
pub use header::{FioHeader, Opcode};
pub use launch::{build_ssh_argv, launch_agent, remote_invocation, spawn_agent, AgentConnection};

pub const STAT_PAYLOAD_SIZE: usize = 24;

pub(crate) fn malformed(what: &str) -> PioError {
    PioError::Protocol(format!("malformed {what} payload"))
}

pub(crate) fn pack_u64(v: u64) -> [u8; 8] {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    b
}

pub(crate) fn unpack_u64(b: &[u8]) -> PioResult<u64> {
    if b.len() < 8 {
        return Err(malformed("u64"));
    }
    Ok(LittleEndian::read_u64(&b[..8]))
}

pub(crate) fn pack_u32(v: u32) -> [u8; 4] {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    b
}

pub(crate) fn unpack_u32(b: &[u8]) -> PioResult<u32> {
    if b.len() < 4 {
        return Err(malformed("u32"));
    }
    Ok(LittleEndian::read_u32(&b[..4]))
}

pub(crate) fn join_nul(a: &str, b: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(a.len() + b.len() + 1);
    v.extend_from_slice(a.as_bytes());
    v.push(0);
    v.extend_from_slice(b.as_bytes());
    v
}

pub(crate) fn as_str(b: &[u8]) -> PioResult<&str> {
    std::str::from_utf8(b).map_err(|_| malformed("utf-8 string"))
}

pub(crate) fn split_nul(b: &[u8]) -> PioResult<(&str, &str)> {
    let pos = b.iter().position(|&c| c == 0).ok_or_else(|| malformed("path pair"))?;
    Ok((as_str(&b[..pos])?, as_str(&b[pos + 1..])?))
}

pub(crate) fn encode_stat(st: &PioStat) -> [u8; STAT_PAYLOAD_SIZE] {
    let mut b = [0u8; STAT_PAYLOAD_SIZE];
    LittleEndian::write_i64(&mut b[0..8], st.size);
    LittleEndian::write_i64(&mut b[8..16], st.mtime);
    LittleEndian::write_u32(&mut b[16..20], st.mode);
    LittleEndian::write_u32(&mut b[20..24], st.kind as u32);
    b
}

pub(crate) fn decode_stat(b: &[u8]) -> PioResult<PioStat> {
    if b.len() != STAT_PAYLOAD_SIZE {
        return Err(malformed("stat"));
    }
    Ok(PioStat {
        size: LittleEndian::read_i64(&b[0..8]),
        mtime: LittleEndian::read_i64(&b[8..16]),
        mode: LittleEndian::read_u32(&b[16..20]),
        kind: FileKind::from_u32(LittleEndian::read_u32(&b[20..24])),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_payload_layout() {
        let st = PioStat {
            size: 8192,
            mtime: 1_700_000_000,
            mode: 0o100600,
            kind: FileKind::Regular,
        };
        let b = encode_stat(&st);
        assert_eq!(&b[0..8], &8192i64.to_le_bytes());
        assert_eq!(decode_stat(&b).unwrap(), st);
        assert!(decode_stat(&b[..10]).is_err());
    }

    #[test]
    fn nul_pairs() {
        let v = join_nul("a/b", "c");
        assert_eq!(split_nul(&v).unwrap(), ("a/b", "c"));
        assert!(split_nul(b"no-separator").is_err());
    }
}
