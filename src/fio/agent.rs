//! fio/agent: serving side of the protocol.
//!
//! Runs in the helper process (`pgpio agent`) on stdin/stdout, or on any
//! Read/Write pair in tests. Every request is executed against LocalDrive;
//! per-connection maps hold open files and directory cursors by the
//! caller-chosen handle. The loop ends on DISCONNECT or at end of input.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};

use log::{debug, error, info, warn};

use super::compat::CompatibilityRecord;
use super::header::{
    FioHeader, Opcode, CRC32_DECOMPRESS, CRC32_MISSING_OK, CRC32_TRUNCATED, FIO_OK, MKDIR_STRICT, STAT_FOLLOW,
};
use super::{as_str, encode_stat, pack_u32, pack_u64, split_nul, unpack_u32, unpack_u64};
use crate::consts::{
    AGENT_PROTOCOL_VERSION, CHUNK_SIZE, DEFAULT_EDITION, FIO_HDR_SIZE, FIO_PROTOCOL_VIOLATION, MAX_PAYLOAD_SIZE,
    PG_MAJORVERSION, PIPE_SIZE,
};
use crate::error::{PioError, PioResult};
use crate::page::{read_pages, BlockDigest, PageSelection, SentPage};
use crate::pio::{ListDirOptions, LocalDrive, LocalFile, OpenFlags, PioDrive, PioFile, PioRead, PioWriteFlush};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub protocol_version: u32,
    pub compat: CompatibilityRecord,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            protocol_version: AGENT_PROTOCOL_VERSION,
            compat: CompatibilityRecord::local(PG_MAJORVERSION, DEFAULT_EDITION),
        }
    }
}

struct AgentFile {
    file: LocalFile,
    /// First failed async write, kept until GET_ASYNC_ERROR or CLOSE.
    async_err: Option<(i32, String)>,
}

struct Agent<W: Write> {
    out: BufWriter<W>,
    drive: LocalDrive,
    files: HashMap<u32, AgentFile>,
    dirs: HashMap<u32, std::vec::IntoIter<String>>,
    opts: AgentOptions,
}

/// Outcome of one request.
enum Reply {
    /// Success with payload.
    Data(Vec<u8>),
    /// Failure folded to errno + message.
    Fail(PioError),
    /// Unknown handle or malformed request.
    Violation(String),
    /// Already answered (streams) or no answer at all (async writes).
    Done,
    /// Stop serving.
    Exit,
}

impl From<PioResult<Vec<u8>>> for Reply {
    fn from(r: PioResult<Vec<u8>>) -> Self {
        match r {
            Ok(d) => Reply::Data(d),
            Err(PioError::Protocol(msg)) => Reply::Violation(msg),
            Err(e) => Reply::Fail(e),
        }
    }
}

fn ok() -> PioResult<Vec<u8>> {
    Ok(Vec::new())
}

/// Serve requests until DISCONNECT or end of input.
pub fn serve<R: Read, W: Write>(reader: R, writer: W, opts: AgentOptions) -> PioResult<()> {
    let mut input = BufReader::with_capacity(PIPE_SIZE, reader);
    let mut agent = Agent {
        out: BufWriter::with_capacity(PIPE_SIZE, writer),
        drive: LocalDrive::new(),
        files: HashMap::new(),
        dirs: HashMap::new(),
        opts,
    };

    loop {
        let mut hb = [0u8; FIO_HDR_SIZE];
        match input.read_exact(&mut hb) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("agent: input closed, {} file(s) still open", agent.files.len());
                return Ok(());
            }
            Err(e) => return Err(PioError::TransportIo(e)),
        }
        let hdr = FioHeader::decode(&hb);
        let size = hdr.size as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(PioError::Protocol(format!("request payload of {size} bytes exceeds limit")));
        }
        let mut payload = vec![0u8; size];
        input.read_exact(&mut payload).map_err(PioError::TransportIo)?;

        let reply = agent.dispatch(&hdr, &payload)?;
        match reply {
            Reply::Data(data) => agent.respond(hdr.cop, hdr.handle, FIO_OK, &data)?,
            Reply::Fail(e) => {
                let (code, msg) = e.to_errno();
                agent.respond(hdr.cop, hdr.handle, code as u32, msg.as_bytes())?
            }
            Reply::Violation(msg) => {
                warn!("agent: protocol violation: {}", msg);
                agent.respond(hdr.cop, hdr.handle, FIO_PROTOCOL_VIOLATION, msg.as_bytes())?
            }
            Reply::Done => {}
            Reply::Exit => {
                agent.files.clear();
                info!("agent: disconnected");
                return Ok(());
            }
        }
    }
}

fn write_frame<W: Write>(out: &mut BufWriter<W>, cop: u32, handle: u32, arg: u32, data: &[u8]) -> PioResult<()> {
    let hdr = FioHeader {
        cop,
        handle,
        size: data.len() as u32,
        arg,
    };
    out.write_all(&hdr.encode()).map_err(PioError::TransportIo)?;
    out.write_all(data).map_err(PioError::TransportIo)
}

impl<W: Write> Agent<W> {
    fn frame(&mut self, cop: u32, handle: u32, arg: u32, data: &[u8]) -> PioResult<()> {
        write_frame(&mut self.out, cop, handle, arg, data)
    }

    fn respond(&mut self, cop: u32, handle: u32, arg: u32, data: &[u8]) -> PioResult<()> {
        self.frame(cop, handle, arg, data)?;
        self.out.flush().map_err(PioError::TransportIo)
    }

    fn stream_error(&mut self, handle: u32, e: &PioError) -> PioResult<()> {
        let (code, msg) = e.to_errno();
        self.respond(Opcode::Error as u32, handle, code as u32, msg.as_bytes())
    }

    fn file(&mut self, handle: u32) -> PioResult<&mut AgentFile> {
        self.files
            .get_mut(&handle)
            .ok_or_else(|| PioError::Protocol(format!("unknown handle {handle}")))
    }

    fn dispatch(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<Reply> {
        let op = match hdr.opcode() {
            Ok(op) => op,
            Err(cop) => return Ok(Reply::Violation(format!("unknown opcode {cop}"))),
        };

        let reply: Reply = match op {
            Opcode::AgentVersion => {
                let compat = self.opts.compat.serialize();
                self.respond(hdr.cop, hdr.handle, self.opts.protocol_version, compat.as_bytes())?;
                Reply::Done
            }
            Opcode::Disconnect => {
                self.respond(Opcode::Disconnected as u32, hdr.handle, FIO_OK, &[])?;
                Reply::Exit
            }
            Opcode::Open => self.open(hdr, payload).into(),
            Opcode::Close => self.close(hdr).into(),
            Opcode::Write => self
                .file(hdr.handle)
                .and_then(|f| f.file.pio_write(payload))
                .and_then(|_| ok())
                .into(),
            Opcode::WriteAsync => {
                match self.files.get_mut(&hdr.handle) {
                    Some(f) => {
                        if f.async_err.is_none() {
                            if let Err(e) = f.file.pio_write(payload) {
                                warn!("agent: async write to {} failed: {}", f.file.path(), e);
                                f.async_err = Some(e.to_errno());
                            }
                        }
                    }
                    None => error!("agent: async write for unknown handle {}", hdr.handle),
                }
                Reply::Done
            }
            Opcode::GetAsyncError => match self.file(hdr.handle) {
                Ok(f) => match f.async_err.take() {
                    Some((code, msg)) => {
                        self.respond(hdr.cop, hdr.handle, code as u32, msg.as_bytes())?;
                        Reply::Done
                    }
                    None => Reply::Data(Vec::new()),
                },
                Err(e) => Reply::from(Err(e)),
            },
            Opcode::SyncFile => self
                .file(hdr.handle)
                .and_then(|f| f.file.sync())
                .and_then(|_| ok())
                .into(),
            Opcode::Seek => {
                let r = unpack_u64(payload)
                    .and_then(|offs| self.file(hdr.handle).and_then(|f| f.file.seek(offs)))
                    .map(|pos| pack_u64(pos).to_vec());
                r.into()
            }
            Opcode::Truncate => unpack_u64(payload)
                .and_then(|size| self.file(hdr.handle).and_then(|f| f.file.truncate(size)))
                .and_then(|_| ok())
                .into(),
            Opcode::Pread => {
                let len = (hdr.arg as usize).min(MAX_PAYLOAD_SIZE);
                unpack_u64(payload)
                    .and_then(|offs| {
                        let f = self.file(hdr.handle)?;
                        let mut buf = vec![0u8; len];
                        let n = f.file.pread(&mut buf, offs)?;
                        buf.truncate(n);
                        Ok(buf)
                    })
                    .into()
            }
            Opcode::Read => {
                let len = (hdr.arg as usize).min(MAX_PAYLOAD_SIZE);
                self.file(hdr.handle)
                    .and_then(|f| {
                        let mut buf = vec![0u8; len];
                        let n = f.file.pio_read(&mut buf)?;
                        buf.truncate(n);
                        Ok(buf)
                    })
                    .into()
            }
            Opcode::Opendir => self.opendir(hdr, payload).into(),
            Opcode::Readdir => match self.dirs.get_mut(&hdr.handle) {
                Some(it) => Reply::Data(it.next().map(String::into_bytes).unwrap_or_default()),
                None => Reply::Violation(format!("unknown dir handle {}", hdr.handle)),
            },
            Opcode::Closedir => match self.dirs.remove(&hdr.handle) {
                Some(_) => Reply::Data(Vec::new()),
                None => Reply::Violation(format!("unknown dir handle {}", hdr.handle)),
            },
            Opcode::SendFile => {
                self.send_file(hdr, payload)?;
                Reply::Done
            }
            Opcode::ListDir => {
                self.list_dir(hdr, payload)?;
                Reply::Done
            }
            Opcode::SendPages => {
                self.send_pages(hdr, payload)?;
                Reply::Done
            }
            _ => self.path_op(op, hdr, payload).into(),
        };
        Ok(reply)
    }

    fn open(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<Vec<u8>> {
        if self.files.contains_key(&hdr.handle) {
            return Err(PioError::Protocol(format!("handle {} is already open", hdr.handle)));
        }
        let perms = unpack_u32(payload)?;
        let path = as_str(&payload[4..])?;
        let file = self.drive.open_local(path, OpenFlags(hdr.arg), perms)?;
        debug!("agent: open {} as handle {}", path, hdr.handle);
        self.files.insert(hdr.handle, AgentFile { file, async_err: None });
        ok()
    }

    fn close(&mut self, hdr: &FioHeader) -> PioResult<Vec<u8>> {
        let f = self
            .files
            .remove(&hdr.handle)
            .ok_or_else(|| PioError::Protocol(format!("unknown handle {}", hdr.handle)))?;
        let path = f.file.path().to_string();
        let closed = Box::new(f.file).close(hdr.arg != 0);
        if let Some((code, msg)) = f.async_err {
            return Err(PioError::from_errno(code, &path, &msg));
        }
        closed?;
        ok()
    }

    fn opendir(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<Vec<u8>> {
        if self.dirs.contains_key(&hdr.handle) {
            return Err(PioError::Protocol(format!("dir handle {} is already open", hdr.handle)));
        }
        let path = as_str(payload)?;
        let names = self.drive.read_dir(path)?;
        self.dirs.insert(hdr.handle, names.into_iter());
        ok()
    }

    fn send_file(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<()> {
        let path = match as_str(payload) {
            Ok(p) => p.to_string(),
            Err(e) => return self.stream_error(hdr.handle, &e),
        };
        let mut file = match self.drive.open_local(&path, OpenFlags::READ, 0) {
            Ok(f) => f,
            Err(e) => return self.stream_error(hdr.handle, &e),
        };
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            match file.pio_read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.frame(Opcode::SendFileContent as u32, hdr.handle, 0, &buf[..n])?;
                    total += n as u64;
                }
                Err(e) => return self.stream_error(hdr.handle, &e),
            }
        }
        debug!("agent: sent {} ({} bytes)", path, total);
        self.respond(Opcode::SendFileEof as u32, hdr.handle, FIO_OK, &[])
    }

    fn list_dir(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<()> {
        let parsed = unpack_u32(payload).and_then(|ext| Ok((ext as i32, as_str(&payload[4..])?.to_string())));
        let (external_dir_num, root) = match parsed {
            Ok(v) => v,
            Err(e) => return self.stream_error(hdr.handle, &e),
        };
        let opts = ListDirOptions::from_bits(hdr.arg, external_dir_num);
        let mut files = Vec::new();
        if let Err(e) = self.drive.list_dir(&mut files, &root, &opts) {
            return self.stream_error(hdr.handle, &e);
        }
        for f in &files {
            let json = serde_json::to_vec(f).map_err(|e| PioError::Protocol(format!("encode entry: {e}")))?;
            self.frame(Opcode::ListDir as u32, hdr.handle, 0, &json)?;
        }
        self.respond(Opcode::SendFileEof as u32, hdr.handle, FIO_OK, &[])
    }

    /// PAGE / PAGE_ZERO frames (block number in `arg`) closed by
    /// SEND_FILE_EOF (`arg` = blocks read), SEND_FILE_CORRUPTION
    /// (`arg` = block number, payload = reason) or ERROR.
    fn send_pages(&mut self, hdr: &FioHeader, payload: &[u8]) -> PioResult<()> {
        let parsed = PageSelection::decode(payload)
            .and_then(|(sel, used)| Ok((sel, as_str(&payload[used..])?.to_string())));
        let (sel, path) = match parsed {
            Ok(v) => v,
            Err(e) => return self.stream_error(hdr.handle, &e),
        };
        let mut file = match self.drive.open_local(&path, OpenFlags::READ, 0) {
            Ok(f) => f,
            Err(e) => return self.stream_error(hdr.handle, &e),
        };

        let handle = hdr.handle;
        let out = &mut self.out;
        let res = read_pages(&mut file, hdr.arg, &sel, &mut |page| match page {
            SentPage::Data { blkno, page } => write_frame(out, Opcode::Page as u32, handle, blkno, page),
            SentPage::Zero { blkno } => write_frame(out, Opcode::PageZero as u32, handle, blkno, &[]),
        });
        match res {
            Ok(sent) => {
                debug!(
                    "agent: sent {} pages, {} zero pages of {} ({} blocks read)",
                    sent.pages, sent.zero_pages, path, sent.blocks_read
                );
                self.respond(Opcode::SendFileEof as u32, handle, sent.blocks_read, &[])
            }
            Err(PioError::PageCorruption { blkno, msg, .. }) => {
                self.respond(Opcode::SendFileCorruption as u32, handle, blkno, msg.as_bytes())
            }
            Err(e @ PioError::TransportIo(_)) => Err(e),
            Err(e) => self.stream_error(handle, &e),
        }
    }

    /// Requests that address a path rather than a handle.
    fn path_op(&mut self, op: Opcode, hdr: &FioHeader, payload: &[u8]) -> PioResult<Vec<u8>> {
        let drive = &self.drive;
        match op {
            Opcode::Stat => {
                let st = drive.stat(as_str(payload)?, hdr.arg & STAT_FOLLOW != 0)?;
                Ok(encode_stat(&st).to_vec())
            }
            Opcode::Access => {
                let path = as_str(payload)?;
                if drive.exists(path)? {
                    ok()
                } else {
                    Err(PioError::NotFound { path: path.to_string() })
                }
            }
            Opcode::Remove => drive.remove(as_str(payload)?, hdr.arg != 0).and_then(|_| ok()),
            Opcode::Rename => {
                let (old, new) = split_nul(payload)?;
                drive.rename(old, new).and_then(|_| ok())
            }
            Opcode::Symlink => {
                let (target, link) = split_nul(payload)?;
                drive.symlink(target, link, hdr.arg != 0).and_then(|_| ok())
            }
            Opcode::Mkdir => {
                let strict = hdr.arg & MKDIR_STRICT != 0;
                drive
                    .make_dir(as_str(payload)?, hdr.arg & 0o7777, strict)
                    .and_then(|_| ok())
            }
            Opcode::Chmod => drive.chmod(as_str(payload)?, hdr.arg).and_then(|_| ok()),
            Opcode::Sync => drive.sync_path(as_str(payload)?).and_then(|_| ok()),
            Opcode::Readlink => drive.readlink(as_str(payload)?).map(String::into_bytes),
            Opcode::Load => {
                let path = as_str(payload)?;
                let st = drive.stat(path, true)?;
                if st.size as usize > MAX_PAYLOAD_SIZE {
                    return Err(PioError::Other {
                        path: path.to_string(),
                        code: 27,
                        msg: format!("file of {} bytes is too large to load", st.size),
                    });
                }
                match drive.read_file(path, false)? {
                    Some(data) => Ok(data),
                    None => Err(PioError::NotFound { path: path.to_string() }),
                }
            }
            Opcode::GetCrc32 => {
                let path = as_str(payload)?;
                let missing_ok = hdr.arg & CRC32_MISSING_OK != 0;
                let crc = if hdr.arg & CRC32_TRUNCATED != 0 {
                    drive.get_crc32_truncated(path, missing_ok)?
                } else {
                    drive.get_crc32(path, hdr.arg & CRC32_DECOMPRESS != 0, missing_ok)?
                };
                Ok(pack_u32(crc).to_vec())
            }
            Opcode::GetLsnMap => {
                let horizon = unpack_u64(payload)?;
                let path = as_str(&payload[8..])?;
                Ok(drive.get_lsn_map(path, hdr.arg, horizon)?.into_bytes())
            }
            Opcode::GetChecksumMap => {
                let checksum_version = unpack_u32(payload)?;
                let path = as_str(&payload[4..])?;
                let map = drive.get_checksum_map(path, hdr.arg, checksum_version)?;
                Ok(BlockDigest::encode_all(&map))
            }
            Opcode::RemoveDir => drive.remove_dir(as_str(payload)?, hdr.arg != 0).and_then(|_| ok()),
            Opcode::CheckPostmaster => Ok(pack_u32(drive.check_postmaster(as_str(payload)?)?).to_vec()),
            Opcode::FilesAreSame => {
                let (a, b) = split_nul(payload)?;
                Ok(vec![drive.files_are_same(a, b)? as u8])
            }
            other => Err(PioError::Protocol(format!("opcode {:?} is not served", other))),
        }
    }
}
