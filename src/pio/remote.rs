//! Remote backend: each operation is one round trip over the agent
//! protocol, or one enqueue for async writes.

use std::sync::Arc;

use log::{debug, warn};

use super::{
    write_all, ListDirOptions, OpenFlags, PgFile, PioDrive, PioFile, PioRead, PioStat, PioWriteFlush,
};
use crate::consts::{BLCKSZ, CHUNK_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{PioError, PioResult};
use crate::fio::client::{FioClient, HandleKind};
use crate::fio::header::{
    FioHeader, Opcode, CRC32_DECOMPRESS, CRC32_MISSING_OK, CRC32_TRUNCATED, MKDIR_STRICT, STAT_FOLLOW,
};
use crate::fio::{as_str, decode_stat, join_nul, pack_u32, pack_u64, unpack_u32, unpack_u64};
use crate::metrics::record_async_error;
use crate::page::{BlockDigest, PageSelection, PagesSent, SentPage};
use crate::pagemap::PageBitmap;

fn req(op: Opcode, handle: u32, payload: &[u8], arg: u32) -> FioHeader {
    FioHeader::new(op, handle, payload.len() as u32, arg)
}

pub struct RemoteFile {
    client: Arc<FioClient>,
    handle: u32,
    path: String,
    async_mode: bool,
    closed: bool,
}

impl RemoteFile {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    fn call(&self, op: Opcode, payload: &[u8], arg: u32) -> PioResult<Vec<u8>> {
        self.client
            .call_handle(req(op, self.handle, payload, arg), payload, HandleKind::File)
    }
}

impl PioRead for RemoteFile {
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize> {
        let want = buf.len().min(MAX_PAYLOAD_SIZE) as u32;
        let data = self.call(Opcode::Read, &[], want)?;
        if data.len() > buf.len() {
            return Err(PioError::Protocol(format!("read returned {} bytes, asked {}", data.len(), want)));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl PioWriteFlush for RemoteFile {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize> {
        for chunk in buf.chunks(CHUNK_SIZE) {
            if self.async_mode {
                self.client
                    .send_async(req(Opcode::WriteAsync, self.handle, chunk, 0), chunk)?;
            } else {
                self.call(Opcode::Write, chunk, 0)?;
            }
        }
        Ok(buf.len())
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        self.async_error()
    }
}

impl PioFile for RemoteFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn pread(&mut self, buf: &mut [u8], offs: u64) -> PioResult<usize> {
        let want = buf.len().min(MAX_PAYLOAD_SIZE) as u32;
        let data = self.call(Opcode::Pread, &pack_u64(offs), want)?;
        if data.len() > buf.len() {
            return Err(PioError::Protocol(format!("pread returned {} bytes, asked {}", data.len(), want)));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> PioResult<()> {
        self.call(Opcode::Truncate, &pack_u64(size), 0).map(|_| ())
    }

    fn seek(&mut self, offs: u64) -> PioResult<u64> {
        unpack_u64(&self.call(Opcode::Seek, &pack_u64(offs), 0)?)
    }

    fn sync(&mut self) -> PioResult<()> {
        self.call(Opcode::SyncFile, &[], 0).map(|_| ())
    }

    fn close(mut self: Box<Self>, sync: bool) -> PioResult<()> {
        self.closed = true;
        let res = self.call(Opcode::Close, &[], sync as u32).map(|_| ());
        self.client.release_handle(self.handle);
        if let Err(e) = &res {
            if self.async_mode {
                record_async_error();
            }
            debug!("close of remote {} failed: {}", self.path, e);
        }
        res
    }

    fn set_async(&mut self, on: bool) -> PioResult<()> {
        self.async_mode = on;
        Ok(())
    }

    fn async_error(&mut self) -> PioResult<()> {
        match self.call(Opcode::GetAsyncError, &[], 0) {
            Ok(_) => Ok(()),
            Err(e) => {
                record_async_error();
                warn!("async write to remote {} failed: {}", self.path, e);
                Err(e)
            }
        }
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.call(Opcode::Close, &[], 0) {
                debug!("implicit close of remote {}: {}", self.path, e);
            }
            self.client.release_handle(self.handle);
        }
    }
}

/// Drive backed by one agent connection.
#[derive(Clone)]
pub struct RemoteDrive {
    client: Arc<FioClient>,
}

impl RemoteDrive {
    pub fn new(client: Arc<FioClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<FioClient> {
        &self.client
    }

    fn call(&self, op: Opcode, payload: &[u8], arg: u32, path: &str) -> PioResult<Vec<u8>> {
        self.client.call_ok(req(op, 0, payload, arg), payload, path)
    }

    fn crc(&self, path: &str, flags: u32) -> PioResult<u32> {
        unpack_u32(&self.call(Opcode::GetCrc32, path.as_bytes(), flags, path)?)
    }

    fn dir_call(&self, op: Opcode, handle: u32, payload: &[u8]) -> PioResult<Vec<u8>> {
        self.client
            .call_handle(req(op, handle, payload, 0), payload, HandleKind::Dir)
    }

    /// OPENDIR / READDIR until an empty name / CLOSEDIR.
    fn read_dir_with(&self, handle: u32, path: &str) -> PioResult<Vec<String>> {
        self.dir_call(Opcode::Opendir, handle, path.as_bytes())?;
        let mut names = Vec::new();
        loop {
            let name = self.dir_call(Opcode::Readdir, handle, &[])?;
            if name.is_empty() {
                break;
            }
            names.push(as_str(&name)?.to_string());
        }
        self.dir_call(Opcode::Closedir, handle, &[])?;
        Ok(names)
    }

    /// Stream a whole remote file into `sink`. None when missing and missing_ok.
    pub fn send_file(&self, path: &str, sink: &mut dyn PioWriteFlush, missing_ok: bool) -> PioResult<Option<u64>> {
        let mut total = 0u64;
        let res = self.client.call_stream(
            req(Opcode::SendFile, 0, path.as_bytes(), 0),
            path.as_bytes(),
            Opcode::SendFileContent,
            path,
            |chunk| {
                write_all(sink, chunk)?;
                total += chunk.len() as u64;
                Ok(())
            },
        );
        match res {
            Ok(()) => Ok(Some(total)),
            Err(e) if missing_ok && e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl PioDrive for RemoteDrive {
    fn open(&self, path: &str, flags: OpenFlags, permissions: u32) -> PioResult<Box<dyn PioFile>> {
        let handle = self.client.alloc_handle(path, HandleKind::File)?;
        let mut payload = pack_u32(permissions).to_vec();
        payload.extend_from_slice(path.as_bytes());
        let hdr = req(Opcode::Open, handle, &payload, flags.0);
        if let Err(e) = self.client.call_ok(hdr, &payload, path) {
            self.client.release_handle(handle);
            return Err(e);
        }
        Ok(Box::new(RemoteFile {
            client: self.client.clone(),
            handle,
            path: path.to_string(),
            async_mode: false,
            closed: false,
        }))
    }

    fn stat(&self, path: &str, follow_symlink: bool) -> PioResult<PioStat> {
        let arg = if follow_symlink { STAT_FOLLOW } else { 0 };
        decode_stat(&self.call(Opcode::Stat, path.as_bytes(), arg, path)?)
    }

    fn remove(&self, path: &str, missing_ok: bool) -> PioResult<()> {
        self.call(Opcode::Remove, path.as_bytes(), missing_ok as u32, path).map(|_| ())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> PioResult<()> {
        self.call(Opcode::Rename, &join_nul(old_path, new_path), 0, old_path)
            .map(|_| ())
    }

    fn exists(&self, path: &str) -> PioResult<bool> {
        match self.call(Opcode::Access, path.as_bytes(), 0, path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get_crc32(&self, path: &str, compressed: bool, missing_ok: bool) -> PioResult<u32> {
        let mut flags = 0;
        if compressed {
            flags |= CRC32_DECOMPRESS;
        }
        if missing_ok {
            flags |= CRC32_MISSING_OK;
        }
        self.crc(path, flags)
    }

    fn get_crc32_truncated(&self, path: &str, missing_ok: bool) -> PioResult<u32> {
        let flags = CRC32_TRUNCATED | if missing_ok { CRC32_MISSING_OK } else { 0 };
        self.crc(path, flags)
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn make_dir(&self, path: &str, mode: u32, strict: bool) -> PioResult<()> {
        let arg = (mode & 0o7777) | if strict { MKDIR_STRICT } else { 0 };
        self.call(Opcode::Mkdir, path.as_bytes(), arg, path).map(|_| ())
    }

    fn list_dir(&self, files: &mut Vec<PgFile>, root: &str, opts: &ListDirOptions) -> PioResult<()> {
        let mut payload = pack_u32(opts.external_dir_num as u32).to_vec();
        payload.extend_from_slice(root.as_bytes());
        self.client.call_stream(
            req(Opcode::ListDir, 0, &payload, opts.to_bits()),
            &payload,
            Opcode::ListDir,
            root,
            |entry| {
                let f: PgFile = serde_json::from_slice(entry)
                    .map_err(|e| PioError::Protocol(format!("bad list_dir entry: {e}")))?;
                files.push(f);
                Ok(())
            },
        )
    }

    fn remove_dir(&self, root: &str, root_as_well: bool) -> PioResult<()> {
        self.call(Opcode::RemoveDir, root.as_bytes(), root_as_well as u32, root)
            .map(|_| ())
    }

    fn files_are_same(&self, path1: &str, path2: &str) -> PioResult<bool> {
        let data = self.call(Opcode::FilesAreSame, &join_nul(path1, path2), 0, path1)?;
        Ok(data.first().copied().unwrap_or(0) != 0)
    }

    fn read_file(&self, path: &str, missing_ok: bool) -> PioResult<Option<Vec<u8>>> {
        match self.call(Opcode::Load, path.as_bytes(), 0, path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if missing_ok && e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_file(&self, path: &str, data: &[u8]) -> PioResult<()> {
        let mut f = self.open(path, OpenFlags::REWRITE, crate::consts::FILE_PERMISSION)?;
        f.pio_write(data)?;
        f.close(true)
    }

    fn symlink(&self, target: &str, link_path: &str, overwrite: bool) -> PioResult<()> {
        self.call(Opcode::Symlink, &join_nul(target, link_path), overwrite as u32, link_path)
            .map(|_| ())
    }

    fn chmod(&self, path: &str, mode: u32) -> PioResult<()> {
        self.call(Opcode::Chmod, path.as_bytes(), mode, path).map(|_| ())
    }

    fn readlink(&self, path: &str) -> PioResult<String> {
        let data = self.call(Opcode::Readlink, path.as_bytes(), 0, path)?;
        Ok(as_str(&data)?.to_string())
    }

    fn read_dir(&self, path: &str) -> PioResult<Vec<String>> {
        let handle = self.client.alloc_handle(path, HandleKind::Dir)?;
        let res = self.read_dir_with(handle, path);
        self.client.release_handle(handle);
        res
    }

    fn sync_path(&self, path: &str) -> PioResult<()> {
        self.call(Opcode::Sync, path.as_bytes(), 0, path).map(|_| ())
    }

    fn get_lsn_map(&self, path: &str, n_blocks: u32, horizon_lsn: u64) -> PioResult<PageBitmap> {
        let mut payload = pack_u64(horizon_lsn).to_vec();
        payload.extend_from_slice(path.as_bytes());
        let data = self.call(Opcode::GetLsnMap, &payload, n_blocks, path)?;
        Ok(PageBitmap::from_bytes(data))
    }

    fn check_postmaster(&self, pgdata: &str) -> PioResult<u32> {
        unpack_u32(&self.call(Opcode::CheckPostmaster, pgdata.as_bytes(), 0, pgdata)?)
    }

    fn send_pages(
        &self,
        path: &str,
        n_blocks: u32,
        sel: &PageSelection,
        sink: &mut dyn FnMut(SentPage<'_>) -> PioResult<()>,
    ) -> PioResult<PagesSent> {
        let mut payload = sel.encode();
        payload.extend_from_slice(path.as_bytes());
        let mut sent = PagesSent::default();
        let eof = self.client.stream(
            req(Opcode::SendPages, 0, &payload, n_blocks),
            &payload,
            &[Opcode::Page, Opcode::PageZero],
            path,
            |op, blkno, data| {
                if op == Opcode::PageZero {
                    sent.zero_pages += 1;
                    return sink(SentPage::Zero { blkno });
                }
                if data.len() != BLCKSZ {
                    return Err(PioError::Protocol(format!("page frame of {} bytes", data.len())));
                }
                sent.pages += 1;
                sink(SentPage::Data { blkno, page: data })
            },
        )?;
        sent.blocks_read = eof.arg;
        Ok(sent)
    }

    fn get_checksum_map(&self, path: &str, n_blocks: u32, checksum_version: u32) -> PioResult<Vec<BlockDigest>> {
        let mut payload = pack_u32(checksum_version).to_vec();
        payload.extend_from_slice(path.as_bytes());
        let data = self.call(Opcode::GetChecksumMap, &payload, n_blocks, path)?;
        BlockDigest::decode_all(&data)
    }
}
