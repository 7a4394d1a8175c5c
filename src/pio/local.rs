//! Local backend: every operation is a direct system call.
//!
//! The agent serves remote requests through this same drive, so local and
//! remote share one set of semantics (missing_ok, error folding).

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use log::{debug, warn};

use super::listing::{list_local, mtime_secs};
use super::{
    crc32c_stream, join_path, FileKind, ListDirOptions, OpenFlags, PgFile, PioDrive, PioFile, PioRead, PioStat,
    PioWriteFlush,
};
use crate::consts::POSTMASTER_PID_FILE;
use crate::error::{PioError, PioResult};
use crate::filter::{CutZeroTail, GzDecompress, ReadFilter};
use crate::pagemap::{build_lsn_map, PageBitmap};

pub struct LocalFile {
    path: String,
    file: File,
}

impl LocalFile {
    pub fn from_file(path: &str, file: File) -> Self {
        Self {
            path: path.to_string(),
            file,
        }
    }

    fn io_err(&self, e: std::io::Error) -> PioError {
        PioError::from_io(e, &self.path)
    }
}

impl PioRead for LocalFile {
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize> {
        loop {
            match self.file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_err(e)),
            }
        }
    }
}

impl PioWriteFlush for LocalFile {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize> {
        self.file.write_all(buf).map_err(|e| self.io_err(e))?;
        Ok(buf.len())
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        self.file.flush().map_err(|e| self.io_err(e))
    }
}

impl PioFile for LocalFile {
    fn path(&self) -> &str {
        &self.path
    }

    #[cfg(unix)]
    fn pread(&mut self, buf: &mut [u8], offs: u64) -> PioResult<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offs).map_err(|e| self.io_err(e))
    }

    #[cfg(not(unix))]
    fn pread(&mut self, buf: &mut [u8], offs: u64) -> PioResult<usize> {
        self.file.seek(SeekFrom::Start(offs)).map_err(|e| self.io_err(e))?;
        self.file.read(buf).map_err(|e| self.io_err(e))
    }

    fn truncate(&mut self, size: u64) -> PioResult<()> {
        self.file.set_len(size).map_err(|e| self.io_err(e))
    }

    fn seek(&mut self, offs: u64) -> PioResult<u64> {
        self.file.seek(SeekFrom::Start(offs)).map_err(|e| self.io_err(e))
    }

    fn sync(&mut self) -> PioResult<()> {
        self.file.sync_all().map_err(|e| self.io_err(e))
    }

    fn close(self: Box<Self>, sync: bool) -> PioResult<()> {
        if sync {
            self.file.sync_all().map_err(|e| self.io_err(e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDrive;

impl LocalDrive {
    pub fn new() -> Self {
        LocalDrive
    }

    /// Open returning the concrete type (used by the agent).
    pub fn open_local(&self, path: &str, flags: OpenFlags, permissions: u32) -> PioResult<LocalFile> {
        let mut oo = OpenOptions::new();
        let write = flags.contains(OpenFlags::WRITE);
        oo.read(flags.contains(OpenFlags::READ) || !flags.is_write())
            .write(write)
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        if flags.contains(OpenFlags::EXCLUSIVE) {
            oo.create_new(true);
        } else if flags.contains(OpenFlags::CREATE) {
            oo.create(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            oo.mode(permissions);
        }
        #[cfg(not(unix))]
        let _ = permissions;

        let file = oo.open(path).map_err(|e| PioError::from_io(e, path))?;
        Ok(LocalFile::from_file(path, file))
    }

    fn crc_of_reader<R: PioRead>(&self, path: &str, r: PioResult<R>, missing_ok: bool) -> PioResult<u32> {
        match r {
            Ok(mut r) => crc32c_stream(&mut r),
            Err(e) if missing_ok && e.is_not_found() => {
                debug!("crc32 of missing {} treated as 0", path);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(unix)]
fn stat_mode(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
fn stat_mode(md: &fs::Metadata) -> u32 {
    if md.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

impl PioDrive for LocalDrive {
    fn open(&self, path: &str, flags: OpenFlags, permissions: u32) -> PioResult<Box<dyn PioFile>> {
        Ok(Box::new(self.open_local(path, flags, permissions)?))
    }

    fn stat(&self, path: &str, follow_symlink: bool) -> PioResult<PioStat> {
        let md = if follow_symlink {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
        .map_err(|e| PioError::from_io(e, path))?;
        Ok(PioStat {
            size: md.len() as i64,
            mtime: mtime_secs(&md),
            mode: stat_mode(&md),
            kind: FileKind::from_file_type(md.file_type()),
        })
    }

    fn remove(&self, path: &str, missing_ok: bool) -> PioResult<()> {
        let res = match fs::symlink_metadata(path) {
            Ok(md) if md.is_dir() => fs::remove_dir(path),
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if missing_ok && e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PioError::from_io(e, path)),
        }
    }

    fn rename(&self, old_path: &str, new_path: &str) -> PioResult<()> {
        fs::rename(old_path, new_path).map_err(|e| PioError::from_io(e, old_path))
    }

    fn exists(&self, path: &str) -> PioResult<bool> {
        match fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PioError::from_io(e, path)),
        }
    }

    fn get_crc32(&self, path: &str, compressed: bool, missing_ok: bool) -> PioResult<u32> {
        let file = self.open_local(path, OpenFlags::READ, 0);
        if compressed {
            let r = file.map(|f| ReadFilter::new(f, Box::new(GzDecompress::new(false))));
            self.crc_of_reader(path, r, missing_ok)
        } else {
            self.crc_of_reader(path, file, missing_ok)
        }
    }

    fn get_crc32_truncated(&self, path: &str, missing_ok: bool) -> PioResult<u32> {
        let r = self
            .open_local(path, OpenFlags::READ, 0)
            .map(|f| ReadFilter::new(f, Box::new(CutZeroTail::new())));
        self.crc_of_reader(path, r, missing_ok)
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn make_dir(&self, path: &str, mode: u32, strict: bool) -> PioResult<()> {
        let mut b = DirBuilder::new();
        b.recursive(!strict);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            b.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        b.create(path).map_err(|e| PioError::from_io(e, path))
    }

    fn list_dir(&self, files: &mut Vec<PgFile>, root: &str, opts: &ListDirOptions) -> PioResult<()> {
        list_local(files, root, opts)
    }

    fn remove_dir(&self, root: &str, root_as_well: bool) -> PioResult<()> {
        let entries = match fs::read_dir(root) {
            Ok(it) => it,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PioError::from_io(e, root)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| PioError::from_io(e, root))?;
            let path = entry.path();
            let res = match entry.file_type() {
                Ok(ft) if ft.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(PioError::from_io(e, &path.to_string_lossy()));
                }
            }
        }
        if root_as_well {
            self.remove(root, true)?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn files_are_same(&self, path1: &str, path2: &str) -> PioResult<bool> {
        let md1 = match fs::metadata(path1) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PioError::from_io(e, path1)),
        };
        let md2 = match fs::metadata(path2) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(PioError::from_io(e, path2)),
        };
        Ok(same_file(&md1, &md2))
    }

    #[cfg(not(unix))]
    fn files_are_same(&self, path1: &str, path2: &str) -> PioResult<bool> {
        match (fs::canonicalize(path1), fs::canonicalize(path2)) {
            (Ok(a), Ok(b)) => Ok(a == b),
            _ => Ok(false),
        }
    }

    fn read_file(&self, path: &str, missing_ok: bool) -> PioResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if missing_ok && e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PioError::from_io(e, path)),
        }
    }

    fn write_file(&self, path: &str, data: &[u8]) -> PioResult<()> {
        let mut f = self.open_local(path, OpenFlags::REWRITE, crate::consts::FILE_PERMISSION)?;
        f.pio_write(data)?;
        Box::new(f).close(true)
    }

    #[cfg(unix)]
    fn symlink(&self, target: &str, link_path: &str, overwrite: bool) -> PioResult<()> {
        if overwrite {
            self.remove(link_path, true)?;
        }
        std::os::unix::fs::symlink(target, link_path).map_err(|e| PioError::from_io(e, link_path))
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &str, _link_path: &str, _overwrite: bool) -> PioResult<()> {
        Err(PioError::Unsupported { op: "symlink", backend: "local" })
    }

    #[cfg(unix)]
    fn chmod(&self, path: &str, mode: u32) -> PioResult<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| PioError::from_io(e, path))
    }

    #[cfg(not(unix))]
    fn chmod(&self, _path: &str, _mode: u32) -> PioResult<()> {
        Err(PioError::Unsupported { op: "chmod", backend: "local" })
    }

    fn readlink(&self, path: &str) -> PioResult<String> {
        fs::read_link(path)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| PioError::from_io(e, path))
    }

    fn read_dir(&self, path: &str) -> PioResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| PioError::from_io(e, path))? {
            let entry = entry.map_err(|e| PioError::from_io(e, path))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn sync_path(&self, path: &str) -> PioResult<()> {
        let f = File::open(path).map_err(|e| PioError::from_io(e, path))?;
        f.sync_all().map_err(|e| PioError::from_io(e, path))
    }

    fn get_lsn_map(&self, path: &str, n_blocks: u32, horizon_lsn: u64) -> PioResult<PageBitmap> {
        let mut f = self.open_local(path, OpenFlags::READ, 0)?;
        build_lsn_map(&mut f, n_blocks, horizon_lsn)
    }

    fn check_postmaster(&self, pgdata: &str) -> PioResult<u32> {
        let pid_file = join_path(pgdata, POSTMASTER_PID_FILE);
        let Some(content) = self.read_file(&pid_file, true)? else {
            return Ok(0);
        };
        let text = String::from_utf8_lossy(&content);
        let pid = match text.lines().next().map(str::trim).map(str::parse::<i64>) {
            Some(Ok(pid)) => pid,
            _ => {
                warn!("cannot parse pid from {}", pid_file);
                return Ok(0);
            }
        };
        // A negative pid marks a standalone backend.
        let pid = pid.unsigned_abs() as u32;
        if pid != 0 && process_alive(pid) {
            Ok(pid)
        } else {
            Ok(0)
        }
    }
}

