//! pio: location-transparent File/Drive capability sets.
//!
//! A Drive serves whole-filesystem operations for one Location; the File it
//! opens serves byte-stream operations. Backends:
//! - local: direct system calls (LocalDrive / LocalFile);
//! - remote: one request/response (or one async enqueue) over the agent
//!   protocol per operation (RemoteDrive / RemoteFile);
//! - cloud: an ObjectStore (CloudDrive / CloudFile).
//!
//! The Location -> Drive mapping (`Drives`) is fixed at construction; callers
//! only ever see `Arc<dyn PioDrive>` / `Box<dyn PioFile>`.

pub mod cloud;
pub mod listing;
pub mod local;
pub mod remote;

use std::fmt;
use std::ops::BitOr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PioConfig;
use crate::consts::FILE_PERMISSION;
use crate::error::{PioError, PioResult};
use crate::fio::{launch_agent, AgentConnection};
use crate::page::{build_checksum_map, read_pages, BlockDigest, PageSelection, PagesSent, SentPage};
use crate::pagemap::PageBitmap;

pub use cloud::{CloudDrive, CloudFile, MemoryObjectStore, ObjectMeta, ObjectStore};
pub use listing::{ListDirOptions, PgFile};
pub use local::{LocalDrive, LocalFile};
pub use remote::{RemoteDrive, RemoteFile};

// ---------------- Location ----------------

/// Where a path lives. Pure tag; selects the Drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Local,
    DatabaseHost,
    BackupHost,
    RemoteHost,
    Cloud,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Location::Local => "local",
            Location::DatabaseHost => "db",
            Location::BackupHost => "backup",
            Location::RemoteHost => "remote",
            Location::Cloud => "cloud",
        };
        f.write_str(s)
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Location::Local),
            "db" | "database" => Ok(Location::DatabaseHost),
            "backup" => Ok(Location::BackupHost),
            "remote" => Ok(Location::RemoteHost),
            "cloud" | "s3" => Ok(Location::Cloud),
            other => Err(format!("unknown location '{}'", other)),
        }
    }
}

// ---------------- File kind / stat ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum FileKind {
    #[default]
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 3,
    Fifo = 4,
    Sock = 5,
    CharDev = 6,
    BlockDev = 7,
}

impl FileKind {
    pub fn from_u32(v: u32) -> FileKind {
        match v {
            1 => FileKind::Regular,
            2 => FileKind::Directory,
            3 => FileKind::Symlink,
            4 => FileKind::Fifo,
            5 => FileKind::Sock,
            6 => FileKind::CharDev,
            7 => FileKind::BlockDev,
            _ => FileKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Unknown => "unknown",
            FileKind::Regular => "reg",
            FileKind::Directory => "dir",
            FileKind::Symlink => "link",
            FileKind::Fifo => "fifo",
            FileKind::Sock => "sock",
            FileKind::CharDev => "chdev",
            FileKind::BlockDev => "bdev",
        }
    }

    /// Map st_mode type bits to a kind.
    pub fn from_mode(mode: u32) -> FileKind {
        match mode & 0o170000 {
            0o100000 => FileKind::Regular,
            0o040000 => FileKind::Directory,
            0o120000 => FileKind::Symlink,
            0o010000 => FileKind::Fifo,
            0o140000 => FileKind::Sock,
            0o020000 => FileKind::CharDev,
            0o060000 => FileKind::BlockDev,
            _ => FileKind::Unknown,
        }
    }

    pub fn from_file_type(ft: std::fs::FileType) -> FileKind {
        if ft.is_symlink() {
            return FileKind::Symlink;
        }
        if ft.is_dir() {
            return FileKind::Directory;
        }
        if ft.is_file() {
            return FileKind::Regular;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if ft.is_fifo() {
                return FileKind::Fifo;
            }
            if ft.is_socket() {
                return FileKind::Sock;
            }
            if ft.is_char_device() {
                return FileKind::CharDev;
            }
            if ft.is_block_device() {
                return FileKind::BlockDev;
            }
        }
        FileKind::Unknown
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "reg" => FileKind::Regular,
            "dir" => FileKind::Directory,
            "link" => FileKind::Symlink,
            "fifo" => FileKind::Fifo,
            "sock" => FileKind::Sock,
            "chdev" => FileKind::CharDev,
            "bdev" => FileKind::BlockDev,
            "unknown" => FileKind::Unknown,
            other => return Err(format!("unknown file kind '{}'", other)),
        })
    }
}

/// Keep only permission bits (incl. setuid/setgid/sticky).
#[inline]
pub fn limit_mode(mode: u32) -> u32 {
    mode & 0o7777
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PioStat {
    pub size: i64,
    pub mtime: i64,
    pub mode: u32,
    pub kind: FileKind,
}

impl PioStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

// ---------------- Open flags ----------------

/// Backend-neutral open flags (stable on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags(0x01);
    pub const WRITE: OpenFlags = OpenFlags(0x02);
    pub const CREATE: OpenFlags = OpenFlags(0x04);
    pub const TRUNCATE: OpenFlags = OpenFlags(0x08);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x10);
    pub const APPEND: OpenFlags = OpenFlags(0x20);

    /// O_RDWR | O_CREAT | O_TRUNC
    pub const REWRITE: OpenFlags = OpenFlags(0x01 | 0x02 | 0x04 | 0x08);

    #[inline]
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_write(self) -> bool {
        self.contains(OpenFlags::WRITE) || self.contains(OpenFlags::APPEND)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

// ---------------- Capability sets ----------------

/// Byte source.
pub trait PioRead {
    /// Read up to buf.len() bytes; 0 means end of stream.
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize>;
}

/// Byte sink with an explicit finish step.
pub trait PioWriteFlush {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize>;

    /// Flush pending state (filter tails, async queues) and surface deferred errors.
    fn pio_write_finish(&mut self) -> PioResult<()>;
}

impl<T: PioRead + ?Sized> PioRead for &mut T {
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize> {
        (**self).pio_read(buf)
    }
}

impl<T: PioRead + ?Sized> PioRead for Box<T> {
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize> {
        (**self).pio_read(buf)
    }
}

impl<T: PioWriteFlush + ?Sized> PioWriteFlush for &mut T {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize> {
        (**self).pio_write(buf)
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        (**self).pio_write_finish()
    }
}

impl<T: PioWriteFlush + ?Sized> PioWriteFlush for Box<T> {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize> {
        (**self).pio_write(buf)
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        (**self).pio_write_finish()
    }
}

impl PioRead for &[u8] {
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize> {
        let n = buf.len().min(self.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

impl PioWriteFlush for Vec<u8> {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize> {
        self.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        Ok(())
    }
}

/// Write the whole buffer or fail.
pub fn write_all<W: PioWriteFlush + ?Sized>(w: &mut W, mut buf: &[u8]) -> PioResult<()> {
    while !buf.is_empty() {
        let n = w.pio_write(buf)?;
        if n == 0 {
            return Err(PioError::Other {
                path: String::new(),
                code: 0,
                msg: "short write: sink accepted 0 bytes".to_string(),
            });
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Read until EOF into a Vec.
pub fn read_to_end<R: PioRead + ?Sized>(r: &mut R) -> PioResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = r.pio_read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

/// CRC32C of everything the reader yields.
pub fn crc32c_stream<R: PioRead + ?Sized>(r: &mut R) -> PioResult<u32> {
    let mut crc = 0u32;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = r.pio_read(&mut chunk)?;
        if n == 0 {
            return Ok(crc);
        }
        crc = crc32c::crc32c_append(crc, &chunk[..n]);
    }
}

/// An open file on some Drive.
pub trait PioFile: PioRead + PioWriteFlush + Send {
    fn path(&self) -> &str;

    /// Read at an absolute offset without moving the cursor semantics the
    /// caller relies on (remote: single round trip).
    fn pread(&mut self, buf: &mut [u8], offs: u64) -> PioResult<usize>;

    fn truncate(&mut self, size: u64) -> PioResult<()>;

    /// Absolute seek; returns the new offset.
    fn seek(&mut self, offs: u64) -> PioResult<u64>;

    /// fsync the file's data and metadata.
    fn sync(&mut self) -> PioResult<()>;

    /// Close; `sync` fsyncs first. Pending async errors are reported here.
    fn close(self: Box<Self>, sync: bool) -> PioResult<()>;

    /// Switch async write mode. Local and cloud files write synchronously anyway.
    fn set_async(&mut self, _on: bool) -> PioResult<()> {
        Ok(())
    }

    /// Collect a deferred async write error without finishing the file.
    fn async_error(&mut self) -> PioResult<()> {
        Ok(())
    }
}

/// Whole-filesystem operations for one location.
pub trait PioDrive: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags, permissions: u32) -> PioResult<Box<dyn PioFile>>;

    /// Open with FILE_PERMISSION.
    fn open_default(&self, path: &str, flags: OpenFlags) -> PioResult<Box<dyn PioFile>> {
        self.open(path, flags, FILE_PERMISSION)
    }

    fn stat(&self, path: &str, follow_symlink: bool) -> PioResult<PioStat>;

    fn remove(&self, path: &str, missing_ok: bool) -> PioResult<()>;

    fn rename(&self, old_path: &str, new_path: &str) -> PioResult<()>;

    fn exists(&self, path: &str) -> PioResult<bool>;

    /// CRC32C of the content (decompressed first when `compressed`).
    /// missing_ok turns NotFound into 0.
    fn get_crc32(&self, path: &str, compressed: bool, missing_ok: bool) -> PioResult<u32>;

    /// CRC32C of the content with the trailing run of zero bytes cut.
    fn get_crc32_truncated(&self, path: &str, missing_ok: bool) -> PioResult<u32>;

    fn is_remote(&self) -> bool;

    /// strict: an existing directory is an error (AlreadyExists).
    fn make_dir(&self, path: &str, mode: u32, strict: bool) -> PioResult<()>;

    /// Append entries under `root` to `files`, paths relative to root.
    fn list_dir(&self, files: &mut Vec<PgFile>, root: &str, opts: &ListDirOptions) -> PioResult<()>;

    /// Remove everything under root; the root itself only when root_as_well.
    fn remove_dir(&self, root: &str, root_as_well: bool) -> PioResult<()>;

    /// Same underlying file after resolving symlinks/hardlinks.
    fn files_are_same(&self, path1: &str, path2: &str) -> PioResult<bool>;

    // ---- whole-file and auxiliary operations ----

    /// Slurp a whole file; None when missing and missing_ok.
    fn read_file(&self, path: &str, missing_ok: bool) -> PioResult<Option<Vec<u8>>>;

    /// Create/overwrite a whole file and fsync it.
    fn write_file(&self, path: &str, data: &[u8]) -> PioResult<()>;

    fn symlink(&self, target: &str, link_path: &str, overwrite: bool) -> PioResult<()>;

    fn chmod(&self, path: &str, mode: u32) -> PioResult<()>;

    fn readlink(&self, path: &str) -> PioResult<String>;

    /// Names of the immediate children of a directory, sorted.
    fn read_dir(&self, path: &str) -> PioResult<Vec<String>>;

    fn sync_path(&self, path: &str) -> PioResult<()>;

    /// Bitmap of blocks (0..n_blocks) whose page LSN >= horizon_lsn.
    fn get_lsn_map(&self, path: &str, n_blocks: u32, horizon_lsn: u64) -> PioResult<PageBitmap>;

    /// Pid of a running postmaster for pgdata, 0 when none.
    fn check_postmaster(&self, pgdata: &str) -> PioResult<u32>;

    /// Page-level copy: pages of `path` chosen by `sel` go to `sink` in block
    /// order. A page that stays broken ends the copy with PageCorruption.
    fn send_pages(
        &self,
        path: &str,
        n_blocks: u32,
        sel: &PageSelection,
        sink: &mut dyn FnMut(SentPage<'_>) -> PioResult<()>,
    ) -> PioResult<PagesSent> {
        let mut file = self.open(path, OpenFlags::READ, 0)?;
        let sent = read_pages(file.as_mut(), n_blocks, sel, sink)?;
        file.close(false)?;
        Ok(sent)
    }

    /// LSN and checksum of each block up to `n_blocks` or end of file.
    fn get_checksum_map(&self, path: &str, n_blocks: u32, checksum_version: u32) -> PioResult<Vec<BlockDigest>> {
        let mut file = self.open(path, OpenFlags::READ, 0)?;
        let map = build_checksum_map(file.as_mut(), n_blocks, checksum_version)?;
        file.close(false)?;
        Ok(map)
    }
}

/// Join path components the way every backend expects ('/' separated).
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return dir.to_string();
    }
    Path::new(dir).join(name).to_string_lossy().into_owned()
}

// ---------------- Location -> Drive ----------------

/// Process-wide Location -> Drive mapping; immutable after construction.
#[derive(Clone)]
pub struct Drives {
    my_location: Location,
    local: Arc<dyn PioDrive>,
    remote: Option<Arc<dyn PioDrive>>,
    cloud: Option<Arc<dyn PioDrive>>,
}

impl Drives {
    /// Everything local.
    pub fn local_only() -> Self {
        Self {
            my_location: Location::Local,
            local: Arc::new(LocalDrive::new()),
            remote: None,
            cloud: None,
        }
    }

    pub fn new(
        my_location: Location,
        remote: Option<Arc<dyn PioDrive>>,
        cloud: Option<Arc<dyn PioDrive>>,
    ) -> Self {
        Self {
            my_location,
            local: Arc::new(LocalDrive::new()),
            remote,
            cloud,
        }
    }

    /// Build the mapping from configuration, launching the agent when this
    /// process is not local and a remote host is configured. The returned
    /// connection must outlive every remote file.
    pub fn connect(cfg: &PioConfig) -> PioResult<(Self, Option<AgentConnection>)> {
        let conn = match (&cfg.remote, cfg.my_location) {
            (Some(_), loc) if loc != Location::Local => Some(launch_agent(cfg)?),
            _ => None,
        };
        let remote = conn
            .as_ref()
            .map(|c| Arc::new(c.drive()) as Arc<dyn PioDrive>);
        Ok((Self::new(cfg.my_location, remote, None), conn))
    }

    /// Attach a cloud drive.
    pub fn with_cloud(mut self, cloud: Arc<dyn PioDrive>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn my_location(&self) -> Location {
        self.my_location
    }

    /// A location is remote when this process runs on some host other than
    /// "local" and the location names a different host.
    pub fn is_remote(&self, location: Location) -> bool {
        self.my_location != Location::Local
            && location != Location::Local
            && location != Location::Cloud
            && location != self.my_location
    }

    pub fn drive_for(&self, location: Location) -> PioResult<Arc<dyn PioDrive>> {
        if location == Location::Cloud {
            return self.cloud.clone().ok_or(PioError::Unsupported {
                op: "drive_for",
                backend: "cloud (not configured)",
            });
        }
        if self.is_remote(location) {
            return self.remote.clone().ok_or(PioError::Unsupported {
                op: "drive_for",
                backend: "remote (agent not connected)",
            });
        }
        Ok(self.local.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_parse_and_display() {
        for loc in [
            Location::Local,
            Location::DatabaseHost,
            Location::BackupHost,
            Location::RemoteHost,
            Location::Cloud,
        ] {
            assert_eq!(loc.to_string().parse::<Location>().unwrap(), loc);
        }
        assert!("mars".parse::<Location>().is_err());
    }

    #[test]
    fn kind_from_mode_and_str() {
        assert_eq!(FileKind::from_mode(0o100644), FileKind::Regular);
        assert_eq!(FileKind::from_mode(0o040700), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!("dir".parse::<FileKind>().unwrap(), FileKind::Directory);
        assert_eq!(FileKind::from_u32(FileKind::BlockDev as u32), FileKind::BlockDev);
        assert_eq!(limit_mode(0o104755), 0o4755);
    }

    #[test]
    fn remote_selection_follows_my_location() {
        let d = Drives::new(Location::BackupHost, None, None);
        assert!(d.is_remote(Location::DatabaseHost));
        assert!(!d.is_remote(Location::BackupHost));
        assert!(!d.is_remote(Location::Local));
        assert!(d.drive_for(Location::DatabaseHost).is_err());
        assert!(!d.drive_for(Location::BackupHost).unwrap().is_remote());

        let all_local = Drives::local_only();
        assert!(!all_local.is_remote(Location::DatabaseHost));
        assert!(all_local.drive_for(Location::Cloud).is_err());
    }
}
