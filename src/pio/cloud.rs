//! Cloud backend: files are whole objects in an ObjectStore.
//!
//! Keys are '/'-joined relative paths. Directories are virtual: a directory
//! exists when a marker object "dir/" or any key below it exists. A CloudFile
//! holds the object in memory and uploads it on sync, finish or close.
//! Operations object storage has no notion of (symlinks, permissions,
//! postmaster probing) answer `Unsupported`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use super::{
    crc32c_stream, FileKind, ListDirOptions, OpenFlags, PgFile, PioDrive, PioFile, PioRead, PioStat, PioWriteFlush,
};
use crate::consts::{DIR_PERMISSION, FILE_PERMISSION};
use crate::error::{PioError, PioResult};
use crate::filter::{CutZeroTail, GzDecompress, ReadFilter};
use crate::pagemap::{build_lsn_map, PageBitmap};

const BACKEND: &str = "cloud";
const ENOTEMPTY: i32 = 39;
const EFBIG: i32 = 27;

/// Largest single object a file handle will grow to.
pub const MAX_OBJECT_SIZE: u64 = 5 << 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub size: u64,
    /// Seconds since the epoch of the last put.
    pub mtime: i64,
}

/// Minimal blob API the cloud drive is built on.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> PioResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: Vec<u8>) -> PioResult<()>;

    /// True when the key existed.
    fn delete(&self, key: &str) -> PioResult<bool>;

    fn head(&self, key: &str) -> PioResult<Option<ObjectMeta>>;

    /// All keys starting with `prefix`, in key order.
    fn list(&self, prefix: &str) -> PioResult<Vec<(String, ObjectMeta)>>;
}

/// In-process store, used for tests and dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PioResult<std::sync::MutexGuard<'_, BTreeMap<String, (Vec<u8>, i64)>>> {
        self.objects.lock().map_err(|_| PioError::Other {
            path: String::new(),
            code: 0,
            msg: "object store lock poisoned".to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> PioResult<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).map(|(d, _)| d.clone()))
    }

    fn put(&self, key: &str, data: Vec<u8>) -> PioResult<()> {
        self.lock()?.insert(key.to_string(), (data, now_secs()));
        Ok(())
    }

    fn delete(&self, key: &str) -> PioResult<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn head(&self, key: &str) -> PioResult<Option<ObjectMeta>> {
        Ok(self.lock()?.get(key).map(|(d, mtime)| ObjectMeta {
            size: d.len() as u64,
            mtime: *mtime,
        }))
    }

    fn list(&self, prefix: &str) -> PioResult<Vec<(String, ObjectMeta)>> {
        let m = self.lock()?;
        Ok(m.range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (d, mtime))| {
                (
                    k.clone(),
                    ObjectMeta {
                        size: d.len() as u64,
                        mtime: *mtime,
                    },
                )
            })
            .collect())
    }
}

/// Normalise a path into an object key: no leading, trailing or doubled '/'.
fn object_key(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

// ---------------- File ----------------

pub struct CloudFile {
    store: Arc<dyn ObjectStore>,
    key: String,
    path: String,
    data: Vec<u8>,
    pos: usize,
    writable: bool,
    append: bool,
    dirty: bool,
}

impl CloudFile {
    /// In-memory position for a file offset; offsets past the object limit
    /// (or not addressable on this target) are EFBIG.
    fn position(&self, offs: u64) -> PioResult<usize> {
        match usize::try_from(offs) {
            Ok(pos) if offs <= MAX_OBJECT_SIZE => Ok(pos),
            _ => Err(PioError::Other {
                path: self.path.clone(),
                code: EFBIG,
                msg: format!("offset {offs} is beyond the object size limit"),
            }),
        }
    }

    fn upload(&mut self) -> PioResult<()> {
        if self.dirty {
            debug!("uploading {} ({} bytes)", self.key, self.data.len());
            self.store.put(&self.key, self.data.clone())?;
            self.dirty = false;
        }
        Ok(())
    }
}

impl PioRead for CloudFile {
    fn pio_read(&mut self, buf: &mut [u8]) -> PioResult<usize> {
        let avail = self.data.len().saturating_sub(self.pos);
        let n = avail.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl PioWriteFlush for CloudFile {
    fn pio_write(&mut self, buf: &[u8]) -> PioResult<usize> {
        if !self.writable {
            return Err(PioError::PermissionDenied { path: self.path.clone() });
        }
        if self.append {
            self.pos = self.data.len();
        }
        let end = (self.pos as u64)
            .checked_add(buf.len() as u64)
            .ok_or_else(|| PioError::Other {
                path: self.path.clone(),
                code: EFBIG,
                msg: "write position overflows".to_string(),
            })?;
        let end = self.position(end)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        self.dirty = true;
        Ok(buf.len())
    }

    fn pio_write_finish(&mut self) -> PioResult<()> {
        self.upload()
    }
}

impl PioFile for CloudFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn pread(&mut self, buf: &mut [u8], offs: u64) -> PioResult<usize> {
        let offs = offs.min(self.data.len() as u64) as usize;
        let n = (self.data.len() - offs).min(buf.len());
        buf[..n].copy_from_slice(&self.data[offs..offs + n]);
        Ok(n)
    }

    fn truncate(&mut self, size: u64) -> PioResult<()> {
        if !self.writable {
            return Err(PioError::PermissionDenied { path: self.path.clone() });
        }
        let size = self.position(size)?;
        self.data.resize(size, 0);
        self.dirty = true;
        Ok(())
    }

    fn seek(&mut self, offs: u64) -> PioResult<u64> {
        self.pos = self.position(offs)?;
        Ok(offs)
    }

    fn sync(&mut self) -> PioResult<()> {
        self.upload()
    }

    fn close(mut self: Box<Self>, _sync: bool) -> PioResult<()> {
        self.upload()
    }
}

impl Drop for CloudFile {
    fn drop(&mut self) {
        if self.dirty {
            warn!("cloud file {} dropped with unflushed writes", self.path);
        }
    }
}

// ---------------- Drive ----------------

#[derive(Clone)]
pub struct CloudDrive {
    store: Arc<dyn ObjectStore>,
}

impl CloudDrive {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn not_found(path: &str) -> PioError {
        PioError::NotFound { path: path.to_string() }
    }

    fn unsupported(op: &'static str) -> PioError {
        PioError::Unsupported { op, backend: BACKEND }
    }

    fn dir_exists(&self, key: &str) -> PioResult<bool> {
        Ok(!self.store.list(&dir_prefix(key))?.is_empty())
    }

    fn fetch(&self, path: &str) -> PioResult<Vec<u8>> {
        let key = object_key(path);
        self.store.get(&key)?.ok_or_else(|| Self::not_found(path))
    }

    fn fetch_opt(&self, path: &str, missing_ok: bool) -> PioResult<Option<Vec<u8>>> {
        match self.store.get(&object_key(path))? {
            Some(d) => Ok(Some(d)),
            None if missing_ok => {
                debug!("{} is missing, treated as empty", path);
                Ok(None)
            }
            None => Err(Self::not_found(path)),
        }
    }
}

impl PioDrive for CloudDrive {
    fn open(&self, path: &str, flags: OpenFlags, _permissions: u32) -> PioResult<Box<dyn PioFile>> {
        let key = object_key(path);
        let existing = self.store.get(&key)?;
        let data = match existing {
            Some(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                return Err(PioError::AlreadyExists { path: path.to_string() });
            }
            Some(_) if flags.contains(OpenFlags::TRUNCATE) => Vec::new(),
            Some(d) => d,
            None if flags.contains(OpenFlags::CREATE) => Vec::new(),
            None => return Err(Self::not_found(path)),
        };
        let writable = flags.is_write();
        let created = writable && (flags.contains(OpenFlags::TRUNCATE) || flags.contains(OpenFlags::CREATE));
        Ok(Box::new(CloudFile {
            store: self.store.clone(),
            key,
            path: path.to_string(),
            data,
            pos: 0,
            writable,
            append: flags.contains(OpenFlags::APPEND),
            dirty: created,
        }))
    }

    fn stat(&self, path: &str, _follow_symlink: bool) -> PioResult<PioStat> {
        let key = object_key(path);
        if let Some(meta) = self.store.head(&key)? {
            return Ok(PioStat {
                size: meta.size as i64,
                mtime: meta.mtime,
                mode: FILE_PERMISSION,
                kind: FileKind::Regular,
            });
        }
        let below = self.store.list(&dir_prefix(&key))?;
        if below.is_empty() {
            return Err(Self::not_found(path));
        }
        Ok(PioStat {
            size: 0,
            mtime: below.iter().map(|(_, m)| m.mtime).max().unwrap_or(0),
            mode: DIR_PERMISSION,
            kind: FileKind::Directory,
        })
    }

    fn remove(&self, path: &str, missing_ok: bool) -> PioResult<()> {
        let key = object_key(path);
        if self.store.delete(&key)? {
            return Ok(());
        }
        let prefix = dir_prefix(&key);
        let below = self.store.list(&prefix)?;
        if below.iter().any(|(k, _)| *k != prefix) {
            return Err(PioError::Other {
                path: path.to_string(),
                code: ENOTEMPTY,
                msg: "directory not empty".to_string(),
            });
        }
        if self.store.delete(&prefix)? || missing_ok {
            return Ok(());
        }
        Err(Self::not_found(path))
    }

    fn rename(&self, old_path: &str, new_path: &str) -> PioResult<()> {
        let data = self.fetch(old_path)?;
        self.store.put(&object_key(new_path), data)?;
        self.store.delete(&object_key(old_path))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> PioResult<bool> {
        let key = object_key(path);
        Ok(self.store.head(&key)?.is_some() || self.dir_exists(&key)?)
    }

    fn get_crc32(&self, path: &str, compressed: bool, missing_ok: bool) -> PioResult<u32> {
        let Some(data) = self.fetch_opt(path, missing_ok)? else {
            return Ok(0);
        };
        if compressed {
            crc32c_stream(&mut ReadFilter::new(data.as_slice(), Box::new(GzDecompress::new(false))))
        } else {
            Ok(crc32c::crc32c(&data))
        }
    }

    fn get_crc32_truncated(&self, path: &str, missing_ok: bool) -> PioResult<u32> {
        let Some(data) = self.fetch_opt(path, missing_ok)? else {
            return Ok(0);
        };
        crc32c_stream(&mut ReadFilter::new(data.as_slice(), Box::new(CutZeroTail::new())))
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn make_dir(&self, path: &str, _mode: u32, strict: bool) -> PioResult<()> {
        let key = object_key(path);
        if self.store.head(&key)?.is_some() {
            return Err(PioError::AlreadyExists { path: path.to_string() });
        }
        if self.dir_exists(&key)? {
            if strict {
                return Err(PioError::AlreadyExists { path: path.to_string() });
            }
            return Ok(());
        }
        self.store.put(&dir_prefix(&key), Vec::new())
    }

    fn list_dir(&self, files: &mut Vec<PgFile>, root: &str, opts: &ListDirOptions) -> PioResult<()> {
        let key = object_key(root);
        let prefix = dir_prefix(&key);
        let objects = self.store.list(&prefix)?;
        if objects.is_empty() {
            if self.store.head(&key)?.is_some() {
                return Err(PioError::Other {
                    path: root.to_string(),
                    code: 20,
                    msg: "not a directory".to_string(),
                });
            }
            return Err(Self::not_found(root));
        }

        let mut dirs: BTreeSet<String> = BTreeSet::new();
        let mut entries: BTreeMap<String, PgFile> = BTreeMap::new();
        for (k, meta) in objects {
            let rel = &k[prefix.len()..];
            let (rel, is_marker) = match rel.strip_suffix('/') {
                Some(r) => (r, true),
                None => (rel, false),
            };
            if rel.is_empty() {
                continue;
            }
            let parts: Vec<&str> = rel.split('/').collect();
            if opts.skip_hidden && !opts.symlink_and_hidden && parts.iter().any(|p| p.starts_with('.')) {
                continue;
            }
            if !opts.backup_logs && parts.len() > 1 && matches!(parts[0], "log" | "pg_log") {
                dirs.insert(parts[0].to_string());
                continue;
            }
            for depth in 1..parts.len() {
                dirs.insert(parts[..depth].join("/"));
            }
            if is_marker {
                dirs.insert(rel.to_string());
                continue;
            }
            let mut f = PgFile::new(rel, FileKind::Regular);
            f.size = meta.size as i64;
            f.mtime = meta.mtime;
            f.mode = FILE_PERMISSION;
            f.external_dir_num = opts.external_dir_num;
            entries.insert(rel.to_string(), f);
        }
        for d in dirs {
            let mut f = PgFile::new(d.clone(), FileKind::Directory);
            f.mode = DIR_PERMISSION;
            f.external_dir_num = opts.external_dir_num;
            entries.entry(d).or_insert(f);
        }
        files.extend(entries.into_values());
        Ok(())
    }

    fn remove_dir(&self, root: &str, root_as_well: bool) -> PioResult<()> {
        let prefix = dir_prefix(&object_key(root));
        for (k, _) in self.store.list(&prefix)? {
            if k == prefix && !root_as_well {
                continue;
            }
            self.store.delete(&k)?;
        }
        Ok(())
    }

    fn files_are_same(&self, path1: &str, path2: &str) -> PioResult<bool> {
        let (k1, k2) = (object_key(path1), object_key(path2));
        Ok(k1 == k2 && self.store.head(&k1)?.is_some())
    }

    fn read_file(&self, path: &str, missing_ok: bool) -> PioResult<Option<Vec<u8>>> {
        self.fetch_opt(path, missing_ok)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> PioResult<()> {
        self.store.put(&object_key(path), data.to_vec())
    }

    fn symlink(&self, _target: &str, _link_path: &str, _overwrite: bool) -> PioResult<()> {
        Err(Self::unsupported("symlink"))
    }

    fn chmod(&self, _path: &str, _mode: u32) -> PioResult<()> {
        Err(Self::unsupported("chmod"))
    }

    fn readlink(&self, _path: &str) -> PioResult<String> {
        Err(Self::unsupported("readlink"))
    }

    fn read_dir(&self, path: &str) -> PioResult<Vec<String>> {
        let prefix = dir_prefix(&object_key(path));
        let objects = self.store.list(&prefix)?;
        if objects.is_empty() {
            return Err(Self::not_found(path));
        }
        let names: BTreeSet<String> = objects
            .iter()
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn sync_path(&self, path: &str) -> PioResult<()> {
        if self.exists(path)? {
            Ok(())
        } else {
            Err(Self::not_found(path))
        }
    }

    fn get_lsn_map(&self, path: &str, n_blocks: u32, horizon_lsn: u64) -> PioResult<PageBitmap> {
        let data = self.fetch(path)?;
        build_lsn_map(&mut data.as_slice(), n_blocks, horizon_lsn)
    }

    fn check_postmaster(&self, _pgdata: &str) -> PioResult<u32> {
        Err(Self::unsupported("check_postmaster"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_normalised() {
        assert_eq!(object_key("/a//b/./c/"), "a/b/c");
        assert_eq!(dir_prefix(""), "");
        assert_eq!(dir_prefix("a/b"), "a/b/");
    }

    #[test]
    fn memory_store_lists_by_prefix() {
        let s = MemoryObjectStore::new();
        s.put("a/1", vec![1]).unwrap();
        s.put("a/2", vec![1, 2]).unwrap();
        s.put("b/1", vec![]).unwrap();
        let keys: Vec<String> = s.list("a/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(s.head("a/2").unwrap().unwrap().size, 2);
        assert!(s.delete("b/1").unwrap());
        assert!(!s.delete("b/1").unwrap());
    }
}
