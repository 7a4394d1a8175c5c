//! Directory listing: PgFile records and the local walker.
//!
//! Paths in PgFile are relative to the listed root. The root itself is not
//! listed. Entries that vanish while walking are skipped silently (a running
//! cluster deletes files under our feet); a missing root is NotFound.
//!
//! Options:
//! - handle_tablespaces: symlinks directly under pg_tblspc are recorded as
//!   directories with `linked` set, and their targets are listed too;
//! - symlink_and_hidden: follow every symlink and keep dot-files;
//! - skip_hidden: drop dot-files and dot-directories (ignored with the above);
//! - backup_logs: when false, the contents of log/ and pg_log/ are skipped;
//! - external_dir_num: stamped onto every entry.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{limit_mode, FileKind};
use crate::consts::PG_TBLSPC_DIR;
use crate::error::{PioError, PioResult};

/// One entry of a file list, annotated later by copy routines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgFile {
    pub rel_path: String,
    pub kind: FileKind,
    pub size: i64,
    pub mode: u32,
    pub mtime: i64,
    /// Symlink target for tablespace links.
    pub linked: Option<String>,
    pub external_dir_num: i32,
    pub crc: u32,
    pub read_size: i64,
    pub write_size: i64,
    pub uncompressed_size: i64,
}

impl PgFile {
    pub fn new<S: Into<String>>(rel_path: S, kind: FileKind) -> Self {
        Self {
            rel_path: rel_path.into(),
            kind,
            size: 0,
            mode: 0,
            mtime: 0,
            linked: None,
            external_dir_num: 0,
            crc: 0,
            read_size: 0,
            write_size: 0,
            uncompressed_size: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListDirOptions {
    pub handle_tablespaces: bool,
    pub symlink_and_hidden: bool,
    pub backup_logs: bool,
    pub skip_hidden: bool,
    pub external_dir_num: i32,
}

impl ListDirOptions {
    /// Layout used for a data directory.
    pub fn pgdata() -> Self {
        Self {
            handle_tablespaces: true,
            symlink_and_hidden: false,
            backup_logs: false,
            skip_hidden: true,
            external_dir_num: 0,
        }
    }

    /// Bit-packed form carried in the LIST_DIR request `arg`.
    pub fn to_bits(&self) -> u32 {
        (self.handle_tablespaces as u32)
            | (self.symlink_and_hidden as u32) << 1
            | (self.backup_logs as u32) << 2
            | (self.skip_hidden as u32) << 3
    }

    pub fn from_bits(bits: u32, external_dir_num: i32) -> Self {
        Self {
            handle_tablespaces: bits & 1 != 0,
            symlink_and_hidden: bits & 2 != 0,
            backup_logs: bits & 4 != 0,
            skip_hidden: bits & 8 != 0,
            external_dir_num,
        }
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_log_dir(rel: &Path) -> bool {
    rel.components().count() == 1 && matches!(rel.to_str(), Some("log") | Some("pg_log"))
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

#[cfg(unix)]
fn raw_mode(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
fn raw_mode(md: &fs::Metadata) -> u32 {
    if md.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

pub(crate) fn mtime_secs(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn entry_from_metadata(rel: String, md: &fs::Metadata, opts: &ListDirOptions) -> PgFile {
    let mut f = PgFile::new(rel, FileKind::from_file_type(md.file_type()));
    f.size = if md.is_file() { md.len() as i64 } else { 0 };
    f.mode = limit_mode(raw_mode(md));
    f.mtime = mtime_secs(md);
    f.external_dir_num = opts.external_dir_num;
    f
}

/// Walk `root` on the local filesystem, appending entries to `files`.
pub fn list_local(files: &mut Vec<PgFile>, root: &str, opts: &ListDirOptions) -> PioResult<()> {
    let root_md = fs::metadata(root).map_err(|e| PioError::from_io(e, root))?;
    if !root_md.is_dir() {
        return Err(PioError::Other {
            path: root.to_string(),
            code: 20,
            msg: "not a directory".to_string(),
        });
    }
    let before = files.len();
    walk(files, Path::new(root), PathBuf::new(), opts)?;
    debug!("list_dir {}: {} entries", root, files.len() - before);
    Ok(())
}

fn walk(files: &mut Vec<PgFile>, base: &Path, prefix: PathBuf, opts: &ListDirOptions) -> PioResult<()> {
    let keep_hidden = opts.symlink_and_hidden || !opts.skip_hidden;
    let skip_log_contents = !opts.backup_logs && prefix.as_os_str().is_empty();
    let mut tablespaces: Vec<(PathBuf, PathBuf)> = Vec::new();

    let walker = WalkDir::new(base)
        .min_depth(1)
        .follow_links(opts.symlink_and_hidden)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            if !keep_hidden && is_hidden(&name) {
                return false;
            }
            if skip_log_contents && e.depth() == 2 {
                let in_log_dir = e
                    .path()
                    .parent()
                    .and_then(|p| p.strip_prefix(base).ok())
                    .map(is_log_dir)
                    .unwrap_or(false);
                if in_log_dir {
                    return false;
                }
            }
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                let path = err.path().map(|p| p.display().to_string()).unwrap_or_default();
                match err.into_io_error() {
                    Some(io) if io.kind() == std::io::ErrorKind::NotFound => continue,
                    Some(io) => return Err(PioError::from_io(io, &path)),
                    None => {
                        return Err(PioError::Other {
                            path,
                            code: 40,
                            msg: "symlink loop".to_string(),
                        })
                    }
                }
            }
        };

        let Ok(rel) = entry.path().strip_prefix(base) else {
            continue;
        };
        let rel_full = prefix.join(rel);

        let md = match entry.metadata() {
            Ok(md) => md,
            Err(_) => continue,
        };
        let mut f = entry_from_metadata(rel_string(&rel_full), &md, opts);

        let parent_is_tblspc = prefix.as_os_str().is_empty()
            && rel.parent().map(|p| p == Path::new(PG_TBLSPC_DIR)).unwrap_or(false);
        if opts.handle_tablespaces && parent_is_tblspc && entry.path_is_symlink() {
            if let Ok(target) = fs::read_link(entry.path()) {
                f.linked = Some(target.to_string_lossy().into_owned());
                f.kind = FileKind::Directory;
                if !opts.symlink_and_hidden {
                    tablespaces.push((entry.path().to_path_buf(), rel_full.clone()));
                }
            }
        }

        files.push(f);
    }

    for (link, rel) in tablespaces {
        walk(files, &link, rel, opts)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_bits_round_trip() {
        let o = ListDirOptions {
            handle_tablespaces: true,
            symlink_and_hidden: false,
            backup_logs: true,
            skip_hidden: true,
            external_dir_num: 3,
        };
        assert_eq!(ListDirOptions::from_bits(o.to_bits(), 3), o);
    }

    #[test]
    fn name_is_last_component() {
        assert_eq!(PgFile::new("base/1/1259", FileKind::Regular).name(), "1259");
        assert_eq!(PgFile::new("PG_VERSION", FileKind::Regular).name(), "PG_VERSION");
    }
}
