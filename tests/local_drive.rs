use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use pgpio::filter::{copy_with_filters, GzCompress};
use pgpio::pio::{
    read_to_end, write_all, FileKind, ListDirOptions, LocalDrive, OpenFlags, PgFile, PioDrive, PioFile, PioRead,
    PioWriteFlush,
};
use pgpio::PioError;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("pgpio-local-{prefix}-{pid}-{t}-{id}"))
}

fn p(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[test]
fn file_read_write_seek_truncate() -> Result<()> {
    let root = unique_root("file");
    fs::create_dir_all(&root)?;
    let drive = LocalDrive::new();
    let path = p(&root.join("f"));

    let mut f = drive.open_default(&path, OpenFlags::REWRITE)?;
    write_all(&mut f, b"hello, world")?;
    f.pio_write_finish()?;
    assert_eq!(f.seek(7)?, 7);
    let mut buf = [0u8; 5];
    assert_eq!(f.pio_read(&mut buf)?, 5);
    assert_eq!(&buf, b"world");
    assert_eq!(f.pread(&mut buf, 0)?, 5);
    assert_eq!(&buf, b"hello");
    f.truncate(5)?;
    f.close(true)?;

    assert_eq!(fs::read(&path)?, b"hello");
    let st = drive.stat(&path, true)?;
    assert_eq!(st.size, 5);
    assert_eq!(st.kind, FileKind::Regular);

    let mut f = drive.open_default(&path, OpenFlags::READ)?;
    assert_eq!(read_to_end(&mut f)?, b"hello");
    f.close(false)?;

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn errors_fold_into_taxonomy() -> Result<()> {
    let root = unique_root("errors");
    fs::create_dir_all(&root)?;
    let drive = LocalDrive::new();
    let missing = p(&root.join("missing"));

    assert!(matches!(drive.open_default(&missing, OpenFlags::READ), Err(PioError::NotFound { .. })));
    assert!(drive.stat(&missing, false).unwrap_err().is_not_found());
    assert!(!drive.exists(&missing)?);
    drive.remove(&missing, true)?;
    assert!(drive.remove(&missing, false).unwrap_err().is_not_found());

    let f = p(&root.join("f"));
    drive.write_file(&f, b"x")?;
    assert!(matches!(
        drive.open_default(&f, OpenFlags::CREATE | OpenFlags::EXCLUSIVE | OpenFlags::WRITE),
        Err(PioError::AlreadyExists { .. })
    ));

    let dir = p(&root.join("d"));
    drive.make_dir(&dir, 0o700, true)?;
    assert!(matches!(drive.make_dir(&dir, 0o700, true), Err(PioError::AlreadyExists { .. })));
    drive.make_dir(&dir, 0o700, false)?;
    drive.make_dir(&p(&root.join("a/b/c")), 0o700, false)?;
    assert!(drive.stat(&p(&root.join("a/b/c")), false)?.is_dir());

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn crc_variants() -> Result<()> {
    let root = unique_root("crc");
    fs::create_dir_all(&root)?;
    let drive = LocalDrive::new();

    let mut data = b"some relation data".to_vec();
    let plain = p(&root.join("plain"));
    drive.write_file(&plain, &data)?;
    assert_eq!(drive.get_crc32(&plain, false, false)?, crc32c::crc32c(&data));

    let gz = p(&root.join("plain.gz"));
    let mut packed = Vec::new();
    copy_with_filters(&mut packed, &mut &data[..], vec![Box::new(GzCompress::new(1))])?;
    drive.write_file(&gz, &packed)?;
    assert_eq!(drive.get_crc32(&gz, true, false)?, crc32c::crc32c(&data));

    let padded = p(&root.join("padded"));
    let clean_crc = crc32c::crc32c(&data);
    data.extend_from_slice(&[0u8; 10_000]);
    drive.write_file(&padded, &data)?;
    assert_eq!(drive.get_crc32_truncated(&padded, false)?, clean_crc);
    assert_ne!(drive.get_crc32(&padded, false, false)?, clean_crc);

    let missing = p(&root.join("missing"));
    assert_eq!(drive.get_crc32(&missing, false, true)?, 0);
    assert_eq!(drive.get_crc32_truncated(&missing, true)?, 0);
    assert!(drive.get_crc32(&missing, false, false).unwrap_err().is_not_found());

    fs::remove_dir_all(&root)?;
    Ok(())
}

fn make_pgdata(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("base/1"))?;
    fs::create_dir_all(root.join("global"))?;
    fs::create_dir_all(root.join("pg_log"))?;
    fs::create_dir_all(root.join("pg_tblspc"))?;
    fs::write(root.join("base/1/1259"), vec![1u8; 8192])?;
    fs::write(root.join("global/pg_control"), vec![0u8; 8192])?;
    fs::write(root.join("pg_log/postgresql.log"), b"log line\n")?;
    fs::write(root.join(".hidden"), b"h")?;
    fs::write(root.join("PG_VERSION"), b"16\n")?;
    Ok(())
}

fn rel_paths(files: &[PgFile]) -> Vec<&str> {
    files.iter().map(|f| f.rel_path.as_str()).collect()
}

#[test]
fn list_dir_follows_pgdata_rules() -> Result<()> {
    let root = unique_root("list");
    let pgdata = root.join("data");
    make_pgdata(&pgdata)?;
    let drive = LocalDrive::new();

    let mut files = Vec::new();
    drive.list_dir(&mut files, &p(&pgdata), &ListDirOptions::pgdata())?;
    let names = rel_paths(&files);
    assert!(names.contains(&"base/1/1259"));
    assert!(names.contains(&"global/pg_control"));
    assert!(names.contains(&"pg_log"), "log dir itself is kept");
    assert!(!names.contains(&"pg_log/postgresql.log"));
    assert!(!names.contains(&".hidden"));
    let rel = files.iter().find(|f| f.rel_path == "base/1/1259").expect("entry");
    assert_eq!(rel.size, 8192);
    assert_eq!(rel.kind, FileKind::Regular);

    let mut all = Vec::new();
    let opts = ListDirOptions {
        backup_logs: true,
        skip_hidden: false,
        external_dir_num: 3,
        ..ListDirOptions::default()
    };
    drive.list_dir(&mut all, &p(&pgdata), &opts)?;
    let names = rel_paths(&all);
    assert!(names.contains(&"pg_log/postgresql.log"));
    assert!(names.contains(&".hidden"));
    assert!(all.iter().all(|f| f.external_dir_num == 3));

    let mut none = Vec::new();
    assert!(drive
        .list_dir(&mut none, &p(&root.join("nope")), &ListDirOptions::default())
        .unwrap_err()
        .is_not_found());

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn listing_two_roots_into_one_vec_keeps_both() -> Result<()> {
    let root = unique_root("two-roots");
    let external = root.join("external");
    fs::create_dir_all(external.join("pg_log"))?;
    fs::write(external.join("pg_log/kept.log"), b"x")?;
    let pgdata = root.join("data");
    make_pgdata(&pgdata)?;
    fs::create_dir_all(pgdata.join("log/nested"))?;
    fs::write(pgdata.join("log/nested/deep.log"), b"y")?;
    let drive = LocalDrive::new();

    let mut files = Vec::new();
    let ext_opts = ListDirOptions {
        backup_logs: true,
        external_dir_num: 1,
        ..ListDirOptions::default()
    };
    drive.list_dir(&mut files, &p(&external), &ext_opts)?;
    drive.list_dir(&mut files, &p(&pgdata), &ListDirOptions::pgdata())?;

    let ext: Vec<&str> = files
        .iter()
        .filter(|f| f.external_dir_num == 1)
        .map(|f| f.rel_path.as_str())
        .collect();
    assert_eq!(ext, vec!["pg_log", "pg_log/kept.log"]);

    let data = rel_paths(&files[ext.len()..]);
    assert!(data.contains(&"pg_log"));
    assert!(data.contains(&"log"));
    assert!(!data.iter().any(|n| n.starts_with("log/") || n.starts_with("pg_log/")), "{data:?}");
    assert!(data.contains(&"base/1/1259"));

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn tablespace_links_are_walked() -> Result<()> {
    let root = unique_root("tblspc");
    let pgdata = root.join("data");
    make_pgdata(&pgdata)?;
    let ts = root.join("ts1");
    fs::create_dir_all(ts.join("PG_16_202307071/5"))?;
    fs::write(ts.join("PG_16_202307071/5/16384"), b"rel")?;
    std::os::unix::fs::symlink(&ts, pgdata.join("pg_tblspc/16400"))?;

    let drive = LocalDrive::new();
    let mut files = Vec::new();
    drive.list_dir(&mut files, &p(&pgdata), &ListDirOptions::pgdata())?;
    let link = files.iter().find(|f| f.rel_path == "pg_tblspc/16400").expect("link entry");
    assert_eq!(link.kind, FileKind::Directory);
    assert_eq!(link.linked.as_deref(), Some(p(&ts).as_str()));
    assert!(rel_paths(&files).contains(&"pg_tblspc/16400/PG_16_202307071/5/16384"));

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[test]
fn remove_dir_keeps_or_drops_root() -> Result<()> {
    let root = unique_root("rmdir");
    make_pgdata(&root)?;
    let drive = LocalDrive::new();

    drive.remove_dir(&p(&root), false)?;
    assert!(root.is_dir());
    assert!(drive.read_dir(&p(&root))?.is_empty());

    drive.remove_dir(&p(&root), true)?;
    assert!(!root.exists());
    // Missing root is fine.
    drive.remove_dir(&p(&root), true)?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn links_modes_and_identity() -> Result<()> {
    let root = unique_root("links");
    fs::create_dir_all(&root)?;
    let drive = LocalDrive::new();
    let target = p(&root.join("target"));
    let link = p(&root.join("link"));
    drive.write_file(&target, b"t")?;

    drive.symlink(&target, &link, false)?;
    assert!(matches!(drive.symlink(&target, &link, false), Err(PioError::AlreadyExists { .. })));
    drive.symlink(&target, &link, true)?;
    assert_eq!(drive.readlink(&link)?, target);
    assert_eq!(drive.stat(&link, false)?.kind, FileKind::Symlink);
    assert_eq!(drive.stat(&link, true)?.kind, FileKind::Regular);
    assert!(drive.files_are_same(&target, &link)?);
    assert!(!drive.files_are_same(&target, &p(&root.join("missing")))?);

    drive.chmod(&target, 0o640)?;
    assert_eq!(drive.stat(&target, true)?.mode & 0o7777, 0o640);

    drive.sync_path(&target)?;
    drive.sync_path(&p(&root))?;
    assert_eq!(drive.read_dir(&p(&root))?, vec!["link", "target"]);
    assert_eq!(drive.read_file(&p(&root.join("missing")), true)?, None);

    fs::remove_dir_all(&root)?;
    Ok(())
}

#[cfg(unix)]
#[test]
fn check_postmaster_reads_pid_file() -> Result<()> {
    let root = unique_root("pm");
    fs::create_dir_all(&root)?;
    let drive = LocalDrive::new();
    let pgdata = p(&root);

    assert_eq!(drive.check_postmaster(&pgdata)?, 0);

    let me = std::process::id();
    fs::write(root.join("postmaster.pid"), format!("{me}\n{pgdata}\n"))?;
    assert_eq!(drive.check_postmaster(&pgdata)?, me);

    fs::write(root.join("postmaster.pid"), "not-a-pid\n")?;
    assert_eq!(drive.check_postmaster(&pgdata)?, 0);

    fs::remove_dir_all(&root)?;
    Ok(())
}
