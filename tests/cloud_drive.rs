use std::sync::Arc;

use anyhow::Result;

use pgpio::filter::{copy_with_filters, GzCompress};
use pgpio::pio::{
    read_to_end, write_all, CloudDrive, Drives, FileKind, ListDirOptions, Location, MemoryObjectStore, ObjectStore,
    OpenFlags, PgFile, PioDrive, PioFile, PioRead, PioWriteFlush,
};
use pgpio::PioError;

fn drive() -> (Arc<MemoryObjectStore>, CloudDrive) {
    let store = Arc::new(MemoryObjectStore::new());
    let drive = CloudDrive::new(store.clone());
    (store, drive)
}

fn rel_paths(files: &[PgFile]) -> Vec<&str> {
    files.iter().map(|f| f.rel_path.as_str()).collect()
}

#[test]
fn objects_are_uploaded_on_close() -> Result<()> {
    let (store, drive) = drive();

    let mut f = drive.open_default("/backup/base/1/1259", OpenFlags::REWRITE)?;
    write_all(&mut f, b"hello world")?;
    assert!(store.get("backup/base/1/1259")?.is_none(), "nothing uploaded before close");
    f.seek(6)?;
    let mut buf = [0u8; 5];
    assert_eq!(f.pio_read(&mut buf)?, 5);
    assert_eq!(&buf, b"world");
    f.truncate(5)?;
    f.close(true)?;
    assert_eq!(store.get("backup/base/1/1259")?.as_deref(), Some(&b"hello"[..]));

    // Append extends the stored object.
    let mut f = drive.open_default("backup/base/1/1259", OpenFlags::WRITE | OpenFlags::APPEND)?;
    write_all(&mut f, b"!!")?;
    f.pio_write_finish()?;
    f.close(false)?;

    let mut f = drive.open_default("backup//base/./1/1259", OpenFlags::READ)?;
    assert_eq!(read_to_end(&mut f)?, b"hello!!");
    let mut small = [0u8; 2];
    assert_eq!(f.pread(&mut small, 5)?, 2);
    assert_eq!(&small, b"!!");
    assert!(matches!(f.pio_write(b"x"), Err(PioError::PermissionDenied { .. })));
    f.close(false)?;
    Ok(())
}

#[test]
fn open_flags_follow_file_semantics() -> Result<()> {
    let (_store, drive) = drive();
    assert!(matches!(drive.open_default("a/b", OpenFlags::READ), Err(PioError::NotFound { .. })));
    drive.write_file("a/b", b"x")?;
    assert!(matches!(
        drive.open_default("a/b", OpenFlags::CREATE | OpenFlags::EXCLUSIVE | OpenFlags::WRITE),
        Err(PioError::AlreadyExists { .. })
    ));
    let f = drive.open_default("a/b", OpenFlags::REWRITE)?;
    f.close(false)?;
    assert_eq!(drive.read_file("a/b", false)?, Some(Vec::new()));
    Ok(())
}

#[test]
fn directories_are_virtual() -> Result<()> {
    let (store, drive) = drive();
    drive.make_dir("backup", 0o700, true)?;
    drive.make_dir("backup/empty", 0o700, true)?;
    assert!(matches!(drive.make_dir("backup/empty", 0o700, true), Err(PioError::AlreadyExists { .. })));
    drive.make_dir("backup/empty", 0o700, false)?;
    assert!(drive.stat("backup/empty", true)?.is_dir());
    assert!(drive.exists("backup")?);

    drive.write_file("backup/data/f1", b"1")?;
    drive.write_file("backup/data/f2", b"22")?;
    assert_eq!(drive.read_dir("backup")?, vec!["data", "empty"]);
    assert_eq!(drive.read_dir("backup/data")?, vec!["f1", "f2"]);
    assert!(drive.read_dir("backup/nope").unwrap_err().is_not_found());

    let st = drive.stat("backup/data/f2", false)?;
    assert_eq!((st.size, st.kind), (2, FileKind::Regular));

    assert!(matches!(
        drive.remove("backup/data", false),
        Err(PioError::Other { code: 39, .. })
    ));
    drive.remove("backup/data/f1", false)?;
    drive.remove("backup/data/f1", true)?;
    assert!(drive.remove("backup/data/f1", false).unwrap_err().is_not_found());
    drive.remove("backup/empty", false)?;
    assert!(!drive.exists("backup/empty")?);

    drive.rename("backup/data/f2", "backup/moved")?;
    assert!(drive.exists("backup/moved")?);
    assert!(!drive.exists("backup/data/f2")?);
    assert!(drive.files_are_same("backup/moved", "/backup/moved")?);
    assert!(!drive.files_are_same("backup/moved", "backup/other")?);

    drive.remove_dir("backup", false)?;
    assert_eq!(store.len(), 1, "root marker is kept");
    drive.remove_dir("backup", true)?;
    assert!(store.is_empty());
    Ok(())
}

#[test]
fn list_dir_synthesises_directories() -> Result<()> {
    let (_store, drive) = drive();
    drive.write_file("pgdata/base/1/1259", &[1u8; 100])?;
    drive.write_file("pgdata/global/pg_control", &[0u8; 8192])?;
    drive.write_file("pgdata/pg_log/postgresql.log", b"log")?;
    drive.write_file("pgdata/.hidden", b"h")?;
    drive.make_dir("pgdata/pg_wal", 0o700, false)?;

    let mut files = Vec::new();
    drive.list_dir(&mut files, "pgdata", &ListDirOptions::pgdata())?;
    assert_eq!(
        rel_paths(&files),
        vec!["base", "base/1", "base/1/1259", "global", "global/pg_control", "pg_log", "pg_wal"]
    );
    let rel = files.iter().find(|f| f.rel_path == "base/1/1259").expect("entry");
    assert_eq!((rel.size, rel.kind), (100, FileKind::Regular));
    assert!(files.iter().filter(|f| f.kind == FileKind::Directory).all(|f| f.size == 0));

    let mut all = Vec::new();
    let opts = ListDirOptions {
        backup_logs: true,
        external_dir_num: 2,
        ..ListDirOptions::default()
    };
    drive.list_dir(&mut all, "pgdata", &opts)?;
    assert!(rel_paths(&all).contains(&".hidden"));
    assert!(rel_paths(&all).contains(&"pg_log/postgresql.log"));
    assert!(all.iter().all(|f| f.external_dir_num == 2));

    let mut none = Vec::new();
    assert!(drive
        .list_dir(&mut none, "missing", &ListDirOptions::default())
        .unwrap_err()
        .is_not_found());
    assert!(matches!(
        drive.list_dir(&mut none, "pgdata/base/1/1259", &ListDirOptions::default()),
        Err(PioError::Other { code: 20, .. })
    ));
    Ok(())
}

#[test]
fn checksums_match_local_definitions() -> Result<()> {
    let (_store, drive) = drive();
    let data = b"relation payload".to_vec();
    drive.write_file("f", &data)?;
    assert_eq!(drive.get_crc32("f", false, false)?, crc32c::crc32c(&data));

    let mut gz = Vec::new();
    copy_with_filters(&mut gz, &mut &data[..], vec![Box::new(GzCompress::new(6))])?;
    drive.write_file("f.gz", &gz)?;
    assert_eq!(drive.get_crc32("f.gz", true, false)?, crc32c::crc32c(&data));

    let mut padded = data.clone();
    padded.resize(data.len() + 4096, 0);
    drive.write_file("padded", &padded)?;
    assert_eq!(drive.get_crc32_truncated("padded", false)?, crc32c::crc32c(&data));

    assert_eq!(drive.get_crc32("missing", false, true)?, 0);
    assert!(drive.get_crc32("missing", false, false).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn host_only_operations_are_unsupported() {
    let (_store, drive) = drive();
    assert!(matches!(drive.symlink("a", "b", false), Err(PioError::Unsupported { op: "symlink", .. })));
    assert!(matches!(drive.chmod("a", 0o600), Err(PioError::Unsupported { op: "chmod", .. })));
    assert!(matches!(drive.readlink("a"), Err(PioError::Unsupported { op: "readlink", .. })));
    assert!(matches!(drive.check_postmaster("pgdata"), Err(PioError::Unsupported { .. })));
    assert!(!drive.is_remote());
}

#[test]
fn drives_route_cloud_location() -> Result<()> {
    let (_store, cloud) = drive();
    let drives = Drives::local_only().with_cloud(Arc::new(cloud));
    let d = drives.drive_for(Location::Cloud)?;
    d.write_file("x/y", b"z")?;
    assert_eq!(d.read_file("x/y", false)?, Some(b"z".to_vec()));
    assert!(!drives.drive_for(Location::Local)?.is_remote());
    Ok(())
}

#[test]
fn offsets_past_the_object_limit_are_rejected() -> Result<()> {
    use pgpio::pio::cloud::MAX_OBJECT_SIZE;

    let (store, drive) = drive();
    let mut f = drive.open_default("backup/huge", OpenFlags::REWRITE)?;
    write_all(&mut f, b"abc")?;

    for res in [f.seek(u64::MAX).map(|_| ()), f.truncate(u64::MAX), f.truncate(MAX_OBJECT_SIZE + 1)] {
        match res {
            Err(PioError::Other { code, .. }) => assert_eq!(code, 27),
            other => panic!("expected EFBIG, got {other:?}"),
        }
    }

    // At the limit the seek succeeds, but nothing may be written past it.
    assert_eq!(f.seek(MAX_OBJECT_SIZE)?, MAX_OBJECT_SIZE);
    assert!(matches!(f.pio_write(b"x"), Err(PioError::Other { code: 27, .. })));

    f.seek(0)?;
    write_all(&mut f, b"xyz")?;
    f.close(true)?;
    assert_eq!(store.get("backup/huge")?.as_deref(), Some(&b"xyz"[..]));
    Ok(())
}

#[test]
fn page_copy_reads_objects() -> Result<()> {
    use pgpio::consts::BLCKSZ;
    use pgpio::page::{PageHeader, PageSelection, SentPage};

    let (_store, drive) = drive();
    let mut data = vec![0u8; 3 * BLCKSZ];
    PageHeader::empty(0x100).write(&mut data[..BLCKSZ]);
    PageHeader::empty(0x200).write(&mut data[2 * BLCKSZ..]);
    drive.write_file("backup/base/1/16390", &data)?;

    let mut blocks = Vec::new();
    let sent = drive.send_pages("backup/base/1/16390", 8, &PageSelection::since(0x150), &mut |page| {
        if let SentPage::Data { blkno, page } = page {
            assert_eq!(page.len(), BLCKSZ);
            blocks.push(blkno);
        }
        Ok(())
    })?;
    assert_eq!(blocks, vec![2]);
    assert_eq!(sent.blocks_read, 3);

    let digests = drive.get_checksum_map("backup/base/1/16390", 8, 0)?;
    assert_eq!(digests.iter().map(|d| d.lsn).collect::<Vec<_>>(), vec![0x100, 0, 0x200]);
    Ok(())
}
