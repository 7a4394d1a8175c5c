use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use byteorder::{ByteOrder, NativeEndian};
use oorandom::Rand64;

use pgpio::consts::BLCKSZ;
use pgpio::pio::{LocalDrive, PioDrive};
use pgpio::PageBitmap;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("pgpio-pagemap-{prefix}-{pid}-{t}-{id}"))
}

#[test]
fn random_sets_iterate_sorted_and_unique() {
    let mut rng = Rand64::new(0xC0FFEE);
    for round in 0..20 {
        let mut map = PageBitmap::new();
        let mut model = BTreeSet::new();
        for _ in 0..(round * 37) {
            let b = rng.rand_range(0..50_000) as u32;
            map.set(b);
            model.insert(b);
        }
        let got: Vec<u32> = map.iterate().collect();
        let want: Vec<u32> = model.iter().copied().collect();
        assert_eq!(got, want);
        assert_eq!(map.count(), model.len());
        for b in &model {
            assert!(map.is_set(*b));
        }
        for _ in 0..100 {
            let b = rng.rand_range(0..60_000) as u32;
            assert_eq!(map.is_set(b), model.contains(&b));
        }
    }
}

#[test]
fn byte_form_round_trips() {
    let mut map = PageBitmap::new();
    for b in [0u32, 7, 8, 63, 64, 4095] {
        map.set(b);
    }
    let again = PageBitmap::from_bytes(map.as_bytes().to_vec());
    assert_eq!(again, map);
    assert_eq!(again.iterate().collect::<Vec<_>>(), vec![0, 7, 8, 63, 64, 4095]);
}

#[test]
fn lsn_map_from_local_relation_file() -> Result<()> {
    let root = unique_root("lsn");
    fs::create_dir_all(&root)?;
    let path = root.join("16384");

    let lsns = [0x0000_0001_0000_0000u64, 0x10, 0, 0x0000_0002_0000_0010, 0x0000_0001_0000_0001];
    let mut data = Vec::new();
    for lsn in lsns {
        let mut page = vec![0u8; BLCKSZ];
        if lsn != 0 {
            NativeEndian::write_u32(&mut page[0..4], (lsn >> 32) as u32);
            NativeEndian::write_u32(&mut page[4..8], lsn as u32);
        }
        data.extend_from_slice(&page);
    }
    // Torn final page is ignored.
    data.extend_from_slice(&[0xAB; 100]);
    fs::write(&path, &data)?;

    let drive = LocalDrive::new();
    let p = path.to_string_lossy();
    let map = drive.get_lsn_map(&p, 10, 0x0000_0001_0000_0000)?;
    assert_eq!(map.iterate().collect::<Vec<_>>(), vec![0, 3, 4]);

    // n_blocks bounds the scan.
    let map = drive.get_lsn_map(&p, 2, 0)?;
    assert_eq!(map.iterate().collect::<Vec<_>>(), vec![0, 1]);

    fs::remove_dir_all(&root)?;
    Ok(())
}
