//! control/ops: pg_control helpers over a Drive.
//!
//! Every reader slurps global/pg_control through the drive of the location
//! it was given, validates it, and returns one field. `safe` readers return
//! None / 0 for a missing file instead of failing; a corrupt file is always
//! an error.

use anyhow::{anyhow, Context, Result};
use log::info;

use super::image::{ControlFileImage, RedoParams};
use crate::consts::{PG_VERSION_FILE, XLOG_CONTROL_FILE};
use crate::pio::{join_path, write_all, OpenFlags, PgFile, PioDrive, PioFile, PioWriteFlush};
use crate::util::fmt_lsn;

fn read_control_at(drive: &dyn PioDrive, path: &str, safe: bool) -> Result<Option<ControlFileImage>> {
    let Some(bytes) = drive
        .read_file(path, safe)
        .with_context(|| format!("read control file {}", path))?
    else {
        return Ok(None);
    };
    let image = ControlFileImage::parse(&bytes).with_context(|| format!("control file {}", path))?;
    Ok(Some(image))
}

fn require(image: Option<ControlFileImage>, path: &str) -> Result<ControlFileImage> {
    image.ok_or_else(|| anyhow!("control file {} is missing", path))
}

/// Validated pg_control of `pgdata`; None when missing and `safe`.
pub fn get_control_file(drive: &dyn PioDrive, pgdata: &str, safe: bool) -> Result<Option<ControlFileImage>> {
    read_control_at(drive, &join_path(pgdata, XLOG_CONTROL_FILE), safe)
}

/// Timeline of the last checkpoint; 0 when missing and `safe`.
pub fn get_current_timeline_from_control(drive: &dyn PioDrive, pgdata: &str, safe: bool) -> Result<u32> {
    Ok(get_control_file(drive, pgdata, safe)?
        .map(|c| c.checkpoint_timeline())
        .unwrap_or(0))
}

/// 0 when missing and `safe`.
pub fn get_system_identifier(drive: &dyn PioDrive, pgdata: &str, safe: bool) -> Result<u64> {
    Ok(get_control_file(drive, pgdata, safe)?
        .map(|c| c.system_identifier())
        .unwrap_or(0))
}

pub fn get_xlog_seg_size(drive: &dyn PioDrive, pgdata: &str) -> Result<u32> {
    let path = join_path(pgdata, XLOG_CONTROL_FILE);
    Ok(require(read_control_at(drive, &path, false)?, &path)?.xlog_seg_size())
}

/// 0 when missing and `safe`.
pub fn get_data_checksum_version(drive: &dyn PioDrive, pgdata: &str, safe: bool) -> Result<u32> {
    Ok(get_control_file(drive, pgdata, safe)?
        .map(|c| c.data_checksum_version())
        .unwrap_or(0))
}

/// CRC stored in pg_control (after validation, equal to the computed one).
pub fn get_pgcontrol_checksum(drive: &dyn PioDrive, pgdata: &str) -> Result<u32> {
    let path = join_path(pgdata, XLOG_CONTROL_FILE);
    Ok(require(read_control_at(drive, &path, false)?, &path)?.crc())
}

pub fn get_redo(drive: &dyn PioDrive, pgdata: &str) -> Result<RedoParams> {
    let path = join_path(pgdata, XLOG_CONTROL_FILE);
    Ok(require(read_control_at(drive, &path, false)?, &path)?.redo())
}

/// Major version number from PG_VERSION ("16\n" -> 16, "9.6\n" -> 9).
pub fn get_pg_version(drive: &dyn PioDrive, pgdata: &str) -> Result<u32> {
    let path = join_path(pgdata, PG_VERSION_FILE);
    let bytes = drive
        .read_file(&path, false)
        .with_context(|| format!("read {}", path))?
        .ok_or_else(|| anyhow!("{} is missing", path))?;
    if bytes.is_empty() {
        return Err(anyhow!("{} file is empty", PG_VERSION_FILE));
    }
    let text = String::from_utf8_lossy(&bytes);
    let word = text
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("cannot scan content of {} file", PG_VERSION_FILE))?;
    let digits: String = word.chars().take_while(|c| c.is_ascii_digit()).collect();
    Ok(digits.parse().unwrap_or(0))
}

/// Overwrite `path` with the full fixed-size image (fresh CRC) and fsync it.
pub fn write_control_file(drive: &dyn PioDrive, path: &str, image: &ControlFileImage) -> Result<()> {
    let block = image.serialize();
    let mut file = drive
        .open_default(path, OpenFlags::REWRITE)
        .with_context(|| format!("failed to open file {}", path))?;
    write_all(&mut file, &block).with_context(|| format!("failed to overwrite file {}", path))?;
    file.pio_write_finish()
        .with_context(|| format!("failed to sync file {}", path))?;
    file.close(true)
        .with_context(|| format!("failed to close file {}", path))?;
    Ok(())
}

/// Copy pg_control from the database to the backup with minRecoveryPoint
/// replaced by `stop_backup_lsn`; the entry gets the new CRC.
pub fn set_min_recovery_point(
    db_drive: &dyn PioDrive,
    pgdata: &str,
    backup_drive: &dyn PioDrive,
    backup_path: &str,
    file: &mut PgFile,
    stop_backup_lsn: u64,
) -> Result<()> {
    let src = join_path(pgdata, XLOG_CONTROL_FILE);
    let mut image = require(read_control_at(db_drive, &src, false)?, &src)?;

    info!("Current minRecPoint {}", fmt_lsn(image.min_recovery_point()));
    info!("Setting minRecPoint to {}", fmt_lsn(stop_backup_lsn));
    image.set_min_recovery_point(stop_backup_lsn);

    let dst = join_path(backup_path, XLOG_CONTROL_FILE);
    write_control_file(backup_drive, &dst, &image)?;

    let written = ControlFileImage::parse(&image.serialize()).context("re-validate patched control file")?;
    file.crc = written.crc();
    Ok(())
}

/// Validate `from_fullpath` and copy it as-is (no compression) to
/// `to_fullpath`, annotating crc and sizes.
pub fn copy_pgcontrol_file(
    from_drive: &dyn PioDrive,
    from_fullpath: &str,
    to_drive: &dyn PioDrive,
    to_fullpath: &str,
    file: &mut PgFile,
) -> Result<()> {
    let image = require(read_control_at(from_drive, from_fullpath, false)?, from_fullpath)?;
    let size = image.layout().file_size as i64;

    file.crc = image.crc();
    file.read_size = size;
    file.write_size = size;
    file.uncompressed_size = size;

    write_control_file(to_drive, to_fullpath, &image)
}
