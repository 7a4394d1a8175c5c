//! control: pg_control digest and the helpers built on it.
//!
//! - layout: field offsets of the on-disk image
//! - image:  validated image (size, CRC32C, byte order), field accessors, redo
//! - ops:    read/patch/copy helpers over any Drive

pub mod image;
pub mod layout;
pub mod ops;

pub use image::{control_crc, ControlFileImage, RedoParams};
pub use layout::{ControlLayout, LAYOUT_PG12_16};
pub use ops::{
    copy_pgcontrol_file, get_control_file, get_current_timeline_from_control, get_data_checksum_version,
    get_pg_version, get_pgcontrol_checksum, get_redo, get_system_identifier, get_xlog_seg_size,
    set_min_recovery_point, write_control_file,
};
