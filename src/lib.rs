// Base modules
pub mod consts;
pub mod error;
pub mod util;   // src/util/mod.rs
pub mod config;
pub mod metrics;

// Leaf utilities used by backup/restore logic
pub mod control; // src/control/{mod,layout,image,ops}.rs
pub mod pagemap;
pub mod page;    // page header checks, page-level copy

// Byte-stream transforms
pub mod filter;  // src/filter/{mod,gz,zstd,zero_tail}.rs

// Drives/files and the remote agent protocol
pub mod pio;     // src/pio/{mod,local,remote,cloud,listing}.rs
pub mod fio;     // src/fio/{mod,header,compat,client,agent,launch}.rs

pub mod cli;

// Convenience re-exports
pub use config::{PioConfig, PioConfigBuilder, RemoteConfig};
pub use control::{ControlFileImage, ControlLayout, RedoParams};
pub use error::{PioError, PioResult};
pub use filter::{copy_with_filters, CompressAlg, Filter, ReadFilter, WriteFilter};
pub use fio::{launch_agent, AgentConnection, CompatibilityRecord, FioClient};
pub use metrics::{metrics_reset, metrics_snapshot, MetricsSnapshot};
pub use page::{PageSelection, PagesSent, SentPage};
pub use pagemap::PageBitmap;
pub use pio::{
    Drives, FileKind, ListDirOptions, Location, OpenFlags, PgFile, PioDrive, PioFile, PioRead, PioStat,
    PioWriteFlush,
};
