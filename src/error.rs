//! Common error taxonomy for drives, files, the agent protocol and the
//! pg_control digest.
//!
//! Local I/O failures are folded into NotFound / PermissionDenied /
//! AlreadyExists / Other by `io::ErrorKind`. Remote failures arrive as an
//! errno in the response `arg` and are folded with the same function
//! (`from_errno`), so callers see one taxonomy regardless of the backend.

use std::io;
use thiserror::Error;

pub type PioResult<T> = Result<T, PioError>;

/// errno used on the wire when an `io::Error` carries no OS code.
#[cfg(unix)]
const EIO: i32 = libc::EIO;
#[cfg(not(unix))]
const EIO: i32 = 5;

fn version_str(v: &u32) -> String {
    crate::util::program_version_str(*v)
}

#[derive(Debug, Error)]
pub enum PioError {
    // ---- control file digest ----
    #[error("unexpected control file size {actual}, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error(
        "calculated CRC checksum {calculated:#010x} does not match value stored in file {stored:#010x}; \
         either the file is corrupt, or it has a different layout than this program is expecting"
    )]
    ChecksumMismatch { stored: u32, calculated: u32 },

    #[error(
        "possible byte ordering mismatch: pg_control_version {version:#x} is implausible; \
         the pg_control file might have been written on a machine with different byte order"
    )]
    ByteOrderMismatch { version: u32 },

    // ---- agent protocol / handshake ----
    #[error(
        "remote agent protocol version {} does not match local program protocol version {}, consider to upgrade the binary",
        version_str(.remote),
        version_str(.local)
    )]
    ProtocolVersionMismatch { remote: u32, local: u32 },

    #[error("incompatible remote agent params, expected:\n{expected}actual:\n{actual}")]
    CompatibilityMismatch { expected: String, actual: String },

    #[error("agent connection is closed: {reason}")]
    TransportClosed { reason: String },

    #[error("agent transport I/O error: {0}")]
    TransportIo(#[source] io::Error),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("cannot start agent `{cmd}`: {source}")]
    AgentSpawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    // ---- drive / file ----
    #[error("no such file or directory: {path}")]
    NotFound { path: String },

    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("file already exists: {path}")]
    AlreadyExists { path: String },

    #[error("{path}: {msg} (code {code})")]
    Other { path: String, code: i32, msg: String },

    #[error("operation {op} is not supported by the {backend} drive")]
    Unsupported { op: &'static str, backend: &'static str },

    #[error("corruption detected in file \"{path}\", block {blkno}: {msg}")]
    PageCorruption { path: String, blkno: u32, msg: String },

    // ---- filters ----
    #[error("filter error: {0}")]
    Filter(String),
}

impl PioError {
    /// Fold an `io::Error` for `path` into the taxonomy.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => PioError::NotFound { path: path.to_string() },
            io::ErrorKind::PermissionDenied => PioError::PermissionDenied { path: path.to_string() },
            io::ErrorKind::AlreadyExists => PioError::AlreadyExists { path: path.to_string() },
            _ => PioError::Other {
                path: path.to_string(),
                code: err.raw_os_error().unwrap_or(EIO),
                msg: err.to_string(),
            },
        }
    }

    /// Rebuild an error from an errno received from the agent.
    pub fn from_errno(code: i32, path: &str, remote_msg: &str) -> Self {
        let err = io::Error::from_raw_os_error(code);
        match err.kind() {
            io::ErrorKind::NotFound => PioError::NotFound { path: path.to_string() },
            io::ErrorKind::PermissionDenied => PioError::PermissionDenied { path: path.to_string() },
            io::ErrorKind::AlreadyExists => PioError::AlreadyExists { path: path.to_string() },
            _ => PioError::Other {
                path: path.to_string(),
                code,
                msg: if remote_msg.is_empty() {
                    err.to_string()
                } else {
                    remote_msg.to_string()
                },
            },
        }
    }

    /// errno + message pair used to ship this error over the wire.
    pub fn to_errno(&self) -> (i32, String) {
        let code = match self {
            #[cfg(unix)]
            PioError::NotFound { .. } => libc::ENOENT,
            #[cfg(unix)]
            PioError::PermissionDenied { .. } => libc::EACCES,
            #[cfg(unix)]
            PioError::AlreadyExists { .. } => libc::EEXIST,
            #[cfg(not(unix))]
            PioError::NotFound { .. } => 2,
            #[cfg(not(unix))]
            PioError::PermissionDenied { .. } => 13,
            #[cfg(not(unix))]
            PioError::AlreadyExists { .. } => 17,
            PioError::Other { code, .. } => *code,
            _ => EIO,
        };
        let msg = match self {
            PioError::Other { msg, .. } => msg.clone(),
            other => other.to_string(),
        };
        (code, msg)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PioError::NotFound { .. })
    }

    /// True for failures that invalidate the whole agent connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PioError::TransportClosed { .. } | PioError::TransportIo(_) | PioError::Protocol(_)
        )
    }
}
