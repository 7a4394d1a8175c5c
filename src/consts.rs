//! Shared constants: permissions, block sizes, agent protocol parameters.

/// Directory/File permission defaults.
pub const DIR_PERMISSION: u32 = 0o700;
pub const FILE_PERMISSION: u32 = 0o600;

pub const PROGRAM_NAME: &str = "pgpio";

/// Agent protocol version: major * 10000 + minor * 100 + patch.
/// Bumped whenever an opcode payload layout changes.
pub const AGENT_PROTOCOL_VERSION: u32 = 20_604;

/// PostgreSQL major version this build speaks for (compatibility record).
pub const PG_MAJORVERSION: &str = "16";
pub const PG_VERSION_NUM: u32 = 160_000;

/// Default edition string carried in the compatibility record.
pub const DEFAULT_EDITION: &str = "vanilla";

// ---- PostgreSQL storage geometry ----

pub const BLCKSZ: usize = 8192;
pub const PG_CONTROL_FILE_SIZE: usize = 8192;
pub const XLOG_CONTROL_FILE: &str = "global/pg_control";
pub const PG_VERSION_FILE: &str = "PG_VERSION";
pub const POSTMASTER_PID_FILE: &str = "postmaster.pid";
pub const PG_TBLSPC_DIR: &str = "pg_tblspc";

// ---- Agent transport ----

/// Fixed header: cop u32 | handle u32 | size u32 | arg u32 (LE).
pub const FIO_HDR_SIZE: usize = 16;

/// Chunk size for streamed transfers (send-file, async writes split).
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Upper bound for a single frame payload accepted from the peer.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Pipe buffer size used for the agent's stdio wrappers.
pub const PIPE_SIZE: usize = 64 * 1024;

/// Upper bound on argv entries for the remote transport command line.
pub const MAX_CMDLINE_OPTIONS: usize = 256;

/// `arg` value used by the agent to reject a malformed request or an unknown handle.
pub const FIO_PROTOCOL_VIOLATION: u32 = u32::MAX;

/// Default buffer size for filter wrappers and copy.
pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;
