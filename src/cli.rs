use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use crate::config::PioConfig;
use crate::consts::{AGENT_PROTOCOL_VERSION, XLOG_CONTROL_FILE};
use crate::control::get_control_file;
use crate::filter::{copy_with_filters_buf, CompressAlg, Filter};
use crate::fio::{serve, AgentConnection, AgentOptions, CompatibilityRecord};
use crate::pio::{join_path, Drives, ListDirOptions, Location, OpenFlags, PgFile, PioDrive, PioFile};
use crate::util::{fmt_lsn, program_version_str};

#[derive(Parser, Debug)]
#[command(
    name = "pgpio",
    version,
    about = "Location-transparent storage I/O for PostgreSQL backups",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Where paths live: local, db, backup, remote, cloud.
    #[arg(long, global = true, default_value = "local")]
    location: Location,

    #[command(subcommand)]
    cmd: Cmd,
}

impl Cli {
    /// True when this process serves the agent protocol on stdio.
    pub fn is_agent(&self) -> bool {
        matches!(self.cmd, Cmd::Agent)
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Serve the agent protocol on stdin/stdout.
    Agent,
    /// Validate pg_control and print its summary.
    Control {
        #[arg(long)]
        pgdata: String,
        #[arg(long)]
        json: bool,
    },
    /// CRC32C of a file.
    Crc {
        #[arg(long)]
        path: String,
        /// Content is gzip; checksum the decompressed bytes.
        #[arg(long)]
        compressed: bool,
        /// Ignore a trailing run of zero bytes.
        #[arg(long, conflicts_with = "compressed")]
        truncated: bool,
        #[arg(long)]
        missing_ok: bool,
    },
    /// List a directory tree.
    Ls {
        #[arg(long)]
        root: String,
        /// Data directory rules: skip hidden files and log contents, follow tablespaces.
        #[arg(long)]
        pgdata: bool,
        #[arg(long)]
        json: bool,
    },
    /// Copy a file, optionally through decompression and compression.
    Copy {
        #[arg(long)]
        src: String,
        #[arg(long)]
        dst: String,
        /// Location of dst (defaults to --location).
        #[arg(long)]
        dst_location: Option<Location>,
        #[arg(long, default_value = "none")]
        decompress: CompressAlg,
        #[arg(long, default_value = "none")]
        compress: CompressAlg,
        #[arg(long)]
        level: Option<u32>,
    },
    /// Protocol version and compatibility record of this build.
    Version,
}

/// Drives for this invocation plus the agent connection they may depend on.
struct Session {
    drives: Drives,
    conn: Option<AgentConnection>,
}

impl Session {
    fn open(cfg: &PioConfig) -> Result<Self> {
        let (drives, conn) = Drives::connect(cfg).context("connect drives")?;
        Ok(Self { drives, conn })
    }

    fn drive(&self, loc: Location) -> Result<std::sync::Arc<dyn PioDrive>> {
        self.drives
            .drive_for(loc)
            .with_context(|| format!("no drive for location {}", loc))
    }

    fn finish(self) -> Result<()> {
        if let Some(conn) = self.conn {
            let status = conn.wait()?;
            if !status.success() {
                return Err(anyhow!("agent exited with {}", status));
            }
        }
        Ok(())
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let cfg = PioConfig::from_env();

    match cli.cmd {
        Cmd::Agent => {
            let opts = AgentOptions {
                protocol_version: AGENT_PROTOCOL_VERSION,
                compat: CompatibilityRecord::local(&cfg.pg_major_version, &cfg.edition),
            };
            info!("agent started, pid {}", std::process::id());
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            serve(stdin.lock(), stdout.lock(), opts).context("agent")?;
        }
        Cmd::Control { pgdata, json } => {
            let session = Session::open(&cfg)?;
            let drive = session.drive(cli.location)?;
            let image = get_control_file(drive.as_ref(), &pgdata, false)?
                .ok_or_else(|| anyhow!("{} is missing", join_path(&pgdata, XLOG_CONTROL_FILE)))?;
            let redo = image.redo();
            if json {
                let v = serde_json::json!({
                    "system_identifier": image.system_identifier(),
                    "pg_control_version": image.pg_control_version(),
                    "state": image.state(),
                    "checkpoint": fmt_lsn(image.checkpoint()),
                    "timeline": image.checkpoint_timeline(),
                    "min_recovery_point": fmt_lsn(image.min_recovery_point()),
                    "xlog_seg_size": image.xlog_seg_size(),
                    "data_checksum_version": image.data_checksum_version(),
                    "crc": image.crc(),
                    "redo": {
                        "lsn": fmt_lsn(redo.lsn),
                        "tli": redo.tli,
                        "checksum_version": redo.checksum_version,
                    },
                });
                println!("{}", serde_json::to_string_pretty(&v)?);
            } else {
                println!("pg_control at {}", pgdata);
                println!("  system_identifier     = {}", image.system_identifier());
                println!("  pg_control_version    = {}", image.pg_control_version());
                println!("  state                 = {}", image.state());
                println!("  checkpoint            = {}", fmt_lsn(image.checkpoint()));
                println!("  timeline              = {}", image.checkpoint_timeline());
                println!("  min_recovery_point    = {}", fmt_lsn(image.min_recovery_point()));
                println!("  xlog_seg_size         = {}", image.xlog_seg_size());
                println!("  data_checksum_version = {}", image.data_checksum_version());
                println!("  crc                   = 0x{:08x}", image.crc());
                println!("  redo                  = {} (tli {})", fmt_lsn(redo.lsn), redo.tli);
            }
            session.finish()?;
        }
        Cmd::Crc {
            path,
            compressed,
            truncated,
            missing_ok,
        } => {
            let session = Session::open(&cfg)?;
            let drive = session.drive(cli.location)?;
            let crc = if truncated {
                drive.get_crc32_truncated(&path, missing_ok)?
            } else {
                drive.get_crc32(&path, compressed, missing_ok)?
            };
            println!("{:08x}  {}", crc, path);
            session.finish()?;
        }
        Cmd::Ls { root, pgdata, json } => {
            let session = Session::open(&cfg)?;
            let drive = session.drive(cli.location)?;
            let opts = if pgdata {
                ListDirOptions::pgdata()
            } else {
                ListDirOptions::default()
            };
            let mut files: Vec<PgFile> = Vec::new();
            drive
                .list_dir(&mut files, &root, &opts)
                .with_context(|| format!("list {}", root))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                for f in &files {
                    let link = f.linked.as_deref().map(|l| format!(" -> {l}")).unwrap_or_default();
                    println!("{:>4} {:04o} {:>12} {}{}", f.kind.as_str(), f.mode, f.size, f.rel_path, link);
                }
                println!("{} entries", files.len());
            }
            session.finish()?;
        }
        Cmd::Copy {
            src,
            dst,
            dst_location,
            decompress,
            compress,
            level,
        } => {
            let session = Session::open(&cfg)?;
            let from = session.drive(cli.location)?;
            let to = session.drive(dst_location.unwrap_or(cli.location))?;

            let mut filters: Vec<Box<dyn Filter>> = Vec::new();
            if let Some(f) = decompress.decompressor(false)? {
                filters.push(f);
            }
            if let Some(f) = compress.compressor(level.unwrap_or(cfg.compress_level))? {
                filters.push(f);
            }

            let mut input = from
                .open_default(&src, OpenFlags::READ)
                .with_context(|| format!("open {}", src))?;
            let mut output = to
                .open_default(&dst, OpenFlags::REWRITE)
                .with_context(|| format!("create {}", dst))?;
            let n = copy_with_filters_buf(&mut output, &mut input, filters, cfg.buf_size)
                .with_context(|| format!("copy {} -> {}", src, dst))?;
            output.close(true).with_context(|| format!("close {}", dst))?;
            input.close(false)?;
            println!("copied {} bytes from {} to {}", n, src, dst);
            session.finish()?;
        }
        Cmd::Version => {
            let compat = CompatibilityRecord::local(&cfg.pg_major_version, &cfg.edition);
            println!("pgpio {}", env!("CARGO_PKG_VERSION"));
            println!("protocol {}", program_version_str(AGENT_PROTOCOL_VERSION));
            print!("{}", compat);
        }
    }
    Ok(())
}
