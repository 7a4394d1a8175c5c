//! Centralized configuration and builder for pgpio.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - PioConfig::from_env() reads the PIO_* variables; fluent setters override.
//! - RemoteConfig describes how to reach the agent (transport program, host,
//!   port, user, ssh config file, free-form extra options, remote binary dir).
//!
//! Env:
//!   PIO_MY_LOCATION      local|db|backup|remote|cloud (default local)
//!   PIO_REMOTE_PROTO     transport program (default "ssh")
//!   PIO_REMOTE_HOST      enables the remote section when set
//!   PIO_REMOTE_PORT / PIO_REMOTE_USER / PIO_REMOTE_PATH
//!   PIO_SSH_CONFIG       passed as -F
//!   PIO_SSH_OPTIONS      extra options, tokenized respecting quotes
//!   PIO_BUF_SIZE         copy/filter buffer size in bytes (default 64 KiB)
//!   PIO_COMPRESS_LEVEL   gzip/zstd level (default 1)
//!   PIO_PG_MAJORVERSION  compatibility record major version
//!   PIO_EDITION          compatibility record edition
//!   PIO_LOG              log filter, read by the binary (falls back to RUST_LOG)

use std::fmt;

use crate::consts::{DEFAULT_BUF_SIZE, DEFAULT_EDITION, PG_MAJORVERSION};
use crate::pio::Location;
use crate::util::{env_string, split_options};

/// How to reach the remote agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Transport program, "ssh" unless overridden.
    pub proto: String,
    pub host: String,
    pub port: Option<String>,
    pub user: Option<String>,
    /// Directory holding the pgpio binary on the remote side.
    pub path: Option<String>,
    pub ssh_config: Option<String>,
    /// Free-form extra transport options ("-o Foo=bar -v").
    pub ssh_options: Option<String>,
}

impl RemoteConfig {
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            proto: "ssh".to_string(),
            host: host.into(),
            port: None,
            user: None,
            path: None,
            ssh_config: None,
            ssh_options: None,
        }
    }

    pub fn with_proto<S: Into<String>>(mut self, proto: S) -> Self {
        self.proto = proto.into();
        self
    }

    pub fn with_port<S: Into<String>>(mut self, port: Option<S>) -> Self {
        self.port = port.map(Into::into);
        self
    }

    pub fn with_user<S: Into<String>>(mut self, user: Option<S>) -> Self {
        self.user = user.map(Into::into);
        self
    }

    pub fn with_path<S: Into<String>>(mut self, path: Option<S>) -> Self {
        self.path = path.map(Into::into);
        self
    }

    pub fn with_ssh_config<S: Into<String>>(mut self, cfg: Option<S>) -> Self {
        self.ssh_config = cfg.map(Into::into);
        self
    }

    pub fn with_ssh_options<S: Into<String>>(mut self, opts: Option<S>) -> Self {
        self.ssh_options = opts.map(Into::into);
        self
    }

    /// Tokenized extra options; errors on unbalanced quotes.
    pub fn extra_options(&self) -> anyhow::Result<Vec<String>> {
        match &self.ssh_options {
            Some(s) => split_options(s),
            None => Ok(Vec::new()),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug)]
pub struct PioConfig {
    /// Which host this process runs on.
    /// Env: PIO_MY_LOCATION (default local)
    pub my_location: Location,

    /// Remote agent settings; None keeps everything local.
    pub remote: Option<RemoteConfig>,

    /// Buffer size for filter wrappers and copy.
    /// Env: PIO_BUF_SIZE (default 64 KiB)
    pub buf_size: usize,

    /// Compression level for gzip/zstd filters.
    /// Env: PIO_COMPRESS_LEVEL (default 1)
    pub compress_level: u32,

    /// Compatibility record: PostgreSQL major version.
    pub pg_major_version: String,

    /// Compatibility record: edition before normalisation.
    pub edition: String,
}

impl Default for PioConfig {
    fn default() -> Self {
        Self {
            my_location: Location::Local,
            remote: None,
            buf_size: DEFAULT_BUF_SIZE,
            compress_level: 1,
            pg_major_version: PG_MAJORVERSION.to_string(),
            edition: DEFAULT_EDITION.to_string(),
        }
    }
}

impl PioConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_string("PIO_MY_LOCATION") {
            match v.parse::<Location>() {
                Ok(loc) => cfg.my_location = loc,
                Err(e) => log::warn!("ignoring PIO_MY_LOCATION: {}", e),
            }
        }

        if let Some(host) = env_string("PIO_REMOTE_HOST") {
            let mut remote = RemoteConfig::new(host);
            if let Some(p) = env_string("PIO_REMOTE_PROTO") {
                remote.proto = p;
            }
            remote.port = env_string("PIO_REMOTE_PORT");
            remote.user = env_string("PIO_REMOTE_USER");
            remote.path = env_string("PIO_REMOTE_PATH");
            remote.ssh_config = env_string("PIO_SSH_CONFIG");
            remote.ssh_options = env_string("PIO_SSH_OPTIONS");
            cfg.remote = Some(remote);
        }

        if let Some(v) = env_string("PIO_BUF_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.buf_size = n;
                }
            }
        }

        if let Some(v) = env_string("PIO_COMPRESS_LEVEL") {
            if let Ok(n) = v.parse::<u32>() {
                cfg.compress_level = n;
            }
        }

        if let Some(v) = env_string("PIO_PG_MAJORVERSION") {
            cfg.pg_major_version = v;
        }
        if let Some(v) = env_string("PIO_EDITION") {
            cfg.edition = v;
        }

        cfg
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_my_location(mut self, loc: Location) -> Self {
        self.my_location = loc;
        self
    }

    pub fn with_remote(mut self, remote: Option<RemoteConfig>) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_buf_size(mut self, n: usize) -> Self {
        self.buf_size = n.max(1);
        self
    }

    pub fn with_compress_level(mut self, level: u32) -> Self {
        self.compress_level = level;
        self
    }

    pub fn with_pg_major_version<S: Into<String>>(mut self, v: S) -> Self {
        self.pg_major_version = v.into();
        self
    }

    pub fn with_edition<S: Into<String>>(mut self, v: S) -> Self {
        self.edition = v.into();
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> Self {
        self
    }
}

impl fmt::Display for PioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PioConfig {{ \
             my_location: {}, \
             remote: {}, \
             buf_size: {}, \
             compress_level: {}, \
             pg_major_version: {}, \
             edition: {} \
             }}",
            self.my_location,
            self.remote
                .as_ref()
                .map(|r| format!(
                    "{}://{}{}{}",
                    r.proto,
                    r.user.as_deref().map(|u| format!("{u}@")).unwrap_or_default(),
                    r.host,
                    r.port.as_deref().map(|p| format!(":{p}")).unwrap_or_default()
                ))
                .unwrap_or_else(|| "none".to_string()),
            self.buf_size,
            self.compress_level,
            self.pg_major_version,
            self.edition,
        )
    }
}

/// Lightweight builder that produces a PioConfig.
#[derive(Clone, Debug)]
pub struct PioConfigBuilder {
    cfg: PioConfig,
}

impl Default for PioConfigBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: PioConfig::from_env(),
        }
    }
}

impl PioConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: PioConfig::default(),
        }
    }

    pub fn my_location(mut self, loc: Location) -> Self {
        self.cfg.my_location = loc;
        self
    }

    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.cfg.remote = Some(remote);
        self
    }

    pub fn buf_size(mut self, n: usize) -> Self {
        self.cfg.buf_size = n.max(1);
        self
    }

    pub fn compress_level(mut self, level: u32) -> Self {
        self.cfg.compress_level = level;
        self
    }

    pub fn build(self) -> PioConfig {
        self.cfg
    }
}
