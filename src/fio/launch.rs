//! fio/launch: start the helper and hand back a ready client.
//!
//! Command line:
//!   <proto> [-p port] [-l user] [-F ssh_config] [extra options]
//!     -o PasswordAuthentication=no -o Compression=no -o ControlMaster=no
//!     -o LogLevel=error <host> "<remote path>/<program>" agent
//!
//! The child's stdin/stdout carry the protocol; its stderr is drained by a
//! dedicated thread and logged line by line. The handshake runs before
//! `launch_agent` returns, so a returned connection is always Ready.

use std::io::{self, BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use super::client::FioClient;
use super::compat::CompatibilityRecord;
use crate::config::{PioConfig, RemoteConfig};
use crate::consts::{AGENT_PROTOCOL_VERSION, PROGRAM_NAME};
use crate::error::{PioError, PioResult};
use crate::metrics::record_agent_launch;
use crate::pio::RemoteDrive;

const HARDENING_OPTIONS: [&str; 4] = [
    "PasswordAuthentication=no",
    "Compression=no",
    "ControlMaster=no",
    "LogLevel=error",
];

fn needs_quotes(s: &str) -> bool {
    s.contains(' ')
}

/// `<binary> agent` as run on the remote host.
pub fn remote_invocation(remote: &RemoteConfig, program_full: &str) -> String {
    match remote.path.as_deref() {
        Some(dir) => {
            let base = program_full.rsplit('/').next().unwrap_or(program_full);
            if needs_quotes(dir) || needs_quotes(program_full) {
                format!("\"{dir}/{base}\" agent")
            } else {
                format!("{dir}/{base} agent")
            }
        }
        None if needs_quotes(program_full) => format!("\"{program_full}\" agent"),
        None => format!("{program_full} agent"),
    }
}

/// Full argv for the transport program.
pub fn build_ssh_argv(remote: &RemoteConfig, program_full: &str) -> anyhow::Result<Vec<String>> {
    let mut argv = vec![remote.proto.clone()];
    if let Some(port) = &remote.port {
        argv.push("-p".into());
        argv.push(port.clone());
    }
    if let Some(user) = &remote.user {
        argv.push("-l".into());
        argv.push(user.clone());
    }
    if let Some(cfg) = &remote.ssh_config {
        argv.push("-F".into());
        argv.push(cfg.clone());
    }
    argv.extend(remote.extra_options()?);
    for opt in HARDENING_OPTIONS {
        argv.push("-o".into());
        argv.push(opt.into());
    }
    argv.push(remote.host.clone());
    argv.push(remote_invocation(remote, program_full));
    Ok(argv)
}

/// A running helper process plus the client talking to it.
pub struct AgentConnection {
    client: Arc<FioClient>,
    child: Option<Child>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl AgentConnection {
    pub fn client(&self) -> Arc<FioClient> {
        self.client.clone()
    }

    /// Drive backed by this connection.
    pub fn drive(&self) -> RemoteDrive {
        RemoteDrive::new(self.client.clone())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn disconnect(&self) -> PioResult<()> {
        self.client.disconnect()
    }

    /// Disconnect if still connected, then reap the child. When the agent
    /// did not acknowledge DISCONNECT (broken channel or failed exchange) its
    /// input is closed and it is killed before the wait.
    pub fn wait(mut self) -> PioResult<ExitStatus> {
        let clean = match self.client.disconnect() {
            Ok(()) => self.client.is_disconnected(),
            Err(e) => {
                warn!("agent disconnect failed: {}", e);
                false
            }
        };
        let mut child = match self.child.take() {
            Some(c) => c,
            None => return Err(PioError::Protocol("agent process already reaped".into())),
        };
        let pid = child.id();
        if !clean {
            stop_child(&self.client, &mut child);
        }
        let status = child.wait().map_err(PioError::TransportIo)?;
        self.join_drain();
        info!("agent process {} terminated with {}", pid, status);
        Ok(status)
    }

    fn join_drain(&mut self) {
        if let Some(h) = self.stderr_drain.take() {
            if h.join().is_err() {
                warn!("agent stderr reader panicked");
            }
        }
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                let _ = self.client.disconnect();
            }
            if !self.client.is_disconnected() {
                stop_child(&self.client, &mut child);
            }
            match child.wait() {
                Ok(status) => debug!("agent process {} reaped: {}", child.id(), status),
                Err(e) => warn!("cannot reap agent process {}: {}", child.id(), e),
            }
        }
        self.join_drain();
    }
}

/// Close the agent's input and kill it if it is still running.
fn stop_child(client: &FioClient, child: &mut Child) {
    client.close_transport();
    if let Ok(None) = child.try_wait() {
        debug!("killing agent process {}", child.id());
        if let Err(e) = child.kill() {
            warn!("cannot kill agent process {}: {}", child.id(), e);
        }
    }
}

fn spawn_error(argv: &[String], source: io::Error) -> PioError {
    PioError::AgentSpawn {
        cmd: argv.join(" "),
        source,
    }
}

/// Start `argv` with piped stdio and run the handshake against `compat`.
pub fn spawn_agent(argv: &[String], compat: &CompatibilityRecord) -> PioResult<AgentConnection> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| spawn_error(argv, io::Error::new(io::ErrorKind::InvalidInput, "empty command line")))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(argv, e))?;
    record_agent_launch();
    info!(
        "started agent process, pid {}, cmd \"{}\"",
        child.id(),
        argv.last().map(String::as_str).unwrap_or_default()
    );

    let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "child stdio not captured");
    let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
        (Some(i), Some(o), Some(e)) => (i, o, e),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(argv, missing()));
        }
    };

    let pid = child.id();
    let drain = std::thread::Builder::new()
        .name("pgpio-agent-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(l) if l.is_empty() => {}
                    Ok(l) => warn!("agent {}: {}", pid, l),
                    Err(_) => break,
                }
            }
        });
    let drain = match drain {
        Ok(h) => h,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(argv, e));
        }
    };

    match FioClient::connect(Box::new(stdout), Box::new(stdin), AGENT_PROTOCOL_VERSION, compat) {
        Ok(client) => Ok(AgentConnection {
            client: Arc::new(client),
            child: Some(child),
            stderr_drain: Some(drain),
        }),
        Err(e) => {
            warn!("agent handshake failed: {}", e);
            let _ = child.kill();
            let _ = child.wait();
            let _ = drain.join();
            Err(e)
        }
    }
}

/// Launch the helper described by `cfg.remote`.
pub fn launch_agent(cfg: &PioConfig) -> PioResult<AgentConnection> {
    let remote = cfg.remote.as_ref().ok_or(PioError::Unsupported {
        op: "launch_agent",
        backend: "remote (not configured)",
    })?;
    let program_full = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| PROGRAM_NAME.to_string());
    let argv = build_ssh_argv(remote, &program_full).map_err(|e| PioError::AgentSpawn {
        cmd: remote.proto.clone(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
    })?;
    let compat = CompatibilityRecord::local(&cfg.pg_major_version, &cfg.edition);
    spawn_agent(&argv, &compat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_is_quoted_when_needed() {
        let r = RemoteConfig::new("h");
        assert_eq!(remote_invocation(&r, "/usr/bin/pgpio"), "/usr/bin/pgpio agent");
        assert_eq!(remote_invocation(&r, "/opt/my tools/pgpio"), "\"/opt/my tools/pgpio\" agent");

        let r = r.with_path(Some("/srv/pg bin"));
        assert_eq!(remote_invocation(&r, "/usr/bin/pgpio"), "\"/srv/pg bin/pgpio\" agent");
        let r = RemoteConfig::new("h").with_path(Some("/srv"));
        assert_eq!(remote_invocation(&r, "/usr/bin/pgpio"), "/srv/pgpio agent");
    }
}
