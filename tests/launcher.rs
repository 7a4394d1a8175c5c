use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;

use pgpio::consts::{DEFAULT_EDITION, PG_MAJORVERSION};
use pgpio::fio::{build_ssh_argv, launch_agent, spawn_agent, CompatibilityRecord, FioHeader, Opcode};
use pgpio::pio::PioDrive;
use pgpio::{metrics_snapshot, PioConfig, PioError, RemoteConfig};

fn compat() -> CompatibilityRecord {
    CompatibilityRecord::local(PG_MAJORVERSION, DEFAULT_EDITION)
}

#[test]
fn ssh_command_line_carries_all_options() -> Result<()> {
    let remote = RemoteConfig::new("db1")
        .with_port(Some("2222"))
        .with_user(Some("postgres"))
        .with_ssh_config(Some("/etc/pgpio/ssh_config"))
        .with_ssh_options(Some("-o 'ProxyJump=bastion' -v"))
        .with_path(Some("/usr/pgpro/bin"));
    let argv = build_ssh_argv(&remote, "/opt/pgpio/bin/pgpio")?;
    assert_eq!(
        argv,
        vec![
            "ssh",
            "-p",
            "2222",
            "-l",
            "postgres",
            "-F",
            "/etc/pgpio/ssh_config",
            "-o",
            "ProxyJump=bastion",
            "-v",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "Compression=no",
            "-o",
            "ControlMaster=no",
            "-o",
            "LogLevel=error",
            "db1",
            "/usr/pgpro/bin/pgpio agent",
        ]
    );
    Ok(())
}

#[test]
fn minimal_command_line() -> Result<()> {
    let remote = RemoteConfig::new("h").with_proto("/usr/bin/ssh");
    let argv = build_ssh_argv(&remote, "pgpio")?;
    assert_eq!(argv.first().map(String::as_str), Some("/usr/bin/ssh"));
    assert_eq!(&argv[argv.len() - 2..], ["h", "pgpio agent"]);
    assert!(!argv.iter().any(|a| a == "-p" || a == "-l" || a == "-F"));
    Ok(())
}

#[test]
fn unbalanced_quotes_in_options_are_rejected() {
    let remote = RemoteConfig::new("h").with_ssh_options(Some("-o 'broken"));
    assert!(build_ssh_argv(&remote, "pgpio").is_err());
}

#[test]
fn missing_program_is_a_spawn_error() {
    let argv = vec!["/nonexistent/dir/pgpio-agent".to_string(), "agent".to_string()];
    match spawn_agent(&argv, &compat()) {
        Err(PioError::AgentSpawn { cmd, .. }) => assert!(cmd.contains("pgpio-agent"), "{cmd}"),
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("spawn should fail"),
    }
    assert!(matches!(spawn_agent(&[], &compat()), Err(PioError::AgentSpawn { .. })));
}

#[test]
fn launch_without_remote_is_unsupported() {
    let cfg = PioConfig::default();
    assert!(matches!(launch_agent(&cfg), Err(PioError::Unsupported { .. })));
}

#[cfg(unix)]
#[test]
fn child_that_exits_fails_the_handshake() {
    let argv = vec!["true".to_string()];
    assert!(spawn_agent(&argv, &compat()).is_err());
}

#[test]
fn spawned_agent_serves_and_exits_cleanly() -> Result<()> {
    let before = metrics_snapshot().agent_launches;
    let argv = vec![env!("CARGO_BIN_EXE_pgpio").to_string(), "agent".to_string()];
    let conn = spawn_agent(&argv, &compat())?;
    assert!(conn.pid().is_some());
    assert!(metrics_snapshot().agent_launches > before);

    let drive = conn.drive();
    assert!(drive.is_remote());
    let dir = std::env::temp_dir();
    assert!(drive.exists(&dir.to_string_lossy())?);
    assert!(drive.stat(&dir.to_string_lossy(), true)?.is_dir());

    let status = conn.wait()?;
    assert!(status.success(), "agent exit status {status}");
    Ok(())
}

#[test]
fn wait_reaps_agent_after_stream_desync() -> Result<()> {
    let path = std::env::temp_dir().join(format!("pgpio-launcher-desync-{}", std::process::id()));
    std::fs::write(&path, vec![7u8; 4 * 1024 * 1024])?;
    let path_str = path.to_string_lossy().into_owned();

    let argv = vec![env!("CARGO_BIN_EXE_pgpio").to_string(), "agent".to_string()];
    let conn = spawn_agent(&argv, &compat())?;
    let client = conn.client();

    // A streamed opcode sent as a plain call: the first content frame does
    // not answer the request and the rest of the stream is never read.
    let hdr = FioHeader::new(Opcode::SendFile, 0, path_str.len() as u32, 0);
    let err = client.call(hdr, path_str.as_bytes()).unwrap_err();
    assert!(matches!(err, PioError::Protocol(_)), "{err}");
    assert!(client.is_broken());
    assert!(!client.is_disconnected());

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(conn.wait());
    });
    let status = rx
        .recv_timeout(Duration::from_secs(30))
        .map_err(|_| anyhow::anyhow!("wait() did not return"))??;
    assert!(!status.success(), "agent should have been killed, got {status}");

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn dropping_a_broken_connection_does_not_hang() -> Result<()> {
    let argv = vec![env!("CARGO_BIN_EXE_pgpio").to_string(), "agent".to_string()];
    let conn = spawn_agent(&argv, &compat())?;
    let client = conn.client();
    client.close_transport();
    assert!(client.is_broken());

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        drop(conn);
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(30))
        .map_err(|_| anyhow::anyhow!("drop did not return"))?;
    Ok(())
}

#[test]
fn agent_exit_status_reflects_protocol_failure() -> Result<()> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new(env!("CARGO_BIN_EXE_pgpio"))
        .arg("agent")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let oversized = FioHeader::new(Opcode::Load, 0, u32::MAX, 0);
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&oversized.encode())?;
    }
    let status = child.wait()?;
    assert_eq!(status.code(), Some(2), "{status}");

    let status = Command::new(env!("CARGO_BIN_EXE_pgpio"))
        .args(["control", "--pgdata", "/nonexistent/pgpio/data"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    assert_eq!(status.code(), Some(1), "{status}");
    Ok(())
}
