use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

use pgpio::cli::Cli;
use pgpio::PioError;

/// Exit status for a broken or mismatched agent connection.
const EXIT_CONNECTION: i32 = 2;

/// PIO_LOG, then RUST_LOG. The agent defaults to warnings only and writes
/// bare lines: its stderr is relayed into the launching side's log, which
/// adds its own timestamps and the agent pid.
fn init_logger(agent: bool) {
    let default_level = if agent { "warn" } else { "info" };
    let fallback = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().filter_or("PIO_LOG", fallback);
    let mut builder = Builder::from_env(env);
    if agent {
        builder.format_timestamp(None).format_target(false);
    } else {
        builder.format_timestamp_millis();
    }
    builder.init();
}

fn exit_code(err: &anyhow::Error) -> i32 {
    let connection = err
        .chain()
        .filter_map(|e| e.downcast_ref::<PioError>())
        .any(|e| {
            e.is_connection_error()
                || matches!(e, PioError::ProtocolVersionMismatch { .. } | PioError::CompatibilityMismatch { .. })
        });
    if connection {
        EXIT_CONNECTION
    } else {
        1
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.is_agent());

    if let Err(e) = pgpio::cli::run(cli) {
        error!("{:?}", e);
        std::process::exit(exit_code(&e));
    }
}
