//! Binary entry point: CLI dispatch (§6) in front of the Master supervisor.
//! Exit codes: 0 success, 1 startup/config error, matching §6.

use std::{fs, path::Path, process::ExitCode};

use clap::Parser;
use nix::{sys::signal::{kill, Signal}, unistd::Pid};

use xserver::{
    cli::{Cli, Signal as CliSignal},
    config,
    error::{GatewayError, Result},
    master,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.test_config {
        return match config::load(&cli.config) {
            Ok(_) => {
                println!("configuration OK: {}", cli.config.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("x-server: configuration error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let outcome = if let Some(signal) = cli.signal {
        send_signal(&cli.config, cli.port, signal)
    } else {
        master::run(cli.config, cli.port, cli.foreground)
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("x-server: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `-s {reload|stop|quit}`: translate to HUP/TERM/QUIT and deliver it to the
/// Master pid recorded in the port-scoped pid file (§6 "Persisted state").
fn send_signal(config_path: &Path, port_override: Option<u16>, signal: CliSignal) -> Result<()> {
    let port = match port_override {
        Some(p) => p,
        None => config::load(config_path).map_err(|e| GatewayError::Config(e.to_string()))?.listen_port,
    };

    let pid_path = Path::new("logs").join(format!("x-server.{port}.pid"));
    let pid = fs::read_to_string(&pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or(GatewayError::NotRunning(port))?;

    let unix_signal = match signal {
        CliSignal::Reload => Signal::SIGHUP,
        CliSignal::Stop => Signal::SIGTERM,
        CliSignal::Quit => Signal::SIGQUIT,
    };

    kill(Pid::from_raw(pid), unix_signal).map_err(|_| GatewayError::NotRunning(port))?;
    Ok(())
}
