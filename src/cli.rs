//! CLI surface (§6, SPEC_FULL §A.4): `clap` derive over the flag set
//! `spec.md` fixes exactly. Grounded on `kowito-chopin/chopin-cli`'s use of
//! `clap::Parser` derive for a multi-mode command-line tool.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Signal {
    Reload,
    Stop,
    Quit,
}

/// nginx-style HTTP/1.1 gateway: static file delivery and reverse proxying.
// §6 fixes `-v`/`-h` as the version/help shorthand, so the auto-generated
// `-V` version flag is disabled in favor of an explicit `-v` one below.
#[derive(Parser, Debug)]
#[command(name = "x-server", version, about, disable_version_flag = true)]
pub struct Cli {
    /// Override the listen port from the configuration file.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Configuration file path.
    #[arg(short = 'c', long = "config", default_value = "config/gateway_multiprocess.conf")]
    pub config: PathBuf,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Send a control signal to the running Master instead of starting one.
    #[arg(short = 's', long = "signal", value_enum)]
    pub signal: Option<Signal>,

    /// Test the configuration file and exit.
    #[arg(short = 't', long = "test")]
    pub test_config: bool,

    /// Print version information and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: (),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signal_flag() {
        let cli = Cli::parse_from(["x-server", "-s", "reload"]);
        assert_eq!(cli.signal, Some(Signal::Reload));
    }

    #[test]
    fn defaults_config_path() {
        let cli = Cli::parse_from(["x-server"]);
        assert_eq!(cli.config, PathBuf::from("config/gateway_multiprocess.conf"));
        assert!(!cli.foreground);
    }
}
