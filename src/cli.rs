//! # Command-Line Interface
//!
//! Arguments of the `mps-control` referee binary. The binary exists to run
//! the control plane against a configured fleet: it loads the typed `mps`
//! configuration, optionally overrides the connection mode (handy for dry
//! runs against mockups), and drives the periodic status tick until
//! interrupted.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

use crate::config::ConnectionMode;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the referee configuration (JSON, `mps` section layout)
    #[arg(short, long, default_value = "mps.json", help_heading = "Core Options")]
    pub config: PathBuf,

    /// Override the connection mode of every station
    ///
    /// Useful for running the full control plane without hardware: pass
    /// `mockup` and every configured station is served by the in-process
    /// stub regardless of what the file says.
    #[arg(long, value_enum, help_heading = "Core Options")]
    pub connection: Option<ConnectionMode>,

    /// Override the status tick interval in milliseconds
    #[arg(long, help_heading = "Core Options")]
    pub timer_interval: Option<u64>,

    /// Silence the user-facing output on stdout
    ///
    /// Only the detailed diagnostic log keeps running.
    #[arg(short, long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity.
    ///
    /// Can be used multiple times:
    ///  -v: debug
    ///  -vv: trace
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Detailed log destination: a file path, or "stderr"
    ///
    /// Defaults to a daily-rolled `mps-control.log` in the working directory.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let args = Args::parse_from(["mps-control"]);
        assert_eq!(args.config, PathBuf::from("mps.json"));
        assert!(args.connection.is_none());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
    }

    #[test]
    fn connection_override_parses() {
        let args = Args::parse_from(["mps-control", "--connection", "mockup", "-vv"]);
        assert_eq!(args.connection, Some(ConnectionMode::Mockup));
        assert_eq!(args.verbose, 2);
    }
}
