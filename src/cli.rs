//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Authentication & authorization broker
#[derive(Parser, Debug)]
#[command(name = "auth-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AUTH_BROKER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "AUTH_BROKER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "AUTH_BROKER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AUTH_BROKER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AUTH_BROKER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broker server (default)
    Serve,

    /// Decode a proxy assertion or bearer token without verifying it
    Decode {
        /// Header value: base64 proxy assertion, JWT, or `Bearer <jwt>`
        #[arg(required = true)]
        value: String,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["auth-broker"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_decode_with_global_flags() {
        let cli = Cli::try_parse_from(["auth-broker", "decode", "a.b.c", "--log-level", "debug"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Decode { ref value }) if value == "a.b.c"));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn decode_requires_a_value() {
        assert!(Cli::try_parse_from(["auth-broker", "decode"]).is_err());
    }
}
