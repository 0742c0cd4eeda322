//! CLI argument parsing using `clap`.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `bellows`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "bellows",
    version,
    about = "Incremental asset pipeline with file watching and live reload.",
    long_about = None
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the pipeline config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "bellows.toml")]
    pub config: Utf8PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BELLOWS_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the full task graph once; exits non-zero if any task fails.
    Build,
    /// Build, then watch sources, serve the output and push live reloads.
    #[cfg(feature = "live")]
    Watch,
    /// Alias of `watch`.
    #[cfg(feature = "live")]
    Serve,
    /// Remove the output directory and the on-disk caches.
    Clean,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
