// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `viztrail`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "viztrail",
    version,
    about = "Run a curation notebook through the viztrail workflow engine.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the engine config file (TOML).
    ///
    /// If the file does not exist, built-in defaults are used.
    #[arg(long, value_name = "PATH", default_value = "Viztrail.toml")]
    pub config: String,

    /// Notebook file (TOML) listing the modules to append, in order.
    #[arg(value_name = "NOTEBOOK")]
    pub notebook: String,

    /// Name of the project created for this notebook.
    #[arg(long, value_name = "NAME", default_value = "notebook")]
    pub name: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `VIZTRAIL_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate config and notebook, print them, but don't execute.
    #[arg(long)]
    pub dry_run: bool,
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
