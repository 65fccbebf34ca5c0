// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `dagflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dagflow",
    version,
    about = "Run dependency graphs of tasks with retries, recovery and rerun.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the scheduler config file (TOML).
    ///
    /// A missing `Dagflow.toml` falls back to built-in defaults.
    #[arg(long, value_name = "PATH", default_value = "Dagflow.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DAGFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Compile every `.cpp` under DIR and link the objects into one binary.
    Build {
        /// Source directory to scan recursively.
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Name of the linked binary, placed in DIR.
        #[arg(long, default_value = "app")]
        output: String,

        /// Override `[scheduler].max_concurrent`.
        #[arg(long, short = 'j', value_name = "N")]
        jobs: Option<usize>,

        /// Print the flow in dependency order, but don't execute any commands.
        #[arg(long)]
        dry_run: bool,
    },
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
