// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `tierflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tierflow",
    version,
    about = "Run dependency-ordered workflow steps with tiered escalation.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workflow file (TOML).
    ///
    /// Default: `Tierflow.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Tierflow.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TIERFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print levels and tiers, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Keep running independent steps after a failure.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Upper bound on concurrently running steps per level.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_concurrency: Option<u64>,

    /// Print the tier a failure type routes to and its fallback chain.
    #[arg(long, value_name = "FAILURE")]
    pub route: Option<String>,
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

impl LogLevel {
    /// Filter directive applied to every target.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
