// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `pipeline-engine`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pipeline-engine",
    version,
    about = "Run a CI pipeline definition against simulated runners.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the pipeline definition (TOML).
    ///
    /// Default: `pipeline.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "pipeline.toml")]
    pub config: String,

    /// Ref the pipeline runs for. Defaults to the project's default branch.
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// Commit the pipeline runs for.
    #[arg(long, value_name = "SHA", default_value = "0000000000000000000000000000000000000000")]
    pub sha: String,

    /// Make the named job fail when a runner runs it. Repeatable.
    #[arg(long = "fail", value_name = "JOB")]
    pub fail: Vec<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PIPELINE_ENGINE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print stages and jobs, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Give up if the pipeline has not settled after this many seconds.
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    pub timeout_secs: u64,
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
