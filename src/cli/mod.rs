//! Command-line interface definitions for the `fly` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::Parser;

const EXIT_STATUS: &str = "\
Exit status:
  0  the build succeeded
  1  the build failed
  2  the build errored or was aborted
  3  fly could not submit or follow the build";

/// Top-level CLI for the `fly` binary.
#[derive(Debug, Parser)]
#[command(
    name = "fly",
    about = "Submit a one-off build, stream its output, and exit with its status",
    after_long_help = EXIT_STATUS
)]
pub(crate) struct Cli {
    /// Build configuration file. Defaults to `build.yml` inside the build
    /// directory.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub(crate) config: Option<PathBuf>,
    /// Directory uploaded as the build's input. Defaults to the current
    /// directory.
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    pub(crate) dir: Option<PathBuf>,
    /// Log progress of the submission to stderr.
    #[arg(short = 'v', long)]
    pub(crate) verbose: bool,
    /// Extra arguments appended to the build's run arguments (use -- to
    /// separate flags).
    #[arg(trailing_var_arg = true)]
    pub(crate) args: Vec<String>,
}
