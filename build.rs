//! Renders the `fly(1)` manual page from the clap definition the binary
//! parses, so documented flags and exit statuses follow the parser.
//!
//! The page is written to `$OUT_DIR/fly.1`, where release packaging picks it
//! up alongside the binary.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(stdout, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let command = cli::Cli::command().version(env!("CARGO_PKG_VERSION"));
    let page = out_dir.join(format!("{}.1", command.get_name()));
    let mut rendered = Vec::new();
    Man::new(command).render(&mut rendered)?;
    fs::write(page, rendered)?;

    Ok(())
}
