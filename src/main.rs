//! Binary entry point for the `fly` CLI.

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use fly::{
    AtcClient, AtcError, BuildConfig, BuildConfigError, ConfigError, DEFAULT_BUILD_FILE,
    EventStreamConsumer, FlyConfig, RunError, RunOrchestrator, RunRequest, exit_code, interrupt,
};

mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("orchestrator client error: {0}")]
    Client(#[from] AtcError),
    #[error("build configuration error: {0}")]
    BuildConfig(#[from] BuildConfigError),
    #[error("invalid path {path}: {message}")]
    InvalidPath { path: String, message: String },
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("{0}")]
    Run(#[from] RunError<AtcError>),
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            let code = if err.use_stderr() {
                exit_code::CLIENT_FAULT
            } else {
                exit_code::SUCCEEDED
            };
            process::exit(code);
        }
    };
    init_tracing(cli.verbose);

    let code = match run_command(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            exit_code::CLIENT_FAULT
        }
    };

    process::exit(code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

async fn run_command(cli: Cli) -> Result<i32, CliError> {
    let settings = FlyConfig::load_without_cli_args()?;
    settings.validate()?;
    let client = AtcClient::from_config(&settings)?;

    let dir = resolve_dir(cli.dir.as_deref())?;
    let config_path = cli
        .config
        .map_or_else(|| Ok(dir.join(DEFAULT_BUILD_FILE)), utf8_path)?;
    let config = prepare_build_config(&config_path, cli.args, |name| env::var(name).ok())?;

    let interrupts = interrupt::listen().map_err(CliError::Signals)?;
    let request = RunRequest {
        dir,
        config,
        privileged: settings.privileged,
    };
    let mut consumer = EventStreamConsumer::to_terminal();
    let outcome = RunOrchestrator::new(client)
        .execute(&request, &mut consumer, interrupts)
        .await?;

    Ok(outcome.exit_code())
}

fn prepare_build_config<F>(
    path: &camino::Utf8Path,
    args: Vec<String>,
    lookup: F,
) -> Result<BuildConfig, CliError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = BuildConfig::load(path)?;
    config.apply_env_overrides(lookup);
    config.append_args(args);
    Ok(config)
}

fn resolve_dir(dir: Option<&Path>) -> Result<Utf8PathBuf, CliError> {
    let raw = dir
        .map_or_else(env::current_dir, |path| Ok(path.to_path_buf()))
        .map_err(|err| CliError::InvalidPath {
            path: String::from("."),
            message: err.to_string(),
        })?;
    let canonical = raw.canonicalize().map_err(|err| CliError::InvalidPath {
        path: raw.display().to_string(),
        message: err.to_string(),
    })?;
    if !canonical.is_dir() {
        return Err(CliError::InvalidPath {
            path: canonical.display().to_string(),
            message: String::from("not a directory"),
        });
    }
    utf8_path(canonical)
}

fn utf8_path(path: PathBuf) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path).map_err(|path| CliError::InvalidPath {
        path: path.display().to_string(),
        message: String::from("path is not valid UTF-8"),
    })
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "fly: {err}").ok();
}
