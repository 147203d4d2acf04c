#![deny(unsafe_code)]

mod commands;
mod config;
mod exit_code;
mod output;
mod session;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bucketfs_core::{ConfigError, ErrorKind, FsError};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{cat, ls, mkdir, mv, rm, stat, stats, write};
use crate::config::{BackendChoice, FileConfig};
use crate::session::Session;

/// Inspect and edit a bucketfs namespace through its cache engine
#[derive(Parser)]
#[command(name = "bucketfs")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # List a directory tree exported from local disk
    bucketfs --root /srv/export ls -l /

    # Replace a file with stdin
    echo hello | bucketfs --root /srv/export write /notes/hello.txt

    # Use a config file (S3 and tuning options)
    bucketfs --config bucketfs.toml cat /notes/hello.txt
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML configuration file
    #[arg(long, value_name = "FILE", env = "BUCKETFS_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Backend to use (overrides the config file)
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendChoice>,

    /// Root directory of the native backend
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List directory contents
    Ls(ls::Args),

    /// Show attributes of a file or directory
    Stat(stat::Args),

    /// Write file contents to stdout
    Cat(cat::Args),

    /// Write stdin to a file
    Write(write::Args),

    /// Create a directory
    Mkdir(mkdir::Args),

    /// Remove a file or directory
    Rm(rm::Args),

    /// Move or rename a file or directory
    Mv(mv::Args),

    /// Show cache statistics
    Stats(stats::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(categorize_error(&e))
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let mut config = FileConfig::load(cli.config.as_deref())?;
    config.apply_overrides(cli.backend, cli.root.clone())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bucketfs")
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(execute(cli.command, &config))
}

async fn execute(command: Commands, config: &FileConfig) -> Result<()> {
    let session = Session::open(config).await?;
    let result = match command {
        Commands::Ls(args) => ls::execute(&session, &args).await,
        Commands::Stat(args) => stat::execute(&session, &args).await,
        Commands::Cat(args) => cat::execute(&session, &args).await,
        Commands::Write(args) => write::execute(&session, &args).await,
        Commands::Mkdir(args) => mkdir::execute(&session, &args).await,
        Commands::Rm(args) => rm::execute(&session, &args).await,
        Commands::Mv(args) => mv::execute(&session, &args).await,
        Commands::Stats(args) => stats::execute(&session, &args).await,
    };
    // Flush whatever the command left dirty, even after a failure.
    let closed = session.close().await;
    result?;
    closed
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(fs_err) = cause.downcast_ref::<FsError>() {
            return match fs_err.kind() {
                ErrorKind::NotFound => exit_code::NOT_FOUND,
                ErrorKind::AlreadyExists => exit_code::ALREADY_EXISTS,
                ErrorKind::NotEmpty => exit_code::NOT_EMPTY,
                ErrorKind::IsDirectory | ErrorKind::NotDirectory => exit_code::WRONG_TYPE,
                ErrorKind::InvalidArgument | ErrorKind::InvalidHandle | ErrorKind::Unsupported => {
                    exit_code::INVALID_ARGUMENT
                }
                ErrorKind::BackendTransient | ErrorKind::BackendFatal | ErrorKind::CacheExhausted => {
                    exit_code::BACKEND_FAILED
                }
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return exit_code::CONFIG_INVALID;
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::NotFound
        {
            return exit_code::NOT_FOUND;
        }
    }
    exit_code::GENERAL_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_code_follows_fs_error_through_context() {
        let err = anyhow::Error::new(FsError::NotEmpty("/d".into())).context("Failed to remove /d");
        assert_eq!(categorize_error(&err), exit_code::NOT_EMPTY);
        let err = anyhow::anyhow!("something else");
        assert_eq!(categorize_error(&err), exit_code::GENERAL_ERROR);
    }
}
