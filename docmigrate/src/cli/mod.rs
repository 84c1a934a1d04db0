//! Command-line interface

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "docmigrate", version, about = "Import JSON data into a document backend")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every import in the configuration
    Run(RunArgs),
    /// Check the configuration and data files without contacting the backend
    Validate(ValidateArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the TOML configuration
    #[arg(short, long)]
    pub config: PathBuf,

    /// Directory data files are read from (overrides the configuration)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Import into an in-memory backend instead of the configured one
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the TOML configuration
    #[arg(short, long)]
    pub config: PathBuf,

    /// Directory data files are read from (overrides the configuration)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}
