use anyhow::Result;
use clap::Parser;

use docmigrate::cli::commands::{handle_run_command, handle_validate_command};
use docmigrate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match cli.command {
        Commands::Run(args) => handle_run_command(args).await,
        Commands::Validate(args) => handle_validate_command(args),
    }
}
