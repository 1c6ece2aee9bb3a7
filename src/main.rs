use anyhow::Result;
use clap::{Parser, Subcommand};
use std::ffi::OsString;

mod args;
mod clean;
mod client;
mod config;
mod env;
mod logging;
mod login;
mod mcmc;
mod runner;
mod sample;
mod ui;
mod utils;
mod workflow;

use crate::args::CLIArgs;

const CLI_VERSION: &str = match option_env!("COINFER_VERSION_STRING") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

#[derive(Debug, Parser)]
#[command(name = "coinfer", about = "Coinfer workflow client", version = CLI_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the workflow's sampler and stream MCMC draws to the server
    Sample(CLIArgs<sample::SampleArgs>),
    /// Store and validate the auth token
    Login(CLIArgs<login::LoginArgs>),
    /// Remove MCMC data, analysis output and tmp directories
    Clean(CLIArgs<clean::CleanArgs>),
}

impl Commands {
    fn verbose(&self) -> bool {
        match self {
            Commands::Sample(cmd) => cmd.base.verbose,
            Commands::Login(cmd) => cmd.base.verbose,
            Commands::Clean(cmd) => cmd.base.verbose,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let argv: Vec<OsString> = std::env::args_os().collect();
    env::bootstrap_from_args(&argv)?;
    let cli = Cli::parse_from(argv);
    logging::init(cli.command.verbose())?;

    match cli.command {
        Commands::Sample(cmd) => sample::run(cmd.base, cmd.args).await?,
        Commands::Login(cmd) => login::run(cmd.base, cmd.args).await?,
        Commands::Clean(cmd) => clean::run(cmd.base, cmd.args).await?,
    }

    Ok(())
}
