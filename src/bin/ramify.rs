// src/bin/ramify.rs

//! The `ramify` command.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use ramify::{
    cli::{Cli, handlers},
    core::config_loader::ConfigLoader,
};
use std::env;

/// The main entry point of the `ramify` application.
/// It sets up logging, parses arguments, runs the tests on a tokio runtime,
/// and performs centralized error handling.
fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("\n{}: {}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(run_cli(cli)) {
        Ok(true) => {}
        // Some branch failed. The summary was already printed.
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("\n{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Loads the config, builds the tree, and either lists or runs the branches.
/// Returns `false` when a branch failed.
async fn run_cli(cli: Cli) -> Result<bool> {
    log::debug!("CLI args parsed: {:?}", cli);

    let cwd = env::current_dir().context("Failed to read the current directory")?;
    let config = ConfigLoader::new().resolve(&cwd, cli.config.as_deref(), cli.config_overrides())?;
    let tree = handlers::commons::build_tree(&cli.files, &config)?;

    if cli.list {
        handlers::list::handle(&tree);
        return Ok(true);
    }
    handlers::run::handle(&cli, &config, tree, cwd).await
}
