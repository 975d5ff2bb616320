pub mod analytics;
pub mod cli;
pub mod dashboard;
pub mod error;
pub mod game;
pub mod identity;
pub mod remote;
pub mod settings;
pub mod store;
mod utils;

use anyhow::Context;
use clap::Parser;

pub use error::{Result, SimError};

pub fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    // Initialize logging (reads RUST_LOG env var)
    let level = if cli.debug || settings::debug_mode() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    log::info!("A/B simulator starting up...");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(cli::execute(cli))
}
