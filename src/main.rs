mod backend;
mod cli;
mod codec;
mod config;
mod daemon;
mod pipeline;
mod prompt;
mod store;
mod ui;

use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::backend::SyntheticBackend;
use crate::cli::{Cli, Command};
use crate::config::DaemonConfig;
use crate::daemon::LoopConfig;
use crate::ui::TerminalProgress;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command {
        Command::Run => {
            let mut view = TerminalProgress::new();
            daemon::run(config, SyntheticBackend, &mut view, LoopConfig::default())
        }
        Command::Once => {
            let mut view = TerminalProgress::new();
            let once = LoopConfig { max_cycles: Some(1), ..LoopConfig::default() };
            daemon::run(config, SyntheticBackend, &mut view, once)
        }
        Command::Decode { file } => {
            let artifact = fs::read_to_string(&file)
                .with_context(|| format!("could not read artifact {}", file.display()))?;
            let mask = codec::make_mask(&config.password);
            let decoded = codec::decode(&mask, artifact.trim())
                .with_context(|| format!("could not decode artifact {}", file.display()))?;
            println!("{decoded}");
            Ok(())
        }
    }
}

/// Maps `-v` counts onto an env filter; `RUST_LOG` wins when set and
/// no flag is given. Log lines go to stderr so they never corrupt
/// `decode` output on stdout.
fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
