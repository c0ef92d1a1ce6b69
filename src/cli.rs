//! Command-line interface.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Local image-generation job daemon.
#[derive(Debug, Parser)]
#[command(name = "aromad", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config files merged in order; later files override earlier
    /// ones.
    #[arg(
        short,
        long = "config",
        value_name = "FILE",
        global = true,
        default_values_t = [
            String::from("default_config.json"),
            String::from("config.json"),
        ]
    )]
    pub config: Vec<String>,

    /// Increase log detail (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run job cycles until interrupted.
    Run,

    /// Run exactly one job cycle, then exit.
    Once,

    /// Decode an encoded job artifact and print its JSON.
    Decode {
        /// Path to a `.a` artifact file.
        file: PathBuf,
    },
}
