//! Command-line interface for loadflow.

use clap::Parser;
use std::path::PathBuf;

/// Runs a declarative HTTP load flow against a target until interrupted.
#[derive(Debug, Parser)]
#[command(name = "loadflow", version, about)]
pub struct Cli {
    /// Path to the container config file (YAML, TOML, or JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Overrides the flow document path from the config file.
    #[arg(short, long)]
    pub flow: Option<PathBuf>,

    /// Increases log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Runs a single iteration per simulated user and exits, overriding
    /// the config file's `run_once` setting.
    #[arg(long)]
    pub run_once: bool,
}
