use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chanrec", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $CHANREC_CONFIG, then ./chanrec.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Monitor registered channels and record them until interrupted
    Run,
    /// Register a channel
    Add { name: String },
    /// Unregister a channel
    #[command(alias = "rm")]
    Remove { name: String },
    /// List registered channels
    #[command(alias = "ls")]
    List,
}
