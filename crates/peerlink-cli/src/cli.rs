//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an in-process discovery and echo session
    Demo {
        /// Number of simulated peers to publish
        #[arg(short, long)]
        peers: Option<usize>,
        /// Message to send to every peer (repeatable)
        #[arg(short, long = "message")]
        messages: Vec<String>,
        /// Identity of the browsing device
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}
