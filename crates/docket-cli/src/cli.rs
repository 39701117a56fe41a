use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "docket",
    version,
    about = "Resource-aware task coordination on an in-process cluster"
)]
pub struct Cli {
    /// TOML configuration file; every key is optional
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the resource operation matrix
    Matrix,
    /// Run a small scripted scenario and print every report
    Demo,
    /// Submit the calls described in a JSON file and wait for them
    Run {
        /// JSON array of call descriptions
        #[arg(long)]
        requests: PathBuf,

        /// Submit all calls as one group
        #[arg(long)]
        group: bool,

        /// Give up waiting after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}
