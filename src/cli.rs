use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::procfs::PROC_NET_DEV;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List network interfaces with cumulative byte counters
    Interfaces {
        /// Include the loopback interface as well
        #[arg(long)]
        all: bool,
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Counter file to read
        #[arg(long, default_value = PROC_NET_DEV)]
        counters: PathBuf,
    },
    /// Poll an interface and print its traffic rate
    Monitor(Monitor),
}

#[derive(Parser, Clone, Debug)]
pub struct Monitor {
    /// Interface to watch (auto-select if exactly one non-loopback interface exists)
    #[arg(long)]
    pub interface: Option<String>,

    /// Poll interval in seconds
    #[arg(long, default_value_t = 1.0)]
    pub interval: f64,

    /// Spike filter window length (default derived from the interval)
    #[arg(long)]
    pub lag: Option<usize>,

    /// Spike threshold in standard deviations
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Weight of a detected spike when fed back into the window, 0..=1
    #[arg(long)]
    pub influence: Option<f64>,

    /// Counter fetch timeout in seconds
    #[arg(long, default_value_t = 5.0)]
    pub timeout: f64,

    /// Exit after this many rate updates
    #[arg(long)]
    pub count: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Counter file to read
    #[arg(long, default_value = PROC_NET_DEV)]
    pub counters: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}
