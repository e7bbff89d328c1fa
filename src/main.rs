mod cancel;
mod cli;
mod clock;
mod config;
mod counter;
mod filter;
mod monitor;
mod procfs;
mod rate;
mod scheduler;
mod service;
mod state;
mod units;
mod window;
mod zscore;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, OutputFormat};
use crate::monitor::run_monitor;
use crate::procfs::{list_interfaces, InterfaceCounters};
use crate::units::format_byte_rate;

fn print_interfaces(all: bool, format: OutputFormat, counters: &std::path::Path) -> Result<()> {
    let interfaces: Vec<InterfaceCounters> = list_interfaces(counters, all)?;
    match format {
        OutputFormat::Text => {
            if interfaces.is_empty() {
                eprintln!("<no interfaces>");
                std::process::exit(2);
            }
            for iface in interfaces {
                println!(
                    "{}\trx {} ({})\ttx {} ({})",
                    iface.name,
                    iface.rx_bytes,
                    format_byte_rate(iface.rx_bytes).trim_end_matches("/s"),
                    iface.tx_bytes,
                    format_byte_rate(iface.tx_bytes).trim_end_matches("/s"),
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&interfaces)?);
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    let result: Result<()> = match cli.command {
        Some(Commands::Interfaces { all, format, counters }) => print_interfaces(all, format, &counters),
        Some(Commands::Monitor(monitor)) => run_monitor(monitor),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        // Map to stable exit codes
        let code = exit_code_for_error(&err);
        eprintln!("error: {err:?}");
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: no interfaces, 3: multiple interfaces, 4: bad configuration, 5: counter source failure, 1: other
    for cause in err.chain() {
        if let Some(sel) = cause.downcast_ref::<crate::procfs::InterfaceSelectError>() {
            return match sel {
                crate::procfs::InterfaceSelectError::NoInterfaces => 2,
                crate::procfs::InterfaceSelectError::MultipleInterfaces { .. } => 3,
            };
        }
        if cause.is::<crate::config::ConfigError>() {
            return 4;
        }
        if cause.is::<crate::counter::FetchError>() {
            return 5;
        }
    }
    1
}
