use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::counter::{CounterSnapshot, CounterSource, FetchError};

pub const PROC_NET_DEV: &str = "/proc/net/dev";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl InterfaceCounters {
    pub fn is_loopback(&self) -> bool {
        self.name == "lo"
    }
}

#[derive(Debug, Error)]
pub enum InterfaceSelectError {
    #[error("No network interfaces found. Re-run with --interface <NAME> or use --all in 'interfaces' to inspect.")]
    NoInterfaces,
    #[error("Multiple network interfaces detected: {}. Please specify --interface <NAME>.", list.join(", "))]
    MultipleInterfaces { list: Vec<String> },
}

pub fn parse_net_dev(text: &str) -> Result<Vec<InterfaceCounters>, FetchError> {
    // two header lines precede the per-interface rows
    text.lines()
        .skip(2)
        .filter(|line| !line.trim().is_empty())
        .map(parse_row)
        .collect()
}

fn parse_row(line: &str) -> Result<InterfaceCounters, FetchError> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| FetchError::Parse(format!("missing ':' in {line:?}")))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 9 {
        return Err(FetchError::Parse(format!(
            "expected at least 9 counters for {}, got {}",
            name.trim(),
            fields.len()
        )));
    }
    let number = |s: &str| {
        s.parse::<u64>()
            .map_err(|e| FetchError::Parse(format!("{s:?} for {}: {e}", name.trim())))
    };
    Ok(InterfaceCounters {
        name: name.trim().to_string(),
        rx_bytes: number(fields[0])?,
        tx_bytes: number(fields[8])?,
    })
}

fn read_net_dev(path: &Path) -> Result<Vec<InterfaceCounters>, FetchError> {
    let text = fs::read_to_string(path).map_err(|source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_net_dev(&text)
}

pub fn list_interfaces(path: &Path, include_loopback: bool) -> Result<Vec<InterfaceCounters>, FetchError> {
    Ok(read_net_dev(path)?
        .into_iter()
        .filter(|iface| include_loopback || !iface.is_loopback())
        .collect())
}

/// An explicit name wins without touching `path`; otherwise the single
/// non-loopback interface is picked.
pub fn select_interface(explicit: &Option<String>, path: &Path) -> Result<String> {
    let names = match explicit {
        Some(_) => Vec::new(),
        None => list_interfaces(path, false)?
            .into_iter()
            .map(|iface| iface.name)
            .collect::<Vec<_>>(),
    };
    Ok(decide_interface(explicit.clone(), names)?)
}

// Pure decision function for easier testing
pub(crate) fn decide_interface(
    explicit: Option<String>,
    available: Vec<String>,
) -> Result<String, InterfaceSelectError> {
    if let Some(name) = explicit {
        return Ok(name);
    }
    match available.len() {
        0 => Err(InterfaceSelectError::NoInterfaces),
        1 => Ok(available[0].clone()),
        _ => Err(InterfaceSelectError::MultipleInterfaces { list: available }),
    }
}

/// Local counter source backed by the kernel's per-interface byte counters.
pub struct ProcNetDevSource {
    path: PathBuf,
    interface: String,
}

impl ProcNetDevSource {
    pub fn new(path: impl Into<PathBuf>, interface: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interface: interface.into(),
        }
    }
}

impl CounterSource for ProcNetDevSource {
    fn fetch(&mut self, cancel: &CancelToken) -> Result<CounterSnapshot, FetchError> {
        cancel.check()?;
        let iface = read_net_dev(&self.path)?
            .into_iter()
            .find(|iface| iface.name == self.interface)
            .ok_or_else(|| FetchError::InterfaceNotFound(self.interface.clone()))?;
        Ok(CounterSnapshot {
            in_bytes: iface.rx_bytes,
            out_bytes: iface.tx_bytes,
            // the kernel keeps these as unsigned long
            is_64bit: cfg!(target_pointer_width = "64"),
        })
    }
}
