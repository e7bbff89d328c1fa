use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel as channel;
use serde::Serialize;
use tracing::info;

use crate::cli::{Monitor, OutputFormat};
use crate::clock::SystemClock;
use crate::config::{ConfigError, ServiceConfig};
use crate::counter::TimeoutSource;
use crate::filter::FilterParams;
use crate::procfs::{select_interface, ProcNetDevSource};
use crate::rate::TrafficRate;
use crate::service::TrafficRateService;
use crate::units::{format_byte_rate, to_megabits};

pub fn run_monitor(monitor: Monitor) -> Result<()> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let stdout = std::io::stdout();
    run_monitor_with_shutdown(monitor, stop_flag, &mut stdout.lock())
}

/// Seconds from the command line as a non-zero `Duration`.
fn positive_secs(secs: f64, non_positive: ConfigError, out_of_range: ConfigError) -> Result<Duration, ConfigError> {
    if secs.is_nan() || secs <= 0.0 {
        return Err(non_positive);
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if d.is_zero() => Err(non_positive),
        Ok(d) => Ok(d),
        Err(_) => Err(out_of_range),
    }
}

pub(crate) fn service_config(monitor: &Monitor) -> Result<ServiceConfig, ConfigError> {
    let interval = positive_secs(
        monitor.interval,
        ConfigError::NonPositiveInterval,
        ConfigError::IntervalOutOfRange(monitor.interval),
    )?;
    let defaults = FilterParams::for_poll_interval(interval);
    let filter = FilterParams {
        lag: monitor.lag.unwrap_or(defaults.lag),
        threshold: monitor.threshold.unwrap_or(defaults.threshold),
        influence: monitor.influence.unwrap_or(defaults.influence),
    };
    ServiceConfig::new(interval)?.with_filter(filter)
}

pub(crate) fn run_monitor_with_shutdown(
    monitor: Monitor,
    stop_flag: Arc<AtomicBool>,
    out: &mut impl Write,
) -> Result<()> {
    let config = service_config(&monitor)?;
    let fetch_timeout = positive_secs(
        monitor.timeout,
        ConfigError::NonPositiveTimeout,
        ConfigError::TimeoutOutOfRange(monitor.timeout),
    )?;
    let interface = select_interface(&monitor.interface, &monitor.counters)?;
    info!(
        interface = %interface,
        interval = ?config.poll_interval,
        lag = config.filter.lag,
        threshold = config.filter.threshold,
        influence = config.filter.influence,
        "Starting ifrate"
    );

    let source = TimeoutSource::spawn(ProcNetDevSource::new(&monitor.counters, interface.as_str()), fetch_timeout)
        .context("Spawning counter fetch worker")?;
    let service = TrafficRateService::new(source, config, Arc::new(SystemClock))?;
    let rates = service.subscribe();
    service.start().context("Starting poll loop")?;

    let mut emitted: u64 = 0;
    while !stop_flag.load(Ordering::Relaxed) {
        match rates.recv_timeout(Duration::from_millis(200)) {
            Ok(rate) => {
                write_rate(out, &interface, &rate, monitor.format)?;
                emitted += 1;
                if monitor.count.is_some_and(|limit| emitted >= limit) {
                    break;
                }
            }
            Err(channel::RecvTimeoutError::Timeout) => {}
            Err(channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(updates = emitted, "Shutting down");
    service.dispose();
    Ok(())
}

#[derive(Serialize)]
struct RateLine<'a> {
    interface: &'a str,
    #[serde(flatten)]
    rate: &'a TrafficRate,
}

fn write_rate(out: &mut impl Write, interface: &str, rate: &TrafficRate, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => writeln!(
            out,
            "{interface}\tin {:>8.2} Mbit/s ({})\tout {:>8.2} Mbit/s ({})",
            to_megabits(rate.in_bytes_per_sec),
            format_byte_rate(rate.in_bytes_per_sec),
            to_megabits(rate.out_bytes_per_sec),
            format_byte_rate(rate.out_bytes_per_sec),
        )?,
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &RateLine { interface, rate })?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}
