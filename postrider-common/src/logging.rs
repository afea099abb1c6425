//! Logging bootstrap.
//!
//! One compact `tracing` layer, filtered to this project's crates, writing
//! either to stdout or to a file named in the config.

use std::{fs::OpenOptions, io, sync::Mutex};

use chrono::Utc;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    filter::FilterFn,
    fmt::{time::FormatTime, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

use crate::config::{Config, LogLevel};

struct Time;

impl FormatTime for Time {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        w.write_fmt(format_args!("{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ")))
    }
}

/// Installs the global subscriber according to `logLevel` / `logOutput`.
///
/// # Errors
///
/// Fails when the log file cannot be opened.
pub fn init(config: &Config) -> io::Result<()> {
    let level = match config.log_level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warning => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };

    let writer = if config.log_output == "stdout" {
        BoxMakeWriter::new(io::stdout)
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_output)?;
        BoxMakeWriter::new(Mutex::new(file))
    };

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_timer(Time)
                .with_target(false)
                .with_writer(writer)
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("postrider")
                })),
        )
        .try_init()
        .map_err(|err| io::Error::other(err.to_string()))
}
