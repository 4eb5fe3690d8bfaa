//! Log records go to stderr and, when configured, to an append-only file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{Level, LevelFilter};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Cannot open log file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),
    #[error(transparent)]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

pub fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => Ok(LevelFilter::Warn),
        other => LevelFilter::from_str(other)
            .map_err(|_| LoggingError::InvalidLevel(level.to_string())),
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug | Level::Trace => "DEBUG",
    }
}

fn format_line(at: DateTime<Utc>, level: Level, target: &str, message: &str) -> String {
    format!(
        "{} {} {target} {message}",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        level_name(level)
    )
}

/// Writes everything to stderr and a file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global logger. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(parse_level(level)?)
        .parse_default_env()
        .format(|buf, record| {
            let line = format_line(
                Utc::now(),
                record.level(),
                record.target(),
                &record.args().to_string(),
            );
            writeln!(buf, "{line}")
        });

    if let Some(path) = log_file {
        let file = open_append(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
    }

    builder.try_init()?;
    Ok(())
}
