//! Logging setup and configuration

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Where formatted log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput<'a> {
    /// stderr only
    Console,
    /// Append to a file only; used while the TUI owns the terminal
    File(&'a Path),
    /// stderr and a file
    ConsoleAndFile(&'a Path),
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str, output: LogOutput<'_>) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    let (console, file_path) = match output {
        LogOutput::Console => (true, None),
        LogOutput::File(path) => (false, Some(path)),
        LogOutput::ConsoleAndFile(path) => (true, Some(path)),
    };

    let console_layer = console.then(|| fmt::layer().with_writer(std::io::stderr));

    let file_layer = match file_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to install subscriber: {}", e)))?;

    Ok(())
}

