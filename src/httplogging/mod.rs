//! Access logging.
//!
//! Loggers are built from the `logging` configuration list and see every
//! request passing through the gateway listener. The `apache` type
//! appends NCSA combined-format lines to a file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};

use crate::config::LoggingConfiguration;

/// One completed request, as seen by access loggers.
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub remote_addr: Option<std::net::IpAddr>,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub response_bytes: Option<u64>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Local>,
}

pub trait HttpLogger: Send + Sync {
    fn log(&self, entry: &AccessLogEntry);
}

/// NCSA combined format file logger.
pub struct ApacheLogger {
    file: Mutex<File>,
}

impl ApacheLogger {
    pub fn new(filename: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(filename)
            .with_context(|| format!("could not open access log file '{}'", filename))?;

        Ok(ApacheLogger {
            file: Mutex::new(file),
        })
    }
}

fn combined_line(entry: &AccessLogEntry) -> String {
    let remote = entry
        .remote_addr
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "-".to_string());
    let size = entry
        .response_bytes
        .map(|b| b.to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"",
        remote,
        entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
        entry.method,
        entry.uri,
        entry.status,
        size,
        entry.referer.as_deref().unwrap_or("-"),
        entry.user_agent.as_deref().unwrap_or("-"),
    )
}

impl HttpLogger for ApacheLogger {
    fn log(&self, entry: &AccessLogEntry) {
        let line = combined_line(entry);
        let mut file = self.file.lock().unwrap();
        let _ = writeln!(file, "{}", line);
    }
}

/// Builds the configured access loggers. Unknown types are a
/// configuration error.
pub fn loggers_from_config(configs: &[LoggingConfiguration]) -> Result<Vec<Arc<dyn HttpLogger>>> {
    let mut loggers: Vec<Arc<dyn HttpLogger>> = Vec::with_capacity(configs.len());

    for config in configs {
        match config.kind.as_str() {
            "apache" => loggers.push(Arc::new(ApacheLogger::new(&config.filename)?)),
            other => bail!("unsupported logging type: '{}'", other),
        }
    }

    Ok(loggers)
}
